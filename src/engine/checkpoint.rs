//! Durable per-unit checkpoints.
//!
//! A checkpoint is always written on the connection of the scope it
//! describes, so it commits or rolls back with that scope's rows.

use crate::core::error::Result;
use crate::core::schemas::CHECKPOINTS_TABLE;
use crate::core::time;
use rusqlite::{Connection, params};
use rustc_hash::FxHashSet;
use serde::Serialize;

pub const STATUS_IN_PROGRESS: &str = "in-progress";
pub const STATUS_COMMITTED: &str = "committed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub unit: String,
    pub status: String,
    pub rows_processed: u64,
    pub updated_at: String,
}

impl Checkpoint {
    pub fn is_committed(&self) -> bool {
        self.status == STATUS_COMMITTED
    }
}

pub fn record(
    conn: &Connection,
    run_id: &str,
    unit: &str,
    status: &str,
    rows_processed: u64,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {CHECKPOINTS_TABLE} (run_id, unit, status, rows_processed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id, unit) DO UPDATE SET
                status = excluded.status,
                rows_processed = excluded.rows_processed,
                updated_at = excluded.updated_at"
        ),
        params![
            run_id,
            unit,
            status,
            rows_processed as i64,
            time::now_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn committed_units(conn: &Connection, run_id: &str) -> Result<FxHashSet<String>> {
    Ok(list(conn, run_id)?
        .into_iter()
        .filter(|c| c.is_committed())
        .map(|c| c.unit)
        .collect())
}

pub fn list(conn: &Connection, run_id: &str) -> Result<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT run_id, unit, status, rows_processed, updated_at FROM {CHECKPOINTS_TABLE}
         WHERE run_id = ?1 ORDER BY updated_at, unit"
    ))?;
    let rows = stmt.query_map([run_id], |row| {
        Ok(Checkpoint {
            run_id: row.get(0)?,
            unit: row.get(1)?,
            status: row.get(2)?,
            rows_processed: row.get::<_, i64>(3)?.max(0) as u64,
            updated_at: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
