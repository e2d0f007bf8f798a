//! Foreign-key cascade: rewrite referencing columns from the target's mapping.

use crate::core::config::{NotNullOrphanPolicy, OrphanConfig, ViolationMode};
use crate::core::db::{self, quote_ident};
use crate::core::error::{RekeyError, Result};
use crate::engine::graph::ForeignKeyEdge;
use crate::engine::mapping::MappingStore;
use crate::engine::rewrite::Batch;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanAction {
    /// The legacy value was left in place.
    Kept,
    /// Replaced with the configured sentinel.
    Sentinel,
}

/// A referencing value with no mapping in its target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orphan {
    pub table: String,
    pub column: String,
    pub target: String,
    pub value: String,
    pub rows: u64,
    pub action: OrphanAction,
}

/// How orphans are treated for one run.
#[derive(Debug, Clone)]
pub struct OrphanPolicy {
    pub mode: ViolationMode,
    pub not_null: Option<NotNullOrphanPolicy>,
    pub sentinel: Option<String>,
}

impl OrphanPolicy {
    pub fn new(mode: ViolationMode, orphans: &OrphanConfig) -> Self {
        Self {
            mode,
            not_null: orphans.not_null_policy,
            sentinel: orphans.sentinel.clone(),
        }
    }

    fn decide(&self, edge: &ForeignKeyEdge, value: &str, rows: u64) -> Result<OrphanAction> {
        let orphan_error = || RekeyError::OrphanReference {
            table: edge.source_table.clone(),
            column: edge.source_column.clone(),
            target: edge.target_table.clone(),
            value: value.to_string(),
            rows,
        };
        if self.mode == ViolationMode::Strict {
            return Err(orphan_error());
        }
        if !edge.not_null {
            return Ok(OrphanAction::Kept);
        }
        match self.not_null {
            Some(NotNullOrphanPolicy::Fail) => Err(orphan_error()),
            Some(NotNullOrphanPolicy::Keep) => Ok(OrphanAction::Kept),
            Some(NotNullOrphanPolicy::Sentinel) => Ok(OrphanAction::Sentinel),
            None => Err(RekeyError::ConfigError(format!(
                "{} = {} has no mapping and the column is NOT NULL; \
                 set orphans.not_null_policy to fail, keep or sentinel",
                edge, value
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CascadeBatch {
    pub batch: Batch,
    pub orphans: Vec<Orphan>,
}

/// Rewrite up to `limit` distinct legacy values of `edge.source_column`.
///
/// NULLs and values already in the target format are never touched.
pub fn cascade_batch(
    conn: &Connection,
    store: &MappingStore,
    edge: &ForeignKeyEdge,
    policy: &OrphanPolicy,
    cursor: Option<&str>,
    limit: usize,
) -> Result<CascadeBatch> {
    let table = quote_ident(&edge.source_table);
    let col = quote_ident(&edge.source_column);
    let after = if cursor.is_some() {
        format!("AND {col} > ?3")
    } else {
        "AND ?3 IS NULL".to_string()
    };
    let sql = format!(
        "SELECT {col}, COUNT(*) FROM {table}
         WHERE {col} IS NOT NULL AND NOT ({col} GLOB ?1) AND {col} IS NOT ?4 {after}
         GROUP BY {col} ORDER BY {col} LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![
        db::ulid_glob(),
        limit as i64,
        cursor,
        policy.sentinel.as_deref()
    ])?;
    let mut values: Vec<(String, u64)> = Vec::new();
    while let Some(row) = rows.next()? {
        let Some(value) = db::read_id(row.get_ref(0)?, &edge.source_table, &edge.source_column)?
        else {
            continue;
        };
        let count: i64 = row.get(1)?;
        values.push((value, count.max(0) as u64));
    }
    drop(rows);
    drop(stmt);

    let mut update = conn.prepare_cached(&format!("UPDATE {table} SET {col} = ?1 WHERE {col} = ?2"))?;
    let mut out = CascadeBatch::default();
    for (value, count) in &values {
        match store.lookup(conn, &edge.target_table, value)? {
            Some(new_id) => {
                out.batch.rows += update.execute(params![new_id, value])? as u64;
            }
            None => {
                let action = policy.decide(edge, value, *count)?;
                if action == OrphanAction::Sentinel {
                    if let Some(sentinel) = &policy.sentinel {
                        update.execute(params![sentinel, value])?;
                    }
                }
                tracing::warn!(edge = %edge, value = %value, rows = count, ?action, "orphaned reference");
                out.orphans.push(Orphan {
                    table: edge.source_table.clone(),
                    column: edge.source_column.clone(),
                    target: edge.target_table.clone(),
                    value: value.clone(),
                    rows: *count,
                    action,
                });
            }
        }
    }

    out.batch.cursor = values
        .last()
        .map(|(v, _)| v.clone())
        .or_else(|| cursor.map(str::to_string));
    out.batch.done = values.len() < limit;
    tracing::debug!(edge = %edge, rows = out.batch.rows, orphans = out.orphans.len(), "cascaded");
    Ok(out)
}
