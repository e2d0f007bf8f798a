//! The persisted record of one migration run.

use crate::core::config::{ScopeMode, ViolationMode};
use crate::core::error::{ErrorClass, RekeyError, Result};
use crate::core::schemas::RUNS_TABLE;
use crate::core::time;
use crate::engine::cascade::Orphan;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Committed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in-progress",
            RunStatus::Committed => "committed",
            RunStatus::RolledBack => "rolled-back",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(RunStatus::Pending),
            "in-progress" => Ok(RunStatus::InProgress),
            "committed" => Ok(RunStatus::Committed),
            "rolled-back" => Ok(RunStatus::RolledBack),
            other => Err(RekeyError::ValidationError(format!(
                "unknown run status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work done on one table, counted only once its scope commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub mappings_created: u64,
    pub rows_remapped: u64,
    pub fk_values_rewritten: u64,
    pub orphans: u64,
}

impl TableCounts {
    pub fn merge(&mut self, other: &TableCounts) {
        self.mappings_created += other.mappings_created;
        self.rows_remapped += other.rows_remapped;
        self.fk_values_rewritten += other.fk_values_rewritten;
        self.orphans += other.orphans;
    }

    pub fn is_empty(&self) -> bool {
        *self == TableCounts::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub at: String,
    pub scope: String,
    pub class: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan: Option<Orphan>,
}

impl RunError {
    pub fn from_error(scope: &str, err: &RekeyError) -> Self {
        Self {
            at: time::now_rfc3339(),
            scope: scope.to_string(),
            class: class_name(err.class()).to_string(),
            message: err.to_string(),
            orphan: None,
        }
    }

    pub fn from_orphan(scope: &str, orphan: Orphan) -> Self {
        Self {
            at: time::now_rfc3339(),
            scope: scope.to_string(),
            class: class_name(ErrorClass::DataIntegrity).to_string(),
            message: format!(
                "{}.{} = {} ({} row(s)) has no mapping in {}",
                orphan.table, orphan.column, orphan.value, orphan.rows, orphan.target
            ),
            orphan: Some(orphan),
        }
    }
}

pub fn class_name(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Preflight => "preflight",
        ErrorClass::Transactional => "transactional",
        ErrorClass::DataIntegrity => "data-integrity",
        ErrorClass::Verification => "verification",
        ErrorClass::Environment => "environment",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRun {
    pub run_id: String,
    pub plan_hash: String,
    pub status: RunStatus,
    pub scope_mode: ScopeMode,
    pub violation_mode: ViolationMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: BTreeMap<String, TableCounts>,
    pub errors: Vec<RunError>,
}

impl MigrationRun {
    pub fn new(plan_hash: &str, scope_mode: ScopeMode, violation_mode: ViolationMode) -> Self {
        Self {
            run_id: time::new_event_id(),
            plan_hash: plan_hash.to_string(),
            status: RunStatus::Pending,
            scope_mode,
            violation_mode,
            started_at: time::now(),
            finished_at: None,
            counts: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn merge_counts(&mut self, tally: &BTreeMap<String, TableCounts>) {
        for (table, counts) in tally {
            self.counts.entry(table.clone()).or_default().merge(counts);
        }
    }

    pub fn orphans(&self) -> impl Iterator<Item = &Orphan> {
        self.errors.iter().filter_map(|e| e.orphan.as_ref())
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(time::now());
    }

    pub fn duration_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(time::now);
        (end - self.started_at).num_milliseconds()
    }

    pub fn save(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {RUNS_TABLE} (run_id, plan_hash, status, scope_mode, violation_mode,
                    started_at, finished_at, counts_json, errors_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(run_id) DO UPDATE SET
                    plan_hash = excluded.plan_hash,
                    status = excluded.status,
                    finished_at = excluded.finished_at,
                    counts_json = excluded.counts_json,
                    errors_json = excluded.errors_json"
            ),
            params![
                self.run_id,
                self.plan_hash,
                self.status.as_str(),
                self.scope_mode.as_str(),
                self.violation_mode.as_str(),
                time::to_rfc3339(&self.started_at),
                self.finished_at.as_ref().map(time::to_rfc3339),
                serde_json::to_string(&self.counts)?,
                serde_json::to_string(&self.errors)?,
            ],
        )?;
        Ok(())
    }

    pub fn load(conn: &Connection, run_id: &str) -> Result<Option<Self>> {
        let sql = format!("{} WHERE run_id = ?1", select_runs());
        let raw = conn.query_row(&sql, [run_id], raw_run).optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    /// Most recently started run, if any.
    pub fn latest(conn: &Connection) -> Result<Option<Self>> {
        let sql = format!("{} ORDER BY started_at DESC, run_id DESC LIMIT 1", select_runs());
        let raw = conn.query_row(&sql, [], raw_run).optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    /// The latest run when it did not commit.
    pub fn latest_resumable(conn: &Connection) -> Result<Option<Self>> {
        Ok(Self::latest(conn)?.filter(|run| run.status != RunStatus::Committed))
    }
}

fn select_runs() -> String {
    format!(
        "SELECT run_id, plan_hash, status, scope_mode, violation_mode, started_at, finished_at,
                counts_json, errors_json
         FROM {RUNS_TABLE}"
    )
}

struct RawRun {
    run_id: String,
    plan_hash: String,
    status: String,
    scope_mode: String,
    violation_mode: String,
    started_at: String,
    finished_at: Option<String>,
    counts_json: String,
    errors_json: String,
}

fn raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        plan_hash: row.get(1)?,
        status: row.get(2)?,
        scope_mode: row.get(3)?,
        violation_mode: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        counts_json: row.get(7)?,
        errors_json: row.get(8)?,
    })
}

impl RawRun {
    fn into_run(self) -> Result<MigrationRun> {
        let started_at = time::parse_rfc3339(&self.started_at).ok_or_else(|| {
            RekeyError::ValidationError(format!(
                "run {} has an unreadable start time '{}'",
                self.run_id, self.started_at
            ))
        })?;
        Ok(MigrationRun {
            status: RunStatus::parse(&self.status)?,
            scope_mode: parse_enum(&self.scope_mode)?,
            violation_mode: parse_enum(&self.violation_mode)?,
            started_at,
            finished_at: self.finished_at.as_deref().and_then(time::parse_rfc3339),
            counts: serde_json::from_str(&self.counts_json)?,
            errors: serde_json::from_str(&self.errors_json)?,
            run_id: self.run_id,
            plan_hash: self.plan_hash,
        })
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(
        raw.to_string(),
    ))?)
}
