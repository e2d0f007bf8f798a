//! Machine-readable completion report and exit-code policy.

use crate::core::config::ViolationMode;
use crate::core::error::Result;
use crate::core::time;
use crate::engine::cascade::Orphan;
use crate::engine::resolver::MigrationPlan;
use crate::engine::run::{MigrationRun, RunError};
use crate::engine::verify::{Collision, VerificationReport, Violation};
use serde::Serialize;
use std::path::Path;

pub const EXIT_CLEAN: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_VIOLATIONS: u8 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub rows: u64,
    pub rows_remapped: u64,
    pub mappings_created: u64,
    pub fk_values_rewritten: u64,
    pub orphans: u64,
    pub unmigrated_keys: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub run_id: Option<String>,
    pub status: String,
    pub mode: ViolationMode,
    pub order: Vec<String>,
    pub tables: Vec<TableReport>,
    pub rows_remapped: u64,
    pub violations: usize,
    pub pre_existing: u64,
    pub introduced: u64,
    pub reported_violations: Vec<Violation>,
    pub collisions: Vec<Collision>,
    pub unmigrated_keys: u64,
    /// Edges a chunked run left for a later invocation.
    pub pending: Vec<String>,
    pub orphans: Vec<Orphan>,
    pub errors: Vec<RunError>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_ms: i64,
    pub verification_ms: u128,
    pub exit_code: u8,
}

impl CompletionReport {
    /// Combine a run (absent for standalone verification) with its
    /// verification pass.
    pub fn build(
        run: Option<&MigrationRun>,
        plan: Option<&MigrationPlan>,
        verification: &VerificationReport,
        mode: ViolationMode,
    ) -> Self {
        let order = plan
            .map(|p| p.order.clone())
            .unwrap_or_else(|| verification.tables.iter().map(|t| t.table.clone()).collect());

        let tables: Vec<TableReport> = verification
            .tables
            .iter()
            .map(|check| {
                let counts = run
                    .and_then(|r| r.counts.get(&check.table))
                    .cloned()
                    .unwrap_or_default();
                TableReport {
                    table: check.table.clone(),
                    rows: check.rows,
                    rows_remapped: counts.rows_remapped,
                    mappings_created: counts.mappings_created,
                    fk_values_rewritten: counts.fk_values_rewritten,
                    orphans: counts.orphans,
                    unmigrated_keys: check.unmigrated_keys,
                }
            })
            .collect();

        let violations = verification.violation_count();
        let unmigrated_keys = verification.unmigrated_keys();
        let exit_code = exit_code(
            mode,
            violations + unmigrated_keys as usize,
            verification.collisions.len(),
        );
        Self {
            run_id: run.map(|r| r.run_id.clone()),
            status: run
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "verified".to_string()),
            mode,
            order,
            rows_remapped: tables.iter().map(|t| t.rows_remapped).sum(),
            tables,
            violations,
            pre_existing: verification.edges.iter().map(|e| e.pre_existing).sum(),
            introduced: verification.edges.iter().map(|e| e.introduced).sum(),
            reported_violations: verification.violations().cloned().collect(),
            collisions: verification.collisions.clone(),
            unmigrated_keys,
            pending: verification.pending.clone(),
            orphans: run
                .map(|r| r.orphans().cloned().collect())
                .unwrap_or_default(),
            errors: run
                .map(|r| {
                    r.errors
                        .iter()
                        .filter(|e| e.orphan.is_none())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            started_at: run.map(|r| time::to_rfc3339(&r.started_at)),
            finished_at: run
                .and_then(|r| r.finished_at.as_ref())
                .map(time::to_rfc3339),
            duration_ms: run.map(|r| r.duration_ms()).unwrap_or(0),
            verification_ms: verification.duration_ms,
            exit_code,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.exit_code == EXIT_CLEAN
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// 0 when clean, 2 for problems in lenient mode, 1 for problems in strict
/// mode (the commit already happened, so this is loud, not undone). Legacy
/// keys left behind count as problems alongside dangling references.
pub fn exit_code(mode: ViolationMode, violations: usize, collisions: usize) -> u8 {
    if violations == 0 && collisions == 0 {
        EXIT_CLEAN
    } else if mode == ViolationMode::Lenient {
        EXIT_VIOLATIONS
    } else {
        EXIT_FAILED
    }
}
