//! Transaction coordinator: drives the plan through scoped transactions.
//!
//! The coordinator owns the only write connection. Every mutation happens in
//! a scope (whole run, one unit, or one batch) that commits together with its
//! checkpoint row. A failed scope rolls back completely; retryable failures
//! are re-attempted with backoff up to the configured budget.

use crate::core::audit::AuditLog;
use crate::core::config::{RekeyConfig, ScopeMode};
use crate::core::db;
use crate::core::error::{RekeyError, Result};
use crate::core::pool::{self, SqlitePool};
use crate::engine::cascade::{self, Orphan, OrphanPolicy};
use crate::engine::checkpoint::{self, STATUS_COMMITTED, STATUS_IN_PROGRESS};
use crate::engine::graph::{ForeignKeyEdge, SchemaGraph, TableNode};
use crate::engine::idgen::{Clock, IdGenerator, IdScheme, SystemClock};
use crate::engine::mapping::{self, MappingStore};
use crate::engine::resolver::{MigrationPlan, Unit};
use crate::engine::rewrite::{self, Batch};
use crate::engine::run::{MigrationRun, RunError, RunStatus, TableCounts};
use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cooperative cancellation, checked before every batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub scope: String,
    pub phase: &'static str,
    pub table: String,
    pub rows: u64,
    pub done: bool,
}

/// Receives one event per completed batch (before its scope commits).
pub trait Progress: Send {
    fn on_batch(&self, event: &ProgressEvent);
}

#[derive(Debug, Default)]
pub struct TracingProgress;

impl Progress for TracingProgress {
    fn on_batch(&self, event: &ProgressEvent) {
        tracing::debug!(
            scope = %event.scope,
            phase = event.phase,
            table = %event.table,
            rows = event.rows,
            done = event.done,
            "batch"
        );
    }
}

/// JSON lines on stderr, for `--progress`.
#[derive(Debug, Default)]
pub struct JsonLinesProgress;

impl Progress for JsonLinesProgress {
    fn on_batch(&self, event: &ProgressEvent) {
        TracingProgress.on_batch(event);
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{}", line);
        }
    }
}

pub struct RunOptions {
    pub resume: bool,
    pub cancel: CancelToken,
    pub progress: Box<dyn Progress>,
    pub clock: Box<dyn Clock>,
    pub audit: Option<AuditLog>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            cancel: CancelToken::new(),
            progress: Box::new(TracingProgress),
            clock: Box::new(SystemClock),
            audit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase<'g> {
    Generate(&'g TableNode),
    Rewrite(&'g TableNode),
    Cascade(&'g ForeignKeyEdge),
}

impl Phase<'_> {
    fn name(&self) -> &'static str {
        match self {
            Phase::Generate(_) => "generate",
            Phase::Rewrite(_) => "rewrite",
            Phase::Cascade(_) => "cascade",
        }
    }

    fn table(&self) -> &str {
        match self {
            Phase::Generate(node) | Phase::Rewrite(node) => &node.name,
            Phase::Cascade(edge) => &edge.source_table,
        }
    }
}

struct Coordinator<'a> {
    graph: &'a SchemaGraph,
    plan: &'a MigrationPlan,
    config: &'a RekeyConfig,
    store: MappingStore,
    ids: IdGenerator,
    policy: OrphanPolicy,
    cancel: CancelToken,
    progress: Box<dyn Progress>,
    audit: Option<AuditLog>,
    run: MigrationRun,
    /// Counts and orphans of the open scope; merged into `run` on commit.
    tally: BTreeMap<String, TableCounts>,
    orphans: Vec<(String, Orphan)>,
}

/// Execute `plan` against the database behind `pool`.
///
/// The returned run is committed. On failure the run is persisted as
/// rolled-back before the error is returned, so it can be resumed.
pub fn execute(
    pool: &SqlitePool,
    graph: &SchemaGraph,
    plan: &MigrationPlan,
    config: &RekeyConfig,
    opts: RunOptions,
) -> Result<MigrationRun> {
    let mut conn = pool.open_write()?;
    let scheme = IdScheme::new(config.legacy_pattern.as_deref())?;
    for table in &plan.order {
        let node = graph
            .table(table)
            .ok_or_else(|| RekeyError::UnknownTable(table.clone()))?;
        rewrite::preflight(&conn, node, &scheme)?;
    }

    let run = if opts.resume {
        resumable_run(&conn, plan)?
    } else {
        MigrationRun::new(&plan.plan_hash, config.scope, config.mode)
    };
    db::ensure_bookkeeping(&conn)?;

    let mut ids = IdGenerator::with_clock(opts.clock, config.max_clock_drift_ms);
    if let Some(last) = mapping::last_issued(&conn)? {
        ids = ids.resume_after(last);
    }

    let mut coordinator = Coordinator {
        graph,
        plan,
        config,
        store: MappingStore::new(&run.run_id, config.mapping.cache_entries),
        ids,
        policy: OrphanPolicy::new(config.mode, &config.orphans),
        cancel: opts.cancel,
        progress: opts.progress,
        audit: opts.audit,
        run,
        tally: BTreeMap::new(),
        orphans: Vec::new(),
    };
    coordinator.run.status = RunStatus::InProgress;
    coordinator.run.save(&conn)?;
    tracing::info!(
        run_id = %coordinator.run.run_id,
        resume = opts.resume,
        scope = config.scope.as_str(),
        mode = config.mode.as_str(),
        tables = plan.order.len(),
        "migration started"
    );

    match coordinator.drive(&mut conn) {
        Ok(()) => {
            coordinator.run.finish(RunStatus::Committed);
            coordinator.run.save(&conn)?;
            tracing::info!(
                run_id = %coordinator.run.run_id,
                duration_ms = coordinator.run.duration_ms(),
                "migration committed"
            );
            Ok(coordinator.run)
        }
        Err(err) => {
            coordinator
                .run
                .errors
                .push(RunError::from_error("run", &err));
            coordinator.run.finish(RunStatus::RolledBack);
            if let Err(save_err) = coordinator.run.save(&conn) {
                tracing::error!(error = %save_err, "failed to persist rolled-back run");
            }
            tracing::error!(run_id = %coordinator.run.run_id, error = %err, "migration rolled back");
            Err(err)
        }
    }
}

fn resumable_run(conn: &Connection, plan: &MigrationPlan) -> Result<MigrationRun> {
    if !db::has_bookkeeping(conn)? {
        return Err(RekeyError::NothingToResume);
    }
    let run = MigrationRun::latest_resumable(conn)?.ok_or(RekeyError::NothingToResume)?;
    if run.plan_hash != plan.plan_hash {
        return Err(RekeyError::PlanChanged { run_id: run.run_id });
    }
    tracing::info!(run_id = %run.run_id, status = %run.status, "resuming run");
    Ok(run)
}

impl<'a> Coordinator<'a> {
    fn drive(&mut self, conn: &mut Connection) -> Result<()> {
        let committed = checkpoint::committed_units(conn, &self.run.run_id)?;
        let mut units = Vec::new();
        for unit in self.plan.units() {
            if committed.contains(&unit.key()) {
                tracing::info!(unit = %unit, "unit already committed, skipping");
            } else {
                units.push(unit);
            }
        }

        match self.config.scope {
            ScopeMode::Single => {
                if units.is_empty() {
                    return Ok(());
                }
                let run_id = self.run.run_id.clone();
                self.scoped(conn, "run", |this, tx, started| {
                    for unit in &units {
                        let rows = this.run_unit(tx, unit, started)?;
                        checkpoint::record(tx, &run_id, &unit.key(), STATUS_COMMITTED, rows)?;
                    }
                    Ok(())
                })
            }
            ScopeMode::PerTable => {
                for unit in &units {
                    let key = unit.key();
                    let run_id = self.run.run_id.clone();
                    self.scoped(conn, &key, |this, tx, started| {
                        let rows = this.run_unit(tx, unit, started)?;
                        checkpoint::record(tx, &run_id, &key, STATUS_COMMITTED, rows)
                    })?;
                }
                Ok(())
            }
            ScopeMode::PerBatch => {
                for unit in &units {
                    self.run_unit_batched(conn, unit)?;
                }
                Ok(())
            }
        }
    }

    /// Phases of a unit, in execution order.
    fn phases(&self, unit: &Unit) -> Result<Vec<Phase<'a>>> {
        let graph: &'a SchemaGraph = self.graph;
        let plan: &'a MigrationPlan = self.plan;
        match unit {
            Unit::Table(name) => {
                let node = graph
                    .table(name)
                    .ok_or_else(|| RekeyError::UnknownTable(name.clone()))?;
                let mut phases = vec![Phase::Generate(node), Phase::Rewrite(node)];
                phases.extend(plan.self_edges_of(&node.name).map(Phase::Cascade));
                phases.extend(
                    node.outgoing
                        .iter()
                        .filter(|e| !e.is_self() && !plan.is_deferred(e))
                        .map(Phase::Cascade),
                );
                Ok(phases)
            }
            Unit::Deferred => Ok(plan.deferred_edges.iter().map(Phase::Cascade).collect()),
        }
    }

    /// Run every phase of `unit` to completion on one connection.
    fn run_unit(&mut self, conn: &Connection, unit: &Unit, started: Instant) -> Result<u64> {
        let key = unit.key();
        let mut rows = 0;
        for phase in self.phases(unit)? {
            let mut cursor: Option<String> = None;
            loop {
                let batch = self.step(conn, &key, phase, cursor.as_deref(), started)?;
                rows += batch.rows;
                cursor = batch.cursor;
                if batch.done {
                    break;
                }
            }
        }
        Ok(rows)
    }

    /// One scope per batch, then a final scope marking the unit committed.
    fn run_unit_batched(&mut self, conn: &mut Connection, unit: &Unit) -> Result<()> {
        let key = unit.key();
        let run_id = self.run.run_id.clone();
        let mut processed = 0u64;
        for phase in self.phases(unit)? {
            let mut cursor: Option<String> = None;
            loop {
                let batch = self.scoped(conn, &key, |this, tx, started| {
                    let batch = this.step(tx, &key, phase, cursor.as_deref(), started)?;
                    checkpoint::record(
                        tx,
                        &run_id,
                        &key,
                        STATUS_IN_PROGRESS,
                        processed + batch.rows,
                    )?;
                    Ok(batch)
                })?;
                processed += batch.rows;
                cursor = batch.cursor;
                if batch.done {
                    break;
                }
            }
        }
        self.scoped(conn, &key, |_, tx, _| {
            checkpoint::record(tx, &run_id, &key, STATUS_COMMITTED, processed)
        })
    }

    fn step(
        &mut self,
        conn: &Connection,
        scope: &str,
        phase: Phase<'a>,
        cursor: Option<&str>,
        started: Instant,
    ) -> Result<Batch> {
        if self.cancel.is_cancelled() {
            return Err(RekeyError::Cancelled);
        }
        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(self.config.scope_timeout_secs) {
            return Err(RekeyError::ScopeTimeout {
                scope: scope.to_string(),
                elapsed_ms: elapsed.as_millis(),
            });
        }

        let limit = self.config.batch_size;
        let batch = match phase {
            Phase::Generate(node) => {
                let batch =
                    rewrite::generate_batch(conn, &self.store, &mut self.ids, node, cursor, limit)?;
                self.counts(&node.name).mappings_created += batch.rows;
                batch
            }
            Phase::Rewrite(node) => {
                let batch = rewrite::rewrite_batch(conn, node, cursor, limit)?;
                self.counts(&node.name).rows_remapped += batch.rows;
                batch
            }
            Phase::Cascade(edge) => {
                let out =
                    cascade::cascade_batch(conn, &self.store, edge, &self.policy, cursor, limit)?;
                let counts = self.counts(&edge.source_table);
                counts.fk_values_rewritten += out.batch.rows;
                counts.orphans += out.orphans.len() as u64;
                self.orphans
                    .extend(out.orphans.into_iter().map(|o| (scope.to_string(), o)));
                out.batch
            }
        };

        self.progress.on_batch(&ProgressEvent {
            run_id: self.run.run_id.clone(),
            scope: scope.to_string(),
            phase: phase.name(),
            table: phase.table().to_string(),
            rows: batch.rows,
            done: batch.done,
        });
        Ok(batch)
    }

    fn counts(&mut self, table: &str) -> &mut TableCounts {
        self.tally.entry(table.to_string()).or_default()
    }

    /// Run `body` inside an immediate transaction, retrying retryable failures.
    fn scoped<R>(
        &mut self,
        conn: &mut Connection,
        scope: &str,
        mut body: impl FnMut(&mut Self, &Connection, Instant) -> Result<R>,
    ) -> Result<R> {
        let budget = self.config.retry_budget;
        pool::retry_with_backoff(scope, budget, |attempt| {
            let started = Instant::now();
            self.tally.clear();
            self.orphans.clear();
            let result = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(RekeyError::from)
                .and_then(|tx| {
                    let value = body(self, &*tx, started)?;
                    tx.commit()?;
                    Ok(value)
                });
            match result {
                Ok(value) => {
                    self.on_commit(conn, scope);
                    Ok(value)
                }
                Err(err) => {
                    self.on_rollback(scope, attempt, &err);
                    Err(err)
                }
            }
        })
    }

    fn on_commit(&mut self, conn: &Connection, scope: &str) {
        self.store.commit_scope();
        let tally = std::mem::take(&mut self.tally);
        let rows: u64 = tally
            .values()
            .map(|c| c.rows_remapped + c.fk_values_rewritten)
            .sum();
        self.run.merge_counts(&tally);
        for (orphan_scope, orphan) in self.orphans.drain(..) {
            self.run.errors.push(RunError::from_orphan(&orphan_scope, orphan));
        }
        if let Err(e) = self.run.save(conn) {
            tracing::warn!(scope, error = %e, "failed to persist run counts");
        }
        self.audit(scope, "committed", rows, None);
        tracing::info!(scope, rows, "scope committed");
    }

    fn on_rollback(&mut self, scope: &str, attempt: u32, err: &RekeyError) {
        self.store.rollback_scope();
        self.tally.clear();
        self.orphans.clear();
        let detail = err.to_string();
        self.audit(scope, "rolled-back", 0, Some(&detail));
        tracing::warn!(scope, attempt, error = %err, "scope rolled back");
    }

    fn audit(&self, scope: &str, status: &str, rows: u64, detail: Option<&str>) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.record(&self.run.run_id, scope, status, rows, detail) {
                tracing::warn!(path = %log.path().display(), error = %e, "audit write failed");
            }
        }
    }
}

/// What a dry run reports per table.
#[derive(Debug, Clone, Serialize)]
pub struct TablePreview {
    pub table: String,
    pub rows: u64,
    pub legacy_keys: u64,
    pub legacy_references: u64,
    pub self_edges: usize,
}

/// Plan statistics computed on read connections, without writing anything.
pub fn preview(
    pool: &SqlitePool,
    graph: &SchemaGraph,
    plan: &MigrationPlan,
    config: &RekeyConfig,
) -> Result<Vec<TablePreview>> {
    let scheme = IdScheme::new(config.legacy_pattern.as_deref())?;
    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| RekeyError::ConfigError(format!("cannot start worker pool: {}", e)))?;
    workers.install(|| {
        plan.order
            .par_iter()
            .map(|table| {
                let node = graph
                    .table(table)
                    .ok_or_else(|| RekeyError::UnknownTable(table.clone()))?;
                pool.with_read(|conn| {
                    rewrite::preflight(conn, node, &scheme)?;
                    let mut legacy_references = 0;
                    for edge in &node.outgoing {
                        legacy_references +=
                            rewrite::legacy_count(conn, &edge.source_table, &edge.source_column)?;
                    }
                    Ok(TablePreview {
                        table: table.clone(),
                        rows: db::row_count(conn, table)?,
                        legacy_keys: rewrite::legacy_count(conn, table, &node.primary_key)?,
                        legacy_references,
                        self_edges: plan.self_edges_of(table).count(),
                    })
                })
            })
            .collect()
    })
}
