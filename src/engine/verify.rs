//! Post-commit verification of referential integrity.
//!
//! Every edge is checked on its own read connection, fanned out over a
//! bounded rayon pool. Small referencing tables are scanned exhaustively;
//! large ones are sampled.

use crate::core::config::VerifyConfig;
use crate::core::db::{self, quote_ident};
use crate::core::error::{RekeyError, Result};
use crate::core::pool::SqlitePool;
use crate::core::schemas::MAPPINGS_TABLE;
use crate::engine::graph::{ForeignKeyEdge, SchemaGraph};
use crate::engine::idgen::is_target_id;
use crate::engine::resolver::MigrationPlan;
use crate::engine::rewrite;
use rayon::prelude::*;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// The dangling value is still in the legacy format: it was an orphan
    /// before the migration.
    PreExisting,
    /// The dangling value is a ULID, so the migration produced it.
    Introduced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub table: String,
    pub column: String,
    pub target: String,
    pub value: String,
    pub rows: u64,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckMethod {
    Exhaustive,
    Sampled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCheck {
    pub edge: String,
    pub method: CheckMethod,
    /// Referencing values examined.
    pub checked: u64,
    /// Distinct dangling values found.
    pub violations: u64,
    pub pre_existing: u64,
    pub introduced: u64,
    /// At most `max_reported` of the dangling values.
    pub reported: Vec<Violation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCheck {
    pub table: String,
    pub rows: u64,
    pub unmigrated_keys: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collision {
    pub table: String,
    pub new_id: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub tables: Vec<TableCheck>,
    pub edges: Vec<EdgeCheck>,
    pub collisions: Vec<Collision>,
    /// Edges left out because the run stopped before migrating both ends.
    #[serde(default)]
    pub pending: Vec<String>,
    pub duration_ms: u128,
}

impl VerificationReport {
    pub fn violation_count(&self) -> usize {
        self.edges.iter().map(|e| e.violations as usize).sum()
    }

    /// Primary keys still in the legacy format across the checked tables.
    pub fn unmigrated_keys(&self) -> u64 {
        self.tables.iter().map(|t| t.unmigrated_keys).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.violation_count() == 0 && self.collisions.is_empty() && self.unmigrated_keys() == 0
    }

    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.edges.iter().flat_map(|e| e.reported.iter())
    }
}

/// Check every table and edge of `graph`.
pub fn verify(
    pool: &SqlitePool,
    graph: &SchemaGraph,
    settings: &VerifyConfig,
    workers: usize,
) -> Result<VerificationReport> {
    verify_scoped(pool, graph, None, settings, workers)
}

/// Check what `plan` migrated. A plan cut short by `--until` only covers its
/// prefix: edges with an end outside it, and deferred edges, are reported as
/// pending instead of checked.
pub fn verify_plan(
    pool: &SqlitePool,
    graph: &SchemaGraph,
    plan: &MigrationPlan,
    settings: &VerifyConfig,
    workers: usize,
) -> Result<VerificationReport> {
    let scope = plan.truncated_at.is_some().then_some(plan);
    verify_scoped(pool, graph, scope, settings, workers)
}

fn verify_scoped(
    pool: &SqlitePool,
    graph: &SchemaGraph,
    prefix: Option<&MigrationPlan>,
    settings: &VerifyConfig,
    workers: usize,
) -> Result<VerificationReport> {
    let started = Instant::now();
    let threads = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| RekeyError::ConfigError(format!("cannot start worker pool: {}", e)))?;

    let covered = |table: &str| prefix.is_none_or(|plan| plan.order.iter().any(|t| t == table));
    let (edges, pending): (Vec<&ForeignKeyEdge>, Vec<&ForeignKeyEdge>) =
        graph.edges().partition(|edge| {
            covered(&edge.source_table)
                && covered(&edge.target_table)
                && prefix.is_none_or(|plan| !plan.is_deferred(edge))
        });
    let pending: Vec<String> = pending.iter().map(|e| e.to_string()).collect();
    let tables: Vec<_> = graph.tables().filter(|t| covered(&t.name)).collect();

    let (tables, edges) = threads.install(|| {
        let tables = tables
            .par_iter()
            .map(|node| {
                pool.with_read(|conn| {
                    Ok(TableCheck {
                        table: node.name.clone(),
                        rows: db::row_count(conn, &node.name)?,
                        unmigrated_keys: rewrite::legacy_count(conn, &node.name, &node.primary_key)?,
                    })
                })
            })
            .collect::<Result<Vec<_>>>();
        let edges = edges
            .par_iter()
            .map(|edge| pool.with_read(|conn| check_edge(conn, graph, edge, settings)))
            .collect::<Result<Vec<_>>>();
        (tables, edges)
    });
    let collisions = pool.with_read(mapping_collisions)?;

    let report = VerificationReport {
        tables: tables?,
        edges: edges?,
        collisions,
        pending,
        duration_ms: started.elapsed().as_millis(),
    };
    tracing::info!(
        edges = report.edges.len(),
        pending = report.pending.len(),
        violations = report.violation_count(),
        collisions = report.collisions.len(),
        duration_ms = report.duration_ms as u64,
        "verification finished"
    );
    Ok(report)
}

fn check_edge(
    conn: &Connection,
    graph: &SchemaGraph,
    edge: &ForeignKeyEdge,
    settings: &VerifyConfig,
) -> Result<EdgeCheck> {
    let target_pk = graph
        .table(&edge.target_table)
        .map(|t| t.primary_key.clone())
        .ok_or_else(|| RekeyError::UnknownTable(edge.target_table.clone()))?;
    let source = quote_ident(&edge.source_table);
    let col = quote_ident(&edge.source_column);
    let target = quote_ident(&edge.target_table);
    let pk = quote_ident(&target_pk);

    let non_null: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {source} WHERE {col} IS NOT NULL"),
        [],
        |row| row.get(0),
    )?;
    let exhaustive = db::row_count(conn, &edge.source_table)? <= settings.exhaustive_limit;

    let (method, checked, sql) = if exhaustive {
        (
            CheckMethod::Exhaustive,
            non_null.max(0) as u64,
            format!(
                "SELECT a.{col}, COUNT(*) FROM {source} a
                 WHERE a.{col} IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM {target} b WHERE b.{pk} = a.{col})
                 GROUP BY a.{col} ORDER BY a.{col}"
            ),
        )
    } else {
        (
            CheckMethod::Sampled,
            (non_null.max(0) as u64).min(settings.sample_size),
            format!(
                "SELECT s.v, COUNT(*) FROM (
                    SELECT {col} AS v FROM {source} WHERE {col} IS NOT NULL
                    ORDER BY RANDOM() LIMIT ?1
                 ) s
                 WHERE NOT EXISTS (SELECT 1 FROM {target} b WHERE b.{pk} = s.v)
                 GROUP BY s.v ORDER BY s.v"
            ),
        )
    };

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = match method {
        CheckMethod::Exhaustive => stmt.query([])?,
        CheckMethod::Sampled => stmt.query([settings.sample_size as i64])?,
    };
    let mut out = EdgeCheck {
        edge: edge.to_string(),
        method,
        checked,
        violations: 0,
        pre_existing: 0,
        introduced: 0,
        reported: Vec::new(),
    };
    while let Some(row) = rows.next()? {
        let Some(value) = db::read_id(row.get_ref(0)?, &edge.source_table, &edge.source_column)?
        else {
            continue;
        };
        let count: i64 = row.get(1)?;
        let kind = if is_target_id(&value) {
            out.introduced += 1;
            ViolationKind::Introduced
        } else {
            out.pre_existing += 1;
            ViolationKind::PreExisting
        };
        out.violations += 1;
        if out.reported.len() < settings.max_reported {
            out.reported.push(Violation {
                table: edge.source_table.clone(),
                column: edge.source_column.clone(),
                target: edge.target_table.clone(),
                value,
                rows: count.max(0) as u64,
                kind,
            });
        }
    }
    if out.violations > 0 {
        tracing::warn!(
            edge = %out.edge,
            violations = out.violations,
            introduced = out.introduced,
            "referential violations"
        );
    }
    Ok(out)
}

/// Duplicate new ids within one table's recorded mapping.
fn mapping_collisions(conn: &Connection) -> Result<Vec<Collision>> {
    if !db::has_bookkeeping(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT table_name, new_id, COUNT(*) FROM {MAPPINGS_TABLE}
         GROUP BY table_name, new_id HAVING COUNT(*) > 1 ORDER BY table_name, new_id"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok(Collision {
            table: row.get(0)?,
            new_id: row.get(1)?,
            count: row.get::<_, i64>(2)?.max(0) as u64,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
