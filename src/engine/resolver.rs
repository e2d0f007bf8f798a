//! Dependency resolution over the schema graph.
//!
//! Kahn's algorithm over the non-self edges with a name-ordered ready set, so
//! the same graph always yields the same order. Self edges never block their
//! own table. A cycle across two or more tables is fatal unless the operator
//! names edges to defer.

use crate::core::config::DeferredEdgeConfig;
use crate::core::error::{RekeyError, Result};
use crate::engine::graph::{ForeignKeyEdge, SchemaGraph};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// One strongly connected group of tables that cannot be linearized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleComponent {
    pub tables: Vec<String>,
    pub edges: Vec<ForeignKeyEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub components: Vec<CycleComponent>,
    /// Tables that only wait on a cycle without being part of one.
    pub blocked: Vec<String>,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .components
            .iter()
            .map(|c| {
                let edges: Vec<String> = c.edges.iter().map(|e| e.to_string()).collect();
                format!("[{}] via {}", c.tables.join(", "), edges.join("; "))
            })
            .collect();
        write!(f, "{}", parts.join(" | "))?;
        if !self.blocked.is_empty() {
            write!(f, " (blocked: {})", self.blocked.join(", "))?;
        }
        write!(f, "; name edges under deferred_edges to break the cycle")
    }
}

/// A unit of work the coordinator commits and checkpoints as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Unit {
    Table(String),
    Deferred,
}

impl Unit {
    pub fn key(&self) -> String {
        match self {
            Unit::Table(name) => format!("table:{}", name),
            Unit::Deferred => "deferred".to_string(),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Ordered work for one run. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub order: Vec<String>,
    pub self_edges: Vec<ForeignKeyEdge>,
    /// Cross-table edges applied after every table has its mapping.
    pub deferred_edges: Vec<ForeignKeyEdge>,
    pub truncated_at: Option<String>,
    pub plan_hash: String,
}

impl MigrationPlan {
    pub fn units(&self) -> Vec<Unit> {
        let mut units: Vec<Unit> = self.order.iter().cloned().map(Unit::Table).collect();
        if self.truncated_at.is_none() && !self.deferred_edges.is_empty() {
            units.push(Unit::Deferred);
        }
        units
    }

    pub fn self_edges_of<'p, 't>(
        &'p self,
        table: &'t str,
    ) -> impl Iterator<Item = &'p ForeignKeyEdge> + use<'p, 't> {
        self.self_edges.iter().filter(move |e| e.source_table == table)
    }

    pub fn is_deferred(&self, edge: &ForeignKeyEdge) -> bool {
        self.deferred_edges.contains(edge)
    }

    /// Stop after `until` (inclusive). The hash stays that of the full plan so
    /// chunked invocations can resume one another.
    pub fn truncate_until(mut self, until: &str) -> Result<Self> {
        let idx = self
            .order
            .iter()
            .position(|t| t == until)
            .ok_or_else(|| RekeyError::ConfigError(format!("until table {} is not in the plan", until)))?;
        if idx + 1 < self.order.len() {
            self.order.truncate(idx + 1);
            let kept: FxHashSet<&String> = self.order.iter().collect();
            self.self_edges.retain(|e| kept.contains(&e.source_table));
            self.truncated_at = Some(until.to_string());
        }
        Ok(self)
    }
}

pub fn resolve(graph: &SchemaGraph, deferred: &[DeferredEdgeConfig]) -> Result<MigrationPlan> {
    let mut deferred_edges = Vec::new();
    for d in deferred {
        let edge = graph.find_edge(&d.table, &d.column).ok_or_else(|| {
            RekeyError::ConfigError(format!(
                "deferred edge {}.{} is not a described foreign key",
                d.table, d.column
            ))
        })?;
        if !edge.is_self() && !deferred_edges.contains(edge) {
            deferred_edges.push(edge.clone());
        }
    }
    deferred_edges.sort();

    let mut self_edges = Vec::new();
    let mut in_degree: FxHashMap<&str, usize> = FxHashMap::default();
    let mut dependents: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for table in graph.tables() {
        in_degree.entry(table.name.as_str()).or_insert(0);
    }
    for edge in graph.edges() {
        if edge.is_self() {
            self_edges.push(edge.clone());
            continue;
        }
        if deferred_edges.contains(edge) {
            continue;
        }
        *in_degree.entry(edge.source_table.as_str()).or_insert(0) += 1;
        dependents
            .entry(edge.target_table.as_str())
            .or_default()
            .push(edge.source_table.as_str());
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(t, _)| *t)
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(graph.len());
    while let Some(table) = ready.pop_first() {
        order.push(table.to_string());
        if let Some(deps) = dependents.get(table) {
            for dep in deps {
                if let Some(d) = in_degree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dep);
                    }
                }
            }
        }
    }

    if order.len() < graph.len() {
        let done: FxHashSet<&str> = order.iter().map(|s| s.as_str()).collect();
        let remaining: Vec<&str> = graph
            .tables()
            .map(|t| t.name.as_str())
            .filter(|t| !done.contains(t))
            .collect();
        return Err(RekeyError::CycleError(cycle_report(
            graph,
            &remaining,
            &deferred_edges,
        )));
    }

    let plan_hash = plan_hash(graph, &order, &deferred_edges);
    Ok(MigrationPlan {
        order,
        self_edges,
        deferred_edges,
        truncated_at: None,
        plan_hash,
    })
}

fn cycle_report(
    graph: &SchemaGraph,
    remaining: &[&str],
    deferred_edges: &[ForeignKeyEdge],
) -> CycleReport {
    let mut g: DiGraph<&str, &ForeignKeyEdge> = DiGraph::new();
    let mut index = FxHashMap::default();
    for table in remaining {
        index.insert(*table, g.add_node(*table));
    }
    for edge in graph.edges() {
        if edge.is_self() || deferred_edges.contains(edge) {
            continue;
        }
        if let (Some(a), Some(b)) = (
            index.get(edge.source_table.as_str()),
            index.get(edge.target_table.as_str()),
        ) {
            g.add_edge(*a, *b, edge);
        }
    }

    let mut components = Vec::new();
    let mut in_cycle: FxHashSet<&str> = FxHashSet::default();
    for scc in tarjan_scc(&g) {
        if scc.len() < 2 {
            continue;
        }
        let mut tables: Vec<String> = scc.iter().map(|n| g[*n].to_string()).collect();
        tables.sort();
        let members: FxHashSet<&str> = scc.iter().map(|n| g[*n]).collect();
        let mut edges: Vec<ForeignKeyEdge> = g
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = g.edge_endpoints(e)?;
                if members.contains(g[a]) && members.contains(g[b]) {
                    Some(g[e].clone())
                } else {
                    None
                }
            })
            .collect();
        edges.sort();
        in_cycle.extend(members);
        components.push(CycleComponent { tables, edges });
    }
    components.sort_by(|a, b| a.tables.cmp(&b.tables));

    let mut blocked: Vec<String> = remaining
        .iter()
        .filter(|t| !in_cycle.contains(*t))
        .map(|t| t.to_string())
        .collect();
    blocked.sort();
    CycleReport { components, blocked }
}

fn plan_hash(graph: &SchemaGraph, order: &[String], deferred: &[ForeignKeyEdge]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(graph.canonical().as_bytes());
    hasher.update(b"|order:");
    hasher.update(order.join(",").as_bytes());
    hasher.update(b"|deferred:");
    for edge in deferred {
        hasher.update(edge.to_string().as_bytes());
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}
