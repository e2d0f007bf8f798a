//! Schema graph model: tables, their primary key, and foreign-key edges.
//!
//! An edge `A -> B` means "A has a column referencing B's primary key", so B
//! must be rekeyed before A's referencing column can be rewritten. Self edges
//! (`A -> A`) are kept; the resolver defers them to a second pass.

use crate::core::db;
use crate::core::error::{RekeyError, Result};
use rusqlite::Connection;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declarative foreign key as written in a schema description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyDescriptor {
    pub column: String,
    #[serde(alias = "targetTable")]
    pub target_table: String,
    /// Filled from the live schema when omitted.
    #[serde(default, alias = "notNull", skip_serializing_if = "Option::is_none")]
    pub not_null: Option<bool>,
}

/// Declarative table as written in a schema description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDescriptor {
    #[serde(alias = "name")]
    pub table: String,
    #[serde(alias = "primaryKeyColumn")]
    pub primary_key_column: String,
    #[serde(default, alias = "foreignKeys")]
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TableDescriptor {
    pub fn new(table: &str, primary_key_column: &str) -> Self {
        Self {
            table: table.to_string(),
            primary_key_column: primary_key_column.to_string(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_fk(mut self, column: &str, target_table: &str) -> Self {
        self.foreign_keys.push(ForeignKeyDescriptor {
            column: column.to_string(),
            target_table: target_table.to_string(),
            not_null: None,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKeyEdge {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub not_null: bool,
}

impl ForeignKeyEdge {
    pub fn is_self(&self) -> bool {
        self.source_table == self.target_table
    }
}

impl fmt::Display for ForeignKeyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}",
            self.source_table, self.source_column, self.target_table
        )
    }
}

#[derive(Debug, Clone)]
pub struct TableNode {
    pub name: String,
    pub primary_key: String,
    pub outgoing: Vec<ForeignKeyEdge>,
}

/// Validated, read-only view of the schema a run operates on.
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    tables: BTreeMap<String, TableNode>,
}

impl SchemaGraph {
    /// Build and structurally validate the graph.
    pub fn build(descriptors: Vec<TableDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(RekeyError::SchemaError("no tables described".into()));
        }
        let mut tables = BTreeMap::new();
        for desc in &descriptors {
            if desc.table.trim().is_empty() {
                return Err(RekeyError::SchemaError("table with an empty name".into()));
            }
            if desc.primary_key_column.trim().is_empty() {
                return Err(RekeyError::SchemaError(format!(
                    "table {} has no primary key column",
                    desc.table
                )));
            }
            if tables.contains_key(&desc.table) {
                return Err(RekeyError::SchemaError(format!(
                    "table {} is described twice",
                    desc.table
                )));
            }
            tables.insert(
                desc.table.clone(),
                TableNode {
                    name: desc.table.clone(),
                    primary_key: desc.primary_key_column.clone(),
                    outgoing: Vec::new(),
                },
            );
        }

        for desc in descriptors {
            let mut seen_columns = FxHashSet::default();
            let mut outgoing = Vec::with_capacity(desc.foreign_keys.len());
            for fk in desc.foreign_keys {
                if !tables.contains_key(&fk.target_table) {
                    return Err(RekeyError::SchemaError(format!(
                        "{}.{} references undescribed table {}",
                        desc.table, fk.column, fk.target_table
                    )));
                }
                if fk.column == desc.primary_key_column {
                    return Err(RekeyError::SchemaError(format!(
                        "{}.{} is both the primary key and a foreign key",
                        desc.table, fk.column
                    )));
                }
                if !seen_columns.insert(fk.column.clone()) {
                    return Err(RekeyError::SchemaError(format!(
                        "{}.{} is described as a foreign key twice",
                        desc.table, fk.column
                    )));
                }
                outgoing.push(ForeignKeyEdge {
                    source_table: desc.table.clone(),
                    source_column: fk.column,
                    target_table: fk.target_table,
                    not_null: fk.not_null.unwrap_or(false),
                });
            }
            outgoing.sort();
            if let Some(node) = tables.get_mut(&desc.table) {
                node.outgoing = outgoing;
            }
        }

        Ok(Self { tables })
    }

    /// Check the description against the live database and record nullability.
    pub fn check_live(&mut self, conn: &Connection) -> Result<()> {
        for node in self.tables.values_mut() {
            if !db::table_exists(conn, &node.name)? {
                return Err(RekeyError::UnknownTable(node.name.clone()));
            }
            let columns = db::table_columns(conn, &node.name)?;
            let pk = columns
                .iter()
                .find(|c| c.name == node.primary_key)
                .ok_or_else(|| RekeyError::MissingPrimaryKey {
                    table: node.name.clone(),
                    column: node.primary_key.clone(),
                })?;
            if pk.decl_type.to_uppercase().contains("INT") {
                return Err(RekeyError::NonTextIdentifier {
                    table: node.name.clone(),
                    column: node.primary_key.clone(),
                    found: pk.decl_type.clone(),
                });
            }
            for edge in node.outgoing.iter_mut() {
                let column = columns
                    .iter()
                    .find(|c| c.name == edge.source_column)
                    .ok_or_else(|| RekeyError::MissingColumn {
                        table: edge.source_table.clone(),
                        column: edge.source_column.clone(),
                    })?;
                edge.not_null = column.not_null;
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableNode> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableNode> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &ForeignKeyEdge> {
        self.tables.values().flat_map(|t| t.outgoing.iter())
    }

    /// Edges pointing at `target` from other tables or itself.
    pub fn edges_into<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a ForeignKeyEdge> {
        self.edges().filter(move |e| e.target_table == target)
    }

    pub fn find_edge(&self, table: &str, column: &str) -> Option<&ForeignKeyEdge> {
        self.tables
            .get(table)
            .and_then(|t| t.outgoing.iter().find(|e| e.source_column == column))
    }

    /// Canonical text form used for plan hashing.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for node in self.tables.values() {
            out.push_str(&format!("{}({})", node.name, node.primary_key));
            for edge in &node.outgoing {
                out.push_str(&format!(
                    "[{}->{}{}]",
                    edge.source_column,
                    edge.target_table,
                    if edge.not_null { "!" } else { "" }
                ));
            }
            out.push(';');
        }
        out
    }
}
