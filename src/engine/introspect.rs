//! Derive table descriptors from a live SQLite schema.
//!
//! Only tables with a single-column, non-integer primary key are candidates;
//! everything else is reported as skipped so the operator can decide.

use crate::core::db;
use crate::core::error::Result;
use crate::core::schemas;
use crate::engine::graph::{ForeignKeyDescriptor, TableDescriptor};
use rusqlite::Connection;
use rustc_hash::FxHashMap;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Skipped {
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Introspection {
    pub tables: Vec<TableDescriptor>,
    pub skipped: Vec<Skipped>,
}

struct RawForeignKey {
    id: i64,
    from: String,
    table: String,
    to: Option<String>,
}

pub fn describe(conn: &Connection) -> Result<Introspection> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut skipped = Vec::new();
    let mut primary_keys: FxHashMap<String, String> = FxHashMap::default();
    for name in names.iter().filter(|n| !schemas::is_bookkeeping_table(n)) {
        let columns = db::table_columns(conn, name)?;
        let pk_columns: Vec<_> = columns.iter().filter(|c| c.pk > 0).collect();
        match pk_columns.as_slice() {
            [] => skipped.push(Skipped {
                subject: name.clone(),
                reason: "no primary key".into(),
            }),
            [pk] if pk.decl_type.to_uppercase().contains("INT") => skipped.push(Skipped {
                subject: name.clone(),
                reason: format!("integer primary key ({})", pk.decl_type),
            }),
            [pk] => {
                primary_keys.insert(name.clone(), pk.name.clone());
            }
            _ => skipped.push(Skipped {
                subject: name.clone(),
                reason: "composite primary key".into(),
            }),
        }
    }

    let mut tables = Vec::new();
    for name in names.iter() {
        let Some(pk) = primary_keys.get(name) else {
            continue;
        };
        let mut descriptor = TableDescriptor::new(name, pk);
        let columns = db::table_columns(conn, name)?;

        let mut fk_stmt = conn.prepare(
            "SELECT id, \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?;
        let raw: Vec<RawForeignKey> = fk_stmt
            .query_map([name], |row| {
                Ok(RawForeignKey {
                    id: row.get(0)?,
                    from: row.get(1)?,
                    table: row.get(2)?,
                    to: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut per_id: FxHashMap<i64, usize> = FxHashMap::default();
        for fk in &raw {
            *per_id.entry(fk.id).or_insert(0) += 1;
        }

        for fk in raw {
            let subject = format!("{}.{}", name, fk.from);
            if per_id.get(&fk.id).copied().unwrap_or(0) > 1 {
                skipped.push(Skipped {
                    subject,
                    reason: "composite foreign key".into(),
                });
                continue;
            }
            let Some(target_pk) = primary_keys.get(&fk.table) else {
                skipped.push(Skipped {
                    subject,
                    reason: format!("target {} is not rekeyable", fk.table),
                });
                continue;
            };
            if let Some(to) = &fk.to {
                if to != target_pk {
                    skipped.push(Skipped {
                        subject,
                        reason: format!("references {}.{} instead of its primary key", fk.table, to),
                    });
                    continue;
                }
            }
            if &fk.from == pk {
                skipped.push(Skipped {
                    subject,
                    reason: "primary key doubles as a foreign key".into(),
                });
                continue;
            }
            let not_null = columns.iter().find(|c| c.name == fk.from).map(|c| c.not_null);
            descriptor.foreign_keys.push(ForeignKeyDescriptor {
                column: fk.from,
                target_table: fk.table,
                not_null,
            });
        }
        tables.push(descriptor);
    }

    for s in &skipped {
        tracing::debug!(subject = %s.subject, reason = %s.reason, "introspection skipped");
    }
    Ok(Introspection { tables, skipped })
}
