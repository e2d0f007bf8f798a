//! Primary-key rewriting: mapping generation, then batched key updates.
//!
//! Both phases are step functions over a keyset cursor. The coordinator
//! decides how many steps share a transaction.

use crate::core::db::{self, quote_ident};
use crate::core::error::{RekeyError, Result};
use crate::core::schemas::MAPPINGS_TABLE;
use crate::engine::graph::TableNode;
use crate::engine::idgen::{IdGenerator, IdKind, IdScheme};
use crate::engine::mapping::MappingStore;
use rusqlite::{Connection, params};

/// Outcome of one bounded step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub rows: u64,
    /// Last key seen; the next step starts after it.
    pub cursor: Option<String>,
    pub done: bool,
}

/// Mint new ids for up to `limit` legacy keys that have no mapping yet.
///
/// Keys are visited in ascending order, so new ids keep the legacy order.
/// The table's mapping is sealed once the scan is exhausted.
pub fn generate_batch(
    conn: &Connection,
    store: &MappingStore,
    ids: &mut IdGenerator,
    node: &TableNode,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Batch> {
    let table = quote_ident(&node.name);
    let pk = quote_ident(&node.primary_key);
    let after = if cursor.is_some() {
        format!("AND t.{pk} > ?4")
    } else {
        "AND ?4 IS NULL".to_string()
    };
    let sql = format!(
        "SELECT t.{pk} FROM {table} t
         LEFT JOIN {MAPPINGS_TABLE} m ON m.table_name = ?1 AND m.old_id = t.{pk}
         WHERE t.{pk} IS NOT NULL AND NOT (t.{pk} GLOB ?2) AND m.old_id IS NULL {after}
         ORDER BY t.{pk} LIMIT ?3"
    );
    let keys = collect_ids(
        conn,
        &sql,
        params![node.name, db::ulid_glob(), limit as i64, cursor],
        &node.name,
        &node.primary_key,
    )?;

    for old_id in &keys {
        let new_id = ids.next_id()?.to_string();
        store.insert(conn, &node.name, old_id, &new_id)?;
    }

    let done = keys.len() < limit;
    if done {
        store.seal(&node.name);
    }
    tracing::debug!(table = %node.name, mapped = keys.len(), done, "generated mappings");
    Ok(Batch {
        rows: keys.len() as u64,
        cursor: keys.last().cloned().or_else(|| cursor.map(str::to_string)),
        done,
    })
}

/// Apply up to `limit` recorded mappings to rows still carrying their old key.
pub fn rewrite_batch(
    conn: &Connection,
    node: &TableNode,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Batch> {
    let table = quote_ident(&node.name);
    let pk = quote_ident(&node.primary_key);
    let after = if cursor.is_some() {
        "AND m.old_id > ?3"
    } else {
        "AND ?3 IS NULL"
    };
    let sql = format!(
        "SELECT m.old_id, m.new_id FROM {MAPPINGS_TABLE} m
         JOIN {table} t ON t.{pk} = m.old_id
         WHERE m.table_name = ?1 {after}
         ORDER BY m.old_id LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let pairs: Vec<(String, String)> = stmt
        .query_map(params![node.name, limit as i64, cursor], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut update =
        conn.prepare_cached(&format!("UPDATE {table} SET {pk} = ?1 WHERE {pk} = ?2"))?;
    let mut rows = 0u64;
    for (old_id, new_id) in &pairs {
        rows += update.execute(params![new_id, old_id])? as u64;
    }

    tracing::debug!(table = %node.name, rows, "rewrote primary keys");
    Ok(Batch {
        rows,
        cursor: pairs
            .last()
            .map(|(old, _)| old.clone())
            .or_else(|| cursor.map(str::to_string)),
        done: pairs.len() < limit,
    })
}

/// Checks run before any write: identifier storage class and, when a legacy
/// pattern is configured, that every non-ULID key matches it.
pub fn preflight(conn: &Connection, node: &TableNode, scheme: &IdScheme) -> Result<()> {
    check_text_storage(conn, &node.name, &node.primary_key)?;
    for edge in &node.outgoing {
        check_text_storage(conn, &edge.source_table, &edge.source_column)?;
    }
    if !scheme.has_pattern() {
        return Ok(());
    }
    let sql = format!(
        "SELECT {pk} FROM {table} WHERE {pk} IS NOT NULL AND NOT ({pk} GLOB ?1)",
        pk = quote_ident(&node.primary_key),
        table = quote_ident(&node.name)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([db::ulid_glob()])?;
    while let Some(row) = rows.next()? {
        let Some(value) = db::read_id(row.get_ref(0)?, &node.name, &node.primary_key)? else {
            continue;
        };
        if scheme.classify(&value) == IdKind::Unrecognized {
            return Err(RekeyError::UnrecognizedIdentifier {
                table: node.name.clone(),
                value,
            });
        }
    }
    Ok(())
}

fn check_text_storage(conn: &Connection, table: &str, column: &str) -> Result<()> {
    let sql = format!(
        "SELECT typeof({col}) FROM {table} WHERE typeof({col}) NOT IN ('text', 'null') LIMIT 1",
        col = quote_ident(column),
        table = quote_ident(table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    if let Some(row) = rows.next()? {
        return Err(RekeyError::NonTextIdentifier {
            table: table.to_string(),
            column: column.to_string(),
            found: row.get(0)?,
        });
    }
    Ok(())
}

/// Rows whose key is still in the legacy format.
pub fn legacy_count(conn: &Connection, table: &str, column: &str) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {table} WHERE {col} IS NOT NULL AND NOT ({col} GLOB ?1)",
        col = quote_ident(column),
        table = quote_ident(table)
    );
    let n: i64 = conn.query_row(&sql, [db::ulid_glob()], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

pub(crate) fn collect_ids(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    table: &str,
    column: &str,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if let Some(id) = db::read_id(row.get_ref(0)?, table, column)? {
            out.push(id);
        }
    }
    Ok(out)
}
