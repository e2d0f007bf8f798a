use crate::core::error::{RekeyError, Result};
use crate::core::schemas;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::path::Path;
use std::time::Duration;

/// Crockford base32 alphabet as a GLOB character class (no I, L, O, U).
const CROCKFORD_CLASS: &str = "[0-9A-HJKMNP-TV-Z]";

/// Open a connection used for rewriting.
///
/// Foreign key enforcement is off: parents are rekeyed before their children,
/// and the verification pass replaces the engine-level constraint check.
pub fn db_connect(db_path: &Path, busy_timeout_secs: u64) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(busy_timeout_secs))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=OFF;", [])?;
    Ok(conn)
}

/// Open a read-only connection for planning and verification.
pub fn db_connect_read(db_path: &Path, busy_timeout_secs: u64) -> Result<Connection> {
    if !db_path.exists() {
        return Err(RekeyError::ValidationError(format!(
            "database {} does not exist",
            db_path.display()
        )));
    }
    let conn = Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(busy_timeout_secs))?;
    Ok(conn)
}

/// Create the bookkeeping tables if they are missing.
pub fn ensure_bookkeeping(conn: &Connection) -> Result<()> {
    conn.execute(schemas::RUNS_SCHEMA, [])?;
    conn.execute(schemas::RUNS_INDEX, [])?;
    conn.execute(schemas::CHECKPOINTS_SCHEMA, [])?;
    conn.execute(schemas::MAPPINGS_SCHEMA, [])?;
    Ok(())
}

pub fn has_bookkeeping(conn: &Connection) -> Result<bool> {
    table_exists(conn, schemas::RUNS_TABLE)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// GLOB pattern matching a canonical (upper-case) ULID string.
pub fn ulid_glob() -> String {
    let mut pattern = String::with_capacity(26 * CROCKFORD_CLASS.len());
    pattern.push_str("[0-7]");
    for _ in 0..25 {
        pattern.push_str(CROCKFORD_CLASS);
    }
    pattern
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column metadata as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    /// 1-based position within the primary key, 0 when not part of it.
    pub pk: i64,
}

pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt =
        conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map([table], |row| {
        Ok(ColumnInfo {
            name: row.get(0)?,
            decl_type: row.get(1)?,
            not_null: row.get::<_, i64>(2)? != 0,
            pk: row.get(3)?,
        })
    })?;
    let mut columns = Vec::new();
    for column in rows {
        columns.push(column?);
    }
    Ok(columns)
}

pub fn row_count(conn: &Connection, table: &str) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Read an identifier cell, rejecting non-text storage classes.
pub fn read_id(value: ValueRef<'_>, table: &str, column: &str) -> Result<Option<String>> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Text(bytes) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
        ValueRef::Integer(_) => Err(non_text(table, column, "integer")),
        ValueRef::Real(_) => Err(non_text(table, column, "real")),
        ValueRef::Blob(_) => Err(non_text(table, column, "blob")),
    }
}

fn non_text(table: &str, column: &str, found: &str) -> RekeyError {
    RekeyError::NonTextIdentifier {
        table: table.to_string(),
        column: column.to_string(),
        found: found.to_string(),
    }
}
