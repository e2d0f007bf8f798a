//! Old id to new id associations for one run.
//!
//! The `_rekey_mappings` table is authoritative and commits with the scope
//! that wrote it. A bounded LRU sits in front of it for cascade lookups; a
//! miss always falls through to SQL, so eviction never loses a mapping.

use crate::core::error::{RekeyError, Result};
use crate::core::schemas::MAPPINGS_TABLE;
use crate::core::time;
use lru::LruCache;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};
use ulid::Ulid;

type Key = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub table: String,
    pub old_id: String,
    pub new_id: String,
    pub run_id: String,
    pub created_at: String,
}

pub struct MappingStore {
    run_id: String,
    cache: RwLock<LruCache<Key, String>>,
    sealed: RwLock<FxHashSet<String>>,
    /// Tables sealed inside the open scope; reopened if it rolls back.
    scope_seals: Mutex<Vec<String>>,
}

impl MappingStore {
    pub fn new(run_id: &str, cache_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            run_id: run_id.to_string(),
            cache: RwLock::new(LruCache::new(capacity)),
            sealed: RwLock::new(FxHashSet::default()),
            scope_seals: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, conn: &Connection, table: &str, old_id: &str, new_id: &str) -> Result<()> {
        if self.is_sealed(table) {
            return Err(RekeyError::MappingSealed(table.to_string()));
        }
        if self.cached(table, old_id).is_some() || lookup_sql(conn, table, old_id)?.is_some() {
            return Err(RekeyError::DuplicateOldId {
                table: table.to_string(),
                old_id: old_id.to_string(),
            });
        }
        let taken: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE table_name = ?1 AND new_id = ?2",
                    MAPPINGS_TABLE
                ),
                params![table, new_id],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(RekeyError::NewIdCollision {
                table: table.to_string(),
                new_id: new_id.to_string(),
            });
        }
        conn.execute(
            &format!(
                "INSERT INTO {} (table_name, old_id, new_id, run_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                MAPPINGS_TABLE
            ),
            params![table, old_id, new_id, self.run_id, time::now_rfc3339()],
        )?;
        self.write_cache()
            .put((table.to_string(), old_id.to_string()), new_id.to_string());
        Ok(())
    }

    /// New id for `old_id`, or `None` when the value was never mapped.
    pub fn lookup(&self, conn: &Connection, table: &str, old_id: &str) -> Result<Option<String>> {
        let key = (table.to_string(), old_id.to_string());
        if let Some(hit) = self.write_cache().get(&key) {
            return Ok(Some(hit.clone()));
        }
        let found = lookup_sql(conn, table, old_id)?;
        if let Some(new_id) = &found {
            self.write_cache().put(key, new_id.clone());
        }
        Ok(found)
    }

    /// Cache-only read that does not touch recency; safe from many threads.
    pub fn cached(&self, table: &str, old_id: &str) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .peek(&(table.to_string(), old_id.to_string()))
            .cloned()
    }

    /// Close the write phase for `table`.
    pub fn seal(&self, table: &str) {
        let inserted = self
            .sealed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string());
        if inserted {
            self.scope_seals
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(table.to_string());
        }
    }

    pub fn is_sealed(&self, table: &str) -> bool {
        self.sealed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(table)
    }

    /// The open scope committed; its seals become permanent.
    pub fn commit_scope(&self) {
        self.scope_seals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// The open scope rolled back: drop cached entries it may have written
    /// and reopen the tables it sealed.
    pub fn rollback_scope(&self) {
        self.write_cache().clear();
        let reopened: Vec<String> = self
            .scope_seals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut sealed = self.sealed.write().unwrap_or_else(|e| e.into_inner());
        for table in reopened {
            sealed.remove(&table);
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, LruCache<Key, String>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lookup_sql(conn: &Connection, table: &str, old_id: &str) -> Result<Option<String>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT new_id FROM {} WHERE table_name = ?1 AND old_id = ?2",
                MAPPINGS_TABLE
            ),
            params![table, old_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found)
}

pub fn count(conn: &Connection, table: &str) -> Result<u64> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE table_name = ?1", MAPPINGS_TABLE),
        [table],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as u64)
}

/// Highest id ever issued, so a later run keeps ids increasing.
pub fn last_issued(conn: &Connection) -> Result<Option<Ulid>> {
    let max: Option<String> = conn.query_row(
        &format!("SELECT MAX(new_id) FROM {}", MAPPINGS_TABLE),
        [],
        |row| row.get(0),
    )?;
    Ok(max.and_then(|s| Ulid::from_string(&s).ok()))
}

/// Recorded mappings for `table` in old id order.
pub fn export(
    conn: &Connection,
    table: &str,
    limit: Option<usize>,
) -> Result<Vec<MappingEntry>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "SELECT table_name, old_id, new_id, run_id, created_at FROM {}
         WHERE table_name = ?1 ORDER BY old_id LIMIT ?2",
        MAPPINGS_TABLE
    ))?;
    let rows = stmt.query_map(params![table, limit], |row| {
        Ok(MappingEntry {
            table: row.get(0)?,
            old_id: row.get(1)?,
            new_id: row.get(2)?,
            run_id: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
