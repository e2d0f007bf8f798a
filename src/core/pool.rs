//! SQLite connection handling with read/write separation and retry logic.
//!
//! - The coordinator holds the only **write connection**; every mutation goes
//!   through the scope it owns.
//! - **Read connections** are opened fresh per operation (no sharing, concurrent
//!   via WAL), which lets the verification pass fan out across worker threads.
//!
//! Connections are not pooled: SQLite connections are cheap to open and a
//! `Connection` cannot be shared between threads.

use crate::core::db;
use crate::core::error::{RekeyError, Result};
use rusqlite::Connection;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 5_000;

/// Write connection busy_timeout in seconds.
pub const WRITE_BUSY_TIMEOUT_SECS: u64 = 5;
/// Read connection busy_timeout in seconds.
pub const READ_BUSY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct SqlitePool {
    db_path: PathBuf,
    write_busy_timeout_secs: u64,
    read_busy_timeout_secs: u64,
}

impl SqlitePool {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            write_busy_timeout_secs: WRITE_BUSY_TIMEOUT_SECS,
            read_busy_timeout_secs: READ_BUSY_TIMEOUT_SECS,
        }
    }

    pub fn with_busy_timeouts(mut self, write_secs: u64, read_secs: u64) -> Self {
        self.write_busy_timeout_secs = write_secs;
        self.read_busy_timeout_secs = read_secs;
        self
    }

    /// Open the write connection. Callers keep it for the lifetime of the run.
    pub fn open_write(&self) -> Result<Connection> {
        db::db_connect(&self.db_path, self.write_busy_timeout_secs)
    }

    /// Execute a closure with a fresh read connection.
    pub fn with_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = db::db_connect_read(&self.db_path, self.read_busy_timeout_secs)?;
        f(&conn)
    }
}

/// Backoff delay before the given retry attempt (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((BASE_DELAY_MS * 2u64.pow(exp)).min(MAX_DELAY_MS))
}

/// Retry a closure on retryable errors with exponential backoff.
///
/// `budget` counts total attempts. The closure is responsible for leaving no
/// partial state behind when it fails.
pub fn retry_with_backoff<F, R>(scope: &str, budget: u32, mut f: F) -> Result<R>
where
    F: FnMut(u32) -> Result<R>,
{
    let budget = budget.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < budget => {
                tracing::warn!(scope, attempt, error = %e, "retryable failure, rolling back and retrying");
                thread::sleep(backoff_delay(attempt));
            }
            Err(e) if e.is_retryable() => {
                return Err(RekeyError::RetryBudgetExhausted {
                    scope: scope.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
