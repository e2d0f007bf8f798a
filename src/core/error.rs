use crate::engine::resolver::CycleReport;
use std::io;
use thiserror::Error;

/// Coarse error taxonomy used for exit handling and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Detected before any write: cycles, bad descriptors, generator exhaustion.
    Preflight,
    /// Scope-local and eligible for retry: lock contention, timeouts.
    Transactional,
    /// Orphaned references found while cascading.
    DataIntegrity,
    /// Found after commit; cannot be rolled back automatically.
    Verification,
    /// Configuration, filesystem and everything else.
    Environment,
}

#[derive(Error, Debug)]
pub enum RekeyError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Invalid schema description: {0}")]
    SchemaError(String),
    #[error("Table {0} does not exist in the database")]
    UnknownTable(String),
    #[error("Primary key column {table}.{column} does not exist")]
    MissingPrimaryKey { table: String, column: String },
    #[error("Column {table}.{column} does not exist")]
    MissingColumn { table: String, column: String },
    #[error("Column {table}.{column} holds a non-text identifier ({found})")]
    NonTextIdentifier {
        table: String,
        column: String,
        found: String,
    },
    #[error("Primary key {table}.{value} matches neither the legacy pattern nor the ULID format")]
    UnrecognizedIdentifier { table: String, value: String },
    #[error("Dependency cycle detected: {0}")]
    CycleError(CycleReport),
    #[error("Identifier generator exhausted: {0}")]
    GeneratorExhausted(String),
    #[error("Old id {old_id} is already mapped for table {table}")]
    DuplicateOldId { table: String, old_id: String },
    #[error("New id {new_id} collides with an existing mapping for table {table}")]
    NewIdCollision { table: String, new_id: String },
    #[error("Mapping write phase for table {0} is already sealed")]
    MappingSealed(String),
    #[error(
        "Orphaned reference {table}.{column} = {value} ({rows} row(s)); no mapping exists in {target}"
    )]
    OrphanReference {
        table: String,
        column: String,
        target: String,
        value: String,
        rows: u64,
    },
    #[error("Scope {scope} exceeded its timeout after {elapsed_ms} ms")]
    ScopeTimeout { scope: String, elapsed_ms: u128 },
    #[error("Scope {scope} failed after {attempts} attempt(s): {last}")]
    RetryBudgetExhausted {
        scope: String,
        attempts: u32,
        last: Box<RekeyError>,
    },
    #[error("Migration cancelled")]
    Cancelled,
    #[error("Schema or plan changed since run {run_id} started; cannot resume")]
    PlanChanged { run_id: String },
    #[error("No interrupted run to resume")]
    NothingToResume,
    #[error("Verification found {violations} problem(s) after commit")]
    VerificationFailed { violations: usize },
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl RekeyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RekeyError::SchemaError(_)
            | RekeyError::UnknownTable(_)
            | RekeyError::MissingPrimaryKey { .. }
            | RekeyError::MissingColumn { .. }
            | RekeyError::NonTextIdentifier { .. }
            | RekeyError::UnrecognizedIdentifier { .. }
            | RekeyError::CycleError(_)
            | RekeyError::GeneratorExhausted(_)
            | RekeyError::DuplicateOldId { .. }
            | RekeyError::NewIdCollision { .. }
            | RekeyError::PlanChanged { .. } => ErrorClass::Preflight,
            RekeyError::ScopeTimeout { .. } | RekeyError::RetryBudgetExhausted { .. } => {
                ErrorClass::Transactional
            }
            RekeyError::RusqliteError(e) if is_busy(e) => ErrorClass::Transactional,
            RekeyError::OrphanReference { .. } => ErrorClass::DataIntegrity,
            RekeyError::VerificationFailed { .. } => ErrorClass::Verification,
            _ => ErrorClass::Environment,
        }
    }

    /// Whether rolling back the current scope and trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RekeyError::ScopeTimeout { .. } => true,
            RekeyError::RusqliteError(e) => is_busy(e),
            _ => false,
        }
    }

    /// Format error with the full source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }
        output
    }
}

/// Check if a rusqlite error is a busy/locked condition.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, RekeyError>;
