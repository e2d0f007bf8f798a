//! Bookkeeping tables rekey keeps inside the database it migrates.
//!
//! They live next to the user's tables so that checkpoints and mappings commit
//! atomically with the rows they describe.

pub const TABLE_PREFIX: &str = "_rekey_";

pub const RUNS_TABLE: &str = "_rekey_runs";
pub const CHECKPOINTS_TABLE: &str = "_rekey_checkpoints";
pub const MAPPINGS_TABLE: &str = "_rekey_mappings";

pub const RUNS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _rekey_runs (
        run_id TEXT PRIMARY KEY,
        plan_hash TEXT NOT NULL,
        status TEXT NOT NULL,
        scope_mode TEXT NOT NULL,
        violation_mode TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        counts_json TEXT NOT NULL DEFAULT '{}',
        errors_json TEXT NOT NULL DEFAULT '[]'
    )
";

pub const CHECKPOINTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _rekey_checkpoints (
        run_id TEXT NOT NULL,
        unit TEXT NOT NULL,
        status TEXT NOT NULL,
        rows_processed INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (run_id, unit)
    )
";

pub const MAPPINGS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _rekey_mappings (
        table_name TEXT NOT NULL,
        old_id TEXT NOT NULL,
        new_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (table_name, old_id),
        UNIQUE (table_name, new_id)
    )
";

pub const RUNS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_rekey_runs_started ON _rekey_runs(started_at)";

pub fn is_bookkeeping_table(name: &str) -> bool {
    name.starts_with(TABLE_PREFIX) || name.starts_with("sqlite_")
}
