//! CLI struct definitions for the rekey command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::core::config::{ScopeMode, ViolationMode};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "rekey",
    version = env!("CARGO_PKG_VERSION"),
    about = "Rewrites legacy primary keys to sortable ULIDs and cascades every foreign key that points at them."
)]
pub(crate) struct Cli {
    /// Log output format: 'text' or 'json'.
    #[clap(long, global = true, default_value = "text")]
    pub log_format: String,
    /// Log level: trace, debug, info, warn, error. RUST_LOG overrides it.
    #[clap(long, global = true, default_value = "warn")]
    pub verbosity: String,
    #[clap(subcommand)]
    pub command: Command,
}

/// Where the schema description comes from.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct SchemaArgs {
    /// SQLite database to operate on.
    #[clap(long)]
    pub db: PathBuf,
    /// Run configuration (TOML).
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Schema description file (TOML or JSON); overrides the config's schema.
    #[clap(long)]
    pub schema: Option<PathBuf>,
    /// Derive the schema from the live database instead of a description.
    #[clap(long, conflicts_with = "schema")]
    pub introspect: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct RunCli {
    #[clap(flatten)]
    pub schema: SchemaArgs,
    /// Print the plan and row counts without writing.
    #[clap(long)]
    pub dry_run: bool,
    /// Continue the latest interrupted run from its checkpoints.
    #[clap(long)]
    pub resume: bool,
    #[clap(long)]
    pub batch_size: Option<usize>,
    /// Abort on the first orphaned reference.
    #[clap(long, conflicts_with = "lenient")]
    pub strict: bool,
    /// Record orphaned references and continue.
    #[clap(long)]
    pub lenient: bool,
    /// Transaction scope. Under per-table and per-batch, scopes committed
    /// before a failure (generator exhaustion included) stay committed and
    /// --resume continues from them; only single rolls everything back.
    #[clap(long, value_enum)]
    pub scope: Option<ScopeMode>,
    /// Stop after this table (inclusive).
    #[clap(long)]
    pub until: Option<String>,
    /// Worker threads for verification and dry-run statistics.
    #[clap(long)]
    pub workers: Option<usize>,
    /// Write the completion report (JSON) to this path.
    #[clap(long)]
    pub report: Option<PathBuf>,
    /// Append one JSON line per committed or rolled-back scope.
    #[clap(long)]
    pub audit_log: Option<PathBuf>,
    /// Print the completion report as JSON on stdout.
    #[clap(long)]
    pub json: bool,
    /// Emit one JSON line per batch on stderr.
    #[clap(long)]
    pub progress: bool,
}

impl RunCli {
    pub fn mode(&self) -> Option<ViolationMode> {
        if self.strict {
            Some(ViolationMode::Strict)
        } else if self.lenient {
            Some(ViolationMode::Lenient)
        } else {
            None
        }
    }
}

#[derive(clap::Args, Debug)]
pub(crate) struct VerifyCli {
    #[clap(flatten)]
    pub schema: SchemaArgs,
    #[clap(long, conflicts_with = "lenient")]
    pub strict: bool,
    #[clap(long)]
    pub lenient: bool,
    #[clap(long)]
    pub workers: Option<usize>,
    #[clap(long)]
    pub report: Option<PathBuf>,
    #[clap(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescribeFormat {
    Toml,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Migrate every described table to ULID primary keys
    Run(RunCli),
    /// Check referential integrity and report without writing
    Verify(VerifyCli),
    /// Show the latest run and its checkpoints
    Status {
        #[clap(long)]
        db: PathBuf,
        #[clap(long)]
        json: bool,
    },
    /// Print a schema description derived from the live database
    Introspect {
        #[clap(long)]
        db: PathBuf,
        #[clap(long, value_enum, default_value = "toml")]
        format: DescribeFormat,
    },
    /// Print recorded old id to new id mappings for a table
    Mappings {
        #[clap(long)]
        db: PathBuf,
        #[clap(long)]
        table: String,
        #[clap(long)]
        limit: Option<usize>,
        #[clap(long)]
        json: bool,
    },
}
