//! rekey: identifier migration for relational schemas.
//!
//! **rekey rewrites every legacy primary key to a sortable ULID and carries
//! the change through every foreign key that references it.**
//!
//! # Pipeline
//!
//! - **Schema graph** ([`engine::graph`]): tables, their primary key, and
//!   foreign-key edges (self edges included), from a description file or
//!   from introspecting the live database.
//! - **Resolver** ([`engine::resolver`]): deterministic topological order;
//!   multi-table cycles are refused with a report of the offending edges.
//! - **Coordinator** ([`engine::coordinator`]): per table, mint ids
//!   ([`engine::idgen`]), record them ([`engine::mapping`]), rewrite keys
//!   ([`engine::rewrite`]) and referencing columns ([`engine::cascade`]) in
//!   checkpointed, retryable transaction scopes.
//! - **Verifier** ([`engine::verify`]): post-commit referential check feeding
//!   the [`engine::report::CompletionReport`].
//!
//! # Examples
//!
//! ```bash
//! # Plan only
//! rekey run --db crm.db --schema schema.toml --dry-run
//!
//! # Migrate, one transaction per table, recording orphans instead of aborting
//! rekey run --db crm.db --config rekey.toml --lenient --report report.json
//!
//! # Continue after an interruption
//! rekey run --db crm.db --config rekey.toml --resume
//! ```
//!
//! # Exit codes
//!
//! `0` clean, `1` aborted or failed (including strict-mode verification
//! failures), `2` committed with violations in lenient mode. A failure under
//! the per-table or per-batch scope keeps the scopes committed before it;
//! `--resume` picks up from there.

mod cli;
pub mod core;
pub mod engine;

use crate::cli::{Cli, Command, DescribeFormat, RunCli, SchemaArgs, VerifyCli};
use crate::core::audit::AuditLog;
use crate::core::config::{RekeyConfig, ViolationMode};
use crate::core::error::{RekeyError, Result};
use crate::core::pool::SqlitePool;
use crate::core::{db, logging, output, time};
use crate::engine::checkpoint;
use crate::engine::coordinator::{self, JsonLinesProgress, RunOptions, TablePreview, TracingProgress};
use crate::engine::graph::{SchemaGraph, TableDescriptor};
use crate::engine::introspect;
use crate::engine::mapping;
use crate::engine::report::{CompletionReport, EXIT_CLEAN, EXIT_FAILED};
use crate::engine::resolver::{self, MigrationPlan};
use crate::engine::run::MigrationRun;
use crate::engine::verify;

use clap::Parser;
use serde::Serialize;
use std::path::Path;

/// Parse arguments, execute the command, and return the process exit code.
pub fn run() -> Result<u8> {
    let cli = Cli::parse();
    logging::setup_logging(&cli.verbosity, &cli.log_format)?;

    match cli.command {
        Command::Run(args) => run_migration(args),
        Command::Verify(args) => run_verify(args),
        Command::Status { db, json } => run_status(&db, json),
        Command::Introspect { db, format } => run_introspect(&db, format),
        Command::Mappings {
            db,
            table,
            limit,
            json,
        } => run_mappings(&db, &table, limit, json),
    }
}

struct Setup {
    config: RekeyConfig,
    graph: SchemaGraph,
    pool: SqlitePool,
}

fn load_setup(args: &SchemaArgs, apply: impl FnOnce(&mut RekeyConfig)) -> Result<Setup> {
    let mut config = RekeyConfig::load_or_default(args.config.as_deref())?;
    if let Some(schema) = &args.schema {
        config.schema = Some(schema.clone());
    }
    apply(&mut config);
    config.validate()?;

    let pool = SqlitePool::new(&args.db)
        .with_busy_timeouts(config.busy_timeout_secs, config.busy_timeout_secs);
    let descriptors = if args.introspect {
        let found = pool.with_read(introspect::describe)?;
        for skipped in &found.skipped {
            tracing::warn!(subject = %skipped.subject, reason = %skipped.reason, "not rekeyed");
        }
        found.tables
    } else {
        config.descriptors()?
    };
    let mut graph = SchemaGraph::build(descriptors)?;
    pool.with_read(|conn| graph.check_live(conn))?;
    Ok(Setup {
        config,
        graph,
        pool,
    })
}

fn run_migration(args: RunCli) -> Result<u8> {
    let mode = args.mode();
    let Setup {
        config,
        graph,
        pool,
    } = load_setup(&args.schema, |config| {
        if let Some(batch_size) = args.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(mode) = mode {
            config.mode = mode;
        }
        if let Some(scope) = args.scope {
            config.scope = scope;
        }
        if let Some(until) = &args.until {
            config.until = Some(until.clone());
        }
        if let Some(workers) = args.workers {
            config.workers = workers;
        }
        if let Some(path) = &args.audit_log {
            config.audit_log = Some(path.clone());
        }
    })?;

    let mut plan = resolver::resolve(&graph, &config.deferred_edges)?;
    if let Some(until) = &config.until {
        plan = plan.truncate_until(until)?;
    }

    if args.dry_run {
        let previews = coordinator::preview(&pool, &graph, &plan, &config)?;
        print_plan(&plan, &previews, args.json)?;
        return Ok(EXIT_CLEAN);
    }

    let opts = RunOptions {
        resume: args.resume,
        progress: if args.progress {
            Box::new(JsonLinesProgress)
        } else {
            Box::new(TracingProgress)
        },
        audit: config.audit_log.as_deref().map(AuditLog::new),
        ..RunOptions::default()
    };
    let run = coordinator::execute(&pool, &graph, &plan, &config, opts)?;
    let verification = verify::verify_plan(&pool, &graph, &plan, &config.verify, config.workers)?;
    let report = CompletionReport::build(Some(&run), Some(&plan), &verification, config.mode);
    finish(&report, args.report.as_deref(), args.json)
}

fn run_verify(args: VerifyCli) -> Result<u8> {
    let Setup {
        config,
        graph,
        pool,
    } = load_setup(&args.schema, |config| {
        if args.strict {
            config.mode = ViolationMode::Strict;
        } else if args.lenient {
            config.mode = ViolationMode::Lenient;
        }
        if let Some(workers) = args.workers {
            config.workers = workers;
        }
    })?;
    let verification = verify::verify(&pool, &graph, &config.verify, config.workers)?;
    let report = CompletionReport::build(None, None, &verification, config.mode);
    finish(&report, args.report.as_deref(), args.json)
}

/// Emit the report, then turn a strict-mode verification failure into an error.
fn finish(report: &CompletionReport, path: Option<&Path>, json: bool) -> Result<u8> {
    if let Some(path) = path {
        report.write(path)?;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_report(report);
    }
    if report.exit_code == EXIT_FAILED {
        return Err(RekeyError::VerificationFailed {
            violations: report.violations
                + report.collisions.len()
                + report.unmigrated_keys as usize,
        });
    }
    Ok(report.exit_code)
}

fn print_plan(plan: &MigrationPlan, previews: &[TablePreview], json: bool) -> Result<()> {
    if json {
        let body = serde_json::json!({
            "plan_hash": plan.plan_hash,
            "order": plan.order,
            "truncated_at": plan.truncated_at,
            "tables": previews,
            "self_edges": plan.self_edges.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            "deferred_edges": plan.deferred_edges.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        });
        let envelope = time::command_envelope("run.dry-run", "ok", body);
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    use colored::Colorize;
    println!(
        "{} {} ({} tables, plan {})",
        "▸".bright_cyan(),
        "Dry run".bold(),
        plan.order.len(),
        &plan.plan_hash[..12.min(plan.plan_hash.len())]
    );
    let width = previews
        .iter()
        .map(|p| p.rows.to_string().len())
        .max()
        .unwrap_or(1);
    for (idx, preview) in previews.iter().enumerate() {
        let self_note = if preview.self_edges > 0 {
            format!(", {} self edge(s)", preview.self_edges)
        } else {
            String::new()
        };
        println!(
            "  {:>2}. {}  rows {}  legacy keys {}  legacy refs {}{}",
            idx + 1,
            preview.table.bright_white().bold(),
            output::pad_count(preview.rows, width),
            output::pad_count(preview.legacy_keys, width),
            preview.legacy_references,
            self_note
        );
    }
    for edge in &plan.deferred_edges {
        println!("  {} deferred: {}", "•".bright_yellow(), edge);
    }
    if let Some(until) = &plan.truncated_at {
        println!("  {} stops after {}", "•".bright_yellow(), until);
    }
    Ok(())
}

fn print_report(report: &CompletionReport) {
    use colored::Colorize;
    let headline = match report.exit_code {
        EXIT_CLEAN => format!("{} {}", "✓".bright_green(), "Verified clean".bright_green()),
        EXIT_FAILED => format!(
            "{} {}",
            "✗".bright_red(),
            "Verification failed after commit".bright_red().bold()
        ),
        _ => format!(
            "{} {}",
            "⚠".bright_yellow(),
            "Committed with violations".bright_yellow().bold()
        ),
    };
    println!("{}", headline);
    if let Some(run_id) = &report.run_id {
        println!(
            "  run {} {} in {} ms",
            run_id.bright_white(),
            report.status,
            report.duration_ms
        );
    }
    let width = report
        .tables
        .iter()
        .map(|t| t.rows.to_string().len())
        .max()
        .unwrap_or(1);
    for table in &report.tables {
        let unmigrated = if table.unmigrated_keys > 0 {
            format!("  unmigrated {}", table.unmigrated_keys)
                .bright_yellow()
                .to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<24} rows {}  remapped {}  fk rewritten {}{}",
            table.table,
            output::pad_count(table.rows, width),
            output::pad_count(table.rows_remapped, width),
            table.fk_values_rewritten,
            unmigrated
        );
    }
    if report.violations > 0 {
        let shown: Vec<String> = report
            .reported_violations
            .iter()
            .map(|v| format!("{}.{} = {} -> {}", v.table, v.column, v.value, v.target))
            .collect();
        println!(
            "  {} {} violation(s) ({} pre-existing, {} introduced): {}",
            "✗".bright_red(),
            report.violations,
            report.pre_existing,
            report.introduced,
            output::preview_messages(&shown, 5, 120)
        );
    }
    if !report.pending.is_empty() {
        println!(
            "  {} {} edge(s) pending a later chunk: {}",
            "•".bright_yellow(),
            report.pending.len(),
            output::preview_messages(&report.pending, 5, 120)
        );
    }
    if !report.orphans.is_empty() {
        println!(
            "  {} {} orphaned reference(s) recorded",
            "⚠".bright_yellow(),
            report.orphans.len()
        );
    }
    for collision in &report.collisions {
        println!(
            "  {} collision in {}: {} used {} times",
            "✗".bright_red(),
            collision.table,
            collision.new_id,
            collision.count
        );
    }
}

fn run_status(db_path: &Path, json: bool) -> Result<u8> {
    let pool = SqlitePool::new(db_path);
    let (run, checkpoints) = pool.with_read(|conn| {
        if !db::has_bookkeeping(conn)? {
            return Ok((None, Vec::new()));
        }
        match MigrationRun::latest(conn)? {
            Some(run) => {
                let checkpoints = checkpoint::list(conn, &run.run_id)?;
                Ok((Some(run), checkpoints))
            }
            None => Ok((None, Vec::new())),
        }
    })?;

    if json {
        let envelope = time::command_envelope(
            "status",
            "ok",
            serde_json::json!({ "run": run, "checkpoints": checkpoints }),
        );
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(EXIT_CLEAN);
    }

    use colored::Colorize;
    let Some(run) = run else {
        println!("No runs recorded in {}", db_path.display());
        return Ok(EXIT_CLEAN);
    };
    println!(
        "{} run {} {} (started {})",
        "▸".bright_cyan(),
        run.run_id.bright_white().bold(),
        run.status.to_string().bold(),
        time::to_rfc3339(&run.started_at)
    );
    for cp in &checkpoints {
        let mark = if cp.is_committed() {
            "✓".bright_green()
        } else {
            "…".bright_yellow()
        };
        println!(
            "  {} {:<28} {:>10} rows  {}",
            mark, cp.unit, cp.rows_processed, cp.updated_at
        );
    }
    let messages: Vec<String> = run
        .errors
        .iter()
        .map(|e| format!("[{}] {}", e.class, e.message))
        .collect();
    if !messages.is_empty() {
        println!(
            "  {} {}",
            "errors:".bright_red(),
            output::preview_messages(&messages, 3, 160)
        );
    }
    Ok(EXIT_CLEAN)
}

#[derive(Serialize)]
struct SchemaOut<'a> {
    tables: &'a [TableDescriptor],
}

fn run_introspect(db_path: &Path, format: DescribeFormat) -> Result<u8> {
    let pool = SqlitePool::new(db_path);
    let found = pool.with_read(introspect::describe)?;
    match format {
        DescribeFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        DescribeFormat::Toml => {
            for skipped in &found.skipped {
                println!("# skipped {}: {}", skipped.subject, skipped.reason);
            }
            let body = toml::to_string(&SchemaOut {
                tables: &found.tables,
            })
            .map_err(|e| RekeyError::ConfigError(format!("cannot render schema: {}", e)))?;
            print!("{}", body);
        }
    }
    Ok(EXIT_CLEAN)
}

fn run_mappings(db_path: &Path, table: &str, limit: Option<usize>, json: bool) -> Result<u8> {
    let pool = SqlitePool::new(db_path);
    let rows = pool.with_read(|conn| {
        if !db::has_bookkeeping(conn)? {
            return Ok(Vec::new());
        }
        mapping::export(conn, table, limit)
    })?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{}\t{}", row.old_id, row.new_id);
        }
    }
    Ok(EXIT_CLEAN)
}
