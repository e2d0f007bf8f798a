//! Interruption, resume and chunked (`until`) runs.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use rekey::core::config::ScopeMode;
use rekey::core::error::RekeyError;
use rekey::engine::checkpoint::{self, STATUS_COMMITTED, STATUS_IN_PROGRESS};
use rekey::engine::coordinator::{self, CancelToken, Progress, ProgressEvent, RunOptions};
use rekey::engine::graph::TableDescriptor;
use rekey::engine::idgen::is_target_id;
use rekey::engine::mapping;
use rekey::engine::run::{MigrationRun, RunStatus};
use rekey::engine::verify;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cancels once `after` batches of `table` have been reported.
struct CancelAfter {
    token: CancelToken,
    table: &'static str,
    after: usize,
    seen: AtomicUsize,
}

impl CancelAfter {
    fn new(token: &CancelToken, table: &'static str, after: usize) -> Self {
        Self {
            token: token.clone(),
            table,
            after,
            seen: AtomicUsize::new(0),
        }
    }
}

impl Progress for CancelAfter {
    fn on_batch(&self, event: &ProgressEvent) {
        if event.table == self.table && self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after
        {
            self.token.cancel();
        }
    }
}

fn interrupted_opts(table: &'static str, after: usize) -> RunOptions {
    let token = CancelToken::new();
    RunOptions {
        progress: Box::new(CancelAfter::new(&token, table, after)),
        cancel: token,
        ..RunOptions::default()
    }
}

fn resume_opts() -> RunOptions {
    RunOptions {
        resume: true,
        ..RunOptions::default()
    }
}

#[test]
fn per_table_resume_skips_committed_tables() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);

    let err = coordinator::execute(&fx.pool, &graph, &plan, &config, interrupted_opts("Task", 1))
        .unwrap_err();
    assert!(matches!(err, RekeyError::Cancelled), "{err}");

    // Project committed on its own; Task rolled back entirely.
    assert!(fx.strings("SELECT id FROM Project").iter().all(|id| is_target_id(id)));
    assert!(fx.strings("SELECT id FROM Task").iter().all(|id| !is_target_id(id)));
    assert!(fx.strings("SELECT projectId FROM Task").iter().all(|id| !is_target_id(id)));
    let conn = fx.conn();
    let first = MigrationRun::latest(&conn).unwrap().unwrap();
    assert_eq!(first.status, RunStatus::RolledBack);
    assert_eq!(mapping::count(&conn, "Task").unwrap(), 0);
    let committed = checkpoint::committed_units(&conn, &first.run_id).unwrap();
    assert!(committed.contains("table:Project"));
    assert!(!committed.contains("table:Task"));
    drop(conn);

    let resumed =
        coordinator::execute(&fx.pool, &graph, &plan, &config, resume_opts()).unwrap();
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(resumed.status, RunStatus::Committed);
    assert_eq!(resumed.counts["Project"].mappings_created, 2);
    assert_crm_migrated(&fx);

    let conn = fx.conn();
    let units: Vec<String> = checkpoint::list(&conn, &resumed.run_id)
        .unwrap()
        .into_iter()
        .filter(|c| c.status == STATUS_COMMITTED)
        .map(|c| c.unit)
        .collect();
    assert_eq!(units.len(), 3);
}

#[test]
fn per_batch_resume_continues_inside_a_table() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let mut config = test_config();
    config.scope = ScopeMode::PerBatch;
    let plan = plan(&graph, &config);

    let err = coordinator::execute(&fx.pool, &graph, &plan, &config, interrupted_opts("Task", 2))
        .unwrap_err();
    assert!(matches!(err, RekeyError::Cancelled), "{err}");

    let conn = fx.conn();
    let run = MigrationRun::latest(&conn).unwrap().unwrap();
    let task = checkpoint::list(&conn, &run.run_id)
        .unwrap()
        .into_iter()
        .find(|c| c.unit == "table:Task")
        .expect("task checkpoint");
    assert_eq!(task.status, STATUS_IN_PROGRESS);
    assert!(task.rows_processed > 0);
    // two batches of two committed before the cancel
    assert_eq!(mapping::count(&conn, "Task").unwrap(), 4);
    drop(conn);

    let resumed =
        coordinator::execute(&fx.pool, &graph, &plan, &config, resume_opts()).unwrap();
    assert_eq!(resumed.run_id, run.run_id);
    assert_crm_migrated(&fx);
    let conn = fx.conn();
    assert_eq!(mapping::count(&conn, "Task").unwrap(), 5);
}

#[test]
fn resume_refuses_a_changed_plan() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);
    coordinator::execute(&fx.pool, &graph, &plan, &config, interrupted_opts("Task", 1))
        .unwrap_err();

    let smaller = fx.graph(vec![
        TableDescriptor::new("Project", "id"),
        TableDescriptor::new("Task", "id")
            .with_fk("projectId", "Project")
            .with_fk("parentId", "Task"),
    ]);
    let other = common::plan(&smaller, &config);
    assert_ne!(other.plan_hash, plan.plan_hash);
    let err = coordinator::execute(&fx.pool, &smaller, &other, &config, resume_opts())
        .unwrap_err();
    assert!(matches!(err, RekeyError::PlanChanged { .. }), "{err}");
}

#[test]
fn resume_without_an_interrupted_run_fails() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);

    let err =
        coordinator::execute(&fx.pool, &graph, &plan, &config, resume_opts()).unwrap_err();
    assert!(matches!(err, RekeyError::NothingToResume), "{err}");

    coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    let err =
        coordinator::execute(&fx.pool, &graph, &plan, &config, resume_opts()).unwrap_err();
    assert!(matches!(err, RekeyError::NothingToResume), "{err}");
}

#[test]
fn until_runs_in_chunks() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let full = plan(&graph, &config);
    let chunk = full.clone().truncate_until("Task").unwrap();
    assert_eq!(chunk.order, vec!["Project", "Task"]);
    assert_eq!(chunk.plan_hash, full.plan_hash);

    let first =
        coordinator::execute(&fx.pool, &graph, &chunk, &config, RunOptions::default()).unwrap();
    assert_eq!(first.status, RunStatus::Committed);
    assert!(fx.strings("SELECT id FROM Task").iter().all(|id| is_target_id(id)));
    assert!(fx.strings("SELECT id FROM Comment").iter().all(|id| !is_target_id(id)));
    assert!(fx.strings("SELECT taskId FROM Comment").iter().all(|id| !is_target_id(id)));

    let checked = verify::verify_plan(&fx.pool, &graph, &chunk, &config.verify, 2).unwrap();
    assert!(checked.is_clean());
    assert_eq!(checked.pending, vec!["Comment.taskId -> Task"]);
    assert_eq!(checked.tables.len(), 2);
    assert!(!verify::verify(&fx.pool, &graph, &config.verify, 2).unwrap().is_clean());

    let second =
        coordinator::execute(&fx.pool, &graph, &full, &config, RunOptions::default()).unwrap();
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.counts["Task"].rows_remapped, 0);
    assert_eq!(second.counts["Comment"].rows_remapped, 10);
    assert_crm_migrated(&fx);
}
