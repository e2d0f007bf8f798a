//! Cycles, orphans, injected failures, lock contention and verification.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use rekey::core::config::{DeferredEdgeConfig, NotNullOrphanPolicy, ScopeMode, ViolationMode};
use rekey::core::db;
use rekey::core::error::{ErrorClass, RekeyError};
use rekey::core::pool;
use rekey::engine::cascade::OrphanAction;
use rekey::engine::coordinator::{self, RunOptions};
use rekey::engine::graph::TableDescriptor;
use rekey::engine::idgen::is_target_id;
use rekey::engine::mapping;
use rekey::engine::report::{self, CompletionReport, EXIT_FAILED, EXIT_VIOLATIONS};
use rekey::engine::resolver;
use rekey::engine::run::{MigrationRun, RunStatus};
use rekey::engine::verify::{self, ViolationKind};
use std::thread;
use std::time::Duration;

const CYCLE_SQL: &str = "
    CREATE TABLE Account (id TEXT PRIMARY KEY, primaryContactId TEXT);
    CREATE TABLE Contact (id TEXT PRIMARY KEY, accountId TEXT);
    INSERT INTO Account VALUES ('acc-1', 'con-1'), ('acc-2', NULL);
    INSERT INTO Contact VALUES ('con-1', 'acc-1'), ('con-2', 'acc-1'), ('con-3', 'acc-2');
";

fn cycle_descriptors() -> Vec<TableDescriptor> {
    vec![
        TableDescriptor::new("Account", "id").with_fk("primaryContactId", "Contact"),
        TableDescriptor::new("Contact", "id").with_fk("accountId", "Account"),
    ]
}

#[test]
fn cycle_is_refused_before_any_write() {
    let fx = Fixture::new(CYCLE_SQL);
    let graph = fx.graph(cycle_descriptors());
    let err = resolver::resolve(&graph, &[]).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Preflight);
    let RekeyError::CycleError(report) = &err else {
        panic!("expected a cycle, got {err}");
    };
    assert_eq!(report.components.len(), 1);
    assert_eq!(report.components[0].tables, vec!["Account", "Contact"]);
    assert_eq!(report.components[0].edges.len(), 2);
    assert!(err.to_string().contains("deferred_edges"));

    let conn = fx.conn();
    assert!(!db::has_bookkeeping(&conn).unwrap());
}

#[test]
fn deferring_one_edge_breaks_the_cycle() {
    let fx = Fixture::new(CYCLE_SQL);
    let graph = fx.graph(cycle_descriptors());
    let mut config = test_config();
    config.deferred_edges = vec![DeferredEdgeConfig {
        table: "Account".into(),
        column: "primaryContactId".into(),
    }];
    let plan = plan(&graph, &config);
    assert_eq!(plan.order, vec!["Account", "Contact"]);

    coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    let pairs = fx.pairs(
        "SELECT c.id, a.primaryContactId FROM Account a JOIN Contact c ON c.id = a.primaryContactId",
    );
    assert_eq!(pairs.len(), 1);
    assert!(is_target_id(&pairs[0].1));
    assert_eq!(
        fx.strings("SELECT COUNT(*) || '' FROM Contact c JOIN Account a ON a.id = c.accountId"),
        vec!["3"]
    );
    let verification = verify::verify(&fx.pool, &graph, &config.verify, 2).unwrap();
    assert!(verification.is_clean());
}

const ORPHAN_SQL: &str = "
    UPDATE Task SET parentId = 'tsk-ghost' WHERE id = 'tsk-5';
    INSERT INTO Comment VALUES ('cmt-99', 'tsk-gone', 'cmt-99');
";

fn orphan_fixture() -> Fixture {
    Fixture::new(&format!("{CRM_SQL}{ORPHAN_SQL}"))
}

#[test]
fn strict_mode_aborts_on_the_first_orphan() {
    let fx = orphan_fixture();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);

    let err = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::DataIntegrity);
    let RekeyError::OrphanReference { table, value, .. } = &err else {
        panic!("expected an orphan, got {err}");
    };
    assert_eq!(table, "Task");
    assert_eq!(value, "tsk-ghost");

    // Project had already committed; Task rolled back with its mapping.
    assert!(fx.strings("SELECT id FROM Project").iter().all(|id| is_target_id(id)));
    assert!(fx.strings("SELECT id FROM Task").iter().all(|id| !is_target_id(id)));
    let conn = fx.conn();
    assert_eq!(mapping::count(&conn, "Task").unwrap(), 0);
    let run = MigrationRun::latest(&conn).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::RolledBack);
    assert_eq!(run.errors.last().map(|e| e.class.as_str()), Some("data-integrity"));
}

#[test]
fn lenient_mode_keeps_nullable_orphans_and_reports_them() {
    let fx = Fixture::new(&format!(
        "{CRM_SQL}UPDATE Task SET parentId = 'tsk-ghost' WHERE id = 'tsk-5';"
    ));
    let graph = fx.graph(crm_descriptors());
    let mut config = test_config();
    config.mode = ViolationMode::Lenient;
    let plan = plan(&graph, &config);

    let run =
        coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    let orphans: Vec<_> = run.orphans().collect();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].value, "tsk-ghost");
    assert_eq!(orphans[0].action, OrphanAction::Kept);
    assert_eq!(
        fx.strings("SELECT parentId FROM Task WHERE title = 'tsk-5'"),
        vec!["tsk-ghost"]
    );

    let verification = verify::verify(&fx.pool, &graph, &config.verify, 2).unwrap();
    assert_eq!(verification.violation_count(), 1);
    let violation = verification.violations().next().unwrap();
    assert_eq!(violation.kind, ViolationKind::PreExisting);

    let report = CompletionReport::build(Some(&run), Some(&plan), &verification, config.mode);
    assert_eq!(report.exit_code, EXIT_VIOLATIONS);
    assert_eq!(report.orphans.len(), 1);
    assert!(report.errors.is_empty());

    let strict = CompletionReport::build(None, None, &verification, ViolationMode::Strict);
    assert_eq!(strict.exit_code, EXIT_FAILED);
}

#[test]
fn not_null_orphans_need_an_explicit_policy() {
    let fx = Fixture::new(&format!(
        "{CRM_SQL}INSERT INTO Comment VALUES ('cmt-99', 'tsk-gone', 'cmt-99');"
    ));
    let graph = fx.graph(crm_descriptors());
    let mut config = test_config();
    config.mode = ViolationMode::Lenient;
    let plan = plan(&graph, &config);

    let err = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("not_null_policy"), "{err}");

    config.orphans.not_null_policy = Some(NotNullOrphanPolicy::Sentinel);
    config.orphans.sentinel = Some("00000000000000000000000000".into());
    config.validate().unwrap();
    let run = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
        .unwrap();
    let orphan = run.orphans().next().expect("one orphan");
    assert_eq!(orphan.action, OrphanAction::Sentinel);
    assert_eq!(
        fx.strings("SELECT taskId FROM Comment WHERE body = 'cmt-99'"),
        vec!["00000000000000000000000000"]
    );
    assert_eq!(fx.strings(COMMENT_CHAIN_SQL), expected_chains());
}

#[test]
fn keep_policy_leaves_not_null_orphans_in_place() {
    let fx = orphan_fixture();
    let graph = fx.graph(crm_descriptors());
    let mut config = test_config();
    config.mode = ViolationMode::Lenient;
    config.orphans.not_null_policy = Some(NotNullOrphanPolicy::Keep);
    let plan = plan(&graph, &config);

    let run =
        coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    let mut values: Vec<&str> = run.orphans().map(|o| o.value.as_str()).collect();
    values.sort();
    assert_eq!(values, vec!["tsk-ghost", "tsk-gone"]);
    assert_eq!(
        fx.strings("SELECT taskId FROM Comment WHERE body = 'cmt-99'"),
        vec!["tsk-gone"]
    );
    assert!(is_target_id(&fx.strings("SELECT id FROM Comment WHERE body = 'cmt-99'")[0]));
}

#[test]
fn injected_failure_rolls_back_only_its_scope() {
    let fx = Fixture::new(&format!(
        "{CRM_SQL}
         CREATE TRIGGER comment_frozen BEFORE UPDATE ON Comment
         BEGIN SELECT RAISE(ABORT, 'comments are frozen'); END;"
    ));
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);

    let err = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("comments are frozen"), "{err}");
    assert!(fx.strings("SELECT id FROM Task").iter().all(|id| is_target_id(id)));
    assert!(fx.strings("SELECT id FROM Comment").iter().all(|id| !is_target_id(id)));
    assert_eq!(mapping::count(&fx.conn(), "Comment").unwrap(), 0);

    fx.conn()
        .execute_batch("DROP TRIGGER comment_frozen;")
        .unwrap();
    let resume = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    coordinator::execute(&fx.pool, &graph, &plan, &config, resume).unwrap();
    assert_crm_migrated(&fx);
}

#[test]
fn single_scope_failure_leaves_the_database_untouched() {
    let fx = Fixture::new(&format!(
        "{CRM_SQL}
         CREATE TRIGGER comment_frozen BEFORE UPDATE ON Comment
         BEGIN SELECT RAISE(ABORT, 'comments are frozen'); END;"
    ));
    let graph = fx.graph(crm_descriptors());
    let mut config = test_config();
    config.scope = ScopeMode::Single;
    let plan = plan(&graph, &config);

    coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap_err();
    for table in ["Project", "Task", "Comment"] {
        let ids = fx.strings(&format!("SELECT id FROM {table}"));
        assert!(ids.iter().all(|id| !is_target_id(id)), "{table} was rewritten");
        assert_eq!(mapping::count(&fx.conn(), table).unwrap(), 0);
    }
    assert_eq!(fx.strings(COMMENT_CHAIN_SQL), expected_chains());
}

#[test]
fn busy_database_is_retried_with_backoff() {
    let fx = Fixture::crm();
    let holder = db::db_connect(&fx.db, 0).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        holder.execute_batch("COMMIT;").unwrap();
    });

    let contender = db::db_connect(&fx.db, 0).unwrap();
    let attempts = pool::retry_with_backoff("table:Project", 5, |attempt| {
        contender.execute_batch("BEGIN IMMEDIATE; UPDATE Project SET name = name; COMMIT;")?;
        Ok(attempt)
    })
    .unwrap();
    release.join().unwrap();
    assert!(attempts > 1, "expected at least one busy retry");
}

#[test]
fn exhausted_retry_budget_is_transactional() {
    let fx = Fixture::crm();
    let holder = db::db_connect(&fx.db, 0).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let contender = db::db_connect(&fx.db, 0).unwrap();
    let err = pool::retry_with_backoff("table:Project", 2, |_| {
        contender.execute_batch("BEGIN IMMEDIATE; COMMIT;")?;
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, RekeyError::RetryBudgetExhausted { attempts: 2, .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::Transactional);
    holder.execute_batch("ROLLBACK;").unwrap();
}

#[test]
fn exit_codes_follow_the_violation_mode() {
    assert_eq!(report::exit_code(ViolationMode::Strict, 0, 0), 0);
    assert_eq!(report::exit_code(ViolationMode::Strict, 3, 0), 1);
    assert_eq!(report::exit_code(ViolationMode::Lenient, 3, 0), 2);
}
