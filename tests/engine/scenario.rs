//! End-to-end migration of the CRM fixture.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use rekey::core::audit::AuditLog;
use rekey::core::config::{ScopeMode, ViolationMode};
use rekey::engine::coordinator::{self, RunOptions};
use rekey::engine::graph::TableDescriptor;
use rekey::engine::idgen::is_target_id;
use rekey::engine::mapping;
use rekey::engine::report::{CompletionReport, EXIT_CLEAN};
use rekey::engine::run::{MigrationRun, RunStatus};
use rekey::engine::verify;

#[test]
fn crm_fixture_migrates_with_every_reference_intact() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);
    assert_eq!(plan.order, vec!["Project", "Task", "Comment"]);
    assert_eq!(plan.self_edges.len(), 1);

    let run = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
        .expect("migration commits");
    assert_eq!(run.status, RunStatus::Committed);
    assert_crm_migrated(&fx);

    assert_eq!(run.counts["Project"].mappings_created, 2);
    assert_eq!(run.counts["Task"].rows_remapped, 5);
    // projectId on five tasks plus three parentIds
    assert_eq!(run.counts["Task"].fk_values_rewritten, 8);
    assert_eq!(run.counts["Comment"].fk_values_rewritten, 10);
    assert_eq!(run.orphans().count(), 0);

    let verification = verify::verify(&fx.pool, &graph, &config.verify, 2).unwrap();
    assert!(verification.is_clean());
    let report = CompletionReport::build(Some(&run), Some(&plan), &verification, config.mode);
    assert_eq!(report.exit_code, EXIT_CLEAN);
    assert_eq!(report.rows_remapped, 17);
    assert_eq!(report.order, plan.order);
}

#[test]
fn new_ids_follow_plan_and_key_order() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);
    coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();

    let conn = fx.conn();
    let mut previous_max: Option<String> = None;
    for table in &plan.order {
        let entries = mapping::export(&conn, table, None).unwrap();
        assert!(!entries.is_empty());
        // export is ordered by old id, and old ids were visited ascending
        for pair in entries.windows(2) {
            assert!(pair[0].new_id < pair[1].new_id, "{table} ids not increasing");
        }
        if let Some(prev) = &previous_max {
            assert!(prev < &entries[0].new_id, "{table} minted before its parent");
        }
        previous_max = entries.iter().map(|e| e.new_id.clone()).max();
    }
}

#[test]
fn second_run_changes_nothing() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);
    coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    let before = fx.strings("SELECT id || ':' || taskId FROM Comment ORDER BY id");

    let again =
        coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    assert_eq!(again.status, RunStatus::Committed);
    assert!(again.counts.values().all(|c| c.is_empty()));
    assert_eq!(fx.strings("SELECT id || ':' || taskId FROM Comment ORDER BY id"), before);

    let conn = fx.conn();
    assert_eq!(mapping::count(&conn, "Comment").unwrap(), 10);
    let latest = MigrationRun::latest(&conn).unwrap().unwrap();
    assert_eq!(latest.run_id, again.run_id);
}

#[test]
fn single_and_per_batch_scopes_reach_the_same_result() {
    for scope in [ScopeMode::Single, ScopeMode::PerBatch] {
        let fx = Fixture::crm();
        let graph = fx.graph(crm_descriptors());
        let mut config = test_config();
        config.scope = scope;
        config.mode = ViolationMode::Lenient;
        let plan = plan(&graph, &config);
        let run = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
            .unwrap_or_else(|e| panic!("{scope:?}: {e}"));
        assert_eq!(run.scope_mode, scope);
        assert_crm_migrated(&fx);
    }
}

#[test]
fn audit_log_records_one_line_per_committed_scope() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let config = test_config();
    let plan = plan(&graph, &config);
    let log_path = fx.dir.path().join("audit/rekey.jsonl");
    let opts = RunOptions {
        audit: Some(AuditLog::new(&log_path)),
        ..RunOptions::default()
    };
    let run = coordinator::execute(&fx.pool, &graph, &plan, &config, opts).unwrap();

    let events = AuditLog::new(&log_path).read_all().unwrap();
    let scopes: Vec<&str> = events.iter().map(|e| e.scope.as_str()).collect();
    assert_eq!(scopes, vec!["table:Project", "table:Task", "table:Comment"]);
    assert!(events.iter().all(|e| e.run_id == run.run_id));
    assert!(events.iter().all(|e| e.status == "committed"));
}

#[test]
fn deferred_edges_are_cascaded_last() {
    let fx = Fixture::crm();
    let graph = fx.graph(crm_descriptors());
    let mut config = test_config();
    config.deferred_edges = vec![rekey::core::config::DeferredEdgeConfig {
        table: "Comment".into(),
        column: "taskId".into(),
    }];
    let plan = plan(&graph, &config);
    assert_eq!(plan.units().last().map(|u| u.key()), Some("deferred".to_string()));

    let run =
        coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default()).unwrap();
    assert_eq!(run.counts["Comment"].fk_values_rewritten, 10);
    assert_crm_migrated(&fx);
}

/// Comment threads whose replies carry legacy keys that sort before the
/// comment they answer.
const THREADED_SQL: &str = "
    CREATE TABLE Project (id TEXT PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE Task (
        id TEXT PRIMARY KEY,
        projectId TEXT NOT NULL REFERENCES Project(id),
        title TEXT NOT NULL
    );
    CREATE TABLE Comment (
        id TEXT PRIMARY KEY,
        taskId TEXT NOT NULL REFERENCES Task(id),
        parentId TEXT REFERENCES Comment(id),
        body TEXT NOT NULL
    );

    INSERT INTO Project VALUES ('p1', 'p1'), ('p2', 'p2');
    INSERT INTO Task VALUES
        ('t1', 'p1', 't1'), ('t2', 'p1', 't2'), ('t3', 'p1', 't3'),
        ('t4', 'p2', 't4'), ('t5', 'p2', 't5');
    INSERT INTO Comment VALUES
        ('a01', 't1', 'z10', 'a01'), ('a02', 't1', NULL, 'a02'),
        ('a03', 't2', 'z09', 'a03'), ('a04', 't2', NULL, 'a04'),
        ('a05', 't3', 'a02', 'a05'), ('z06', 't3', NULL, 'z06'),
        ('z07', 't4', NULL, 'z07'), ('z08', 't4', NULL, 'z08'),
        ('z09', 't5', NULL, 'z09'), ('z10', 't5', NULL, 'z10');
";

fn threaded_descriptors() -> Vec<TableDescriptor> {
    vec![
        TableDescriptor::new("Comment", "id")
            .with_fk("taskId", "Task")
            .with_fk("parentId", "Comment"),
        TableDescriptor::new("Project", "id"),
        TableDescriptor::new("Task", "id").with_fk("projectId", "Project"),
    ]
}

#[test]
fn threaded_comments_keep_their_replies_in_every_scope() {
    for scope in [ScopeMode::Single, ScopeMode::PerTable, ScopeMode::PerBatch] {
        for batch_size in [1, 3, 500] {
            let fx = Fixture::new(THREADED_SQL);
            let graph = fx.graph(threaded_descriptors());
            let mut config = test_config();
            config.scope = scope;
            config.batch_size = batch_size;
            let plan = plan(&graph, &config);
            assert_eq!(plan.order, vec!["Project", "Task", "Comment"]);

            let run = coordinator::execute(&fx.pool, &graph, &plan, &config, RunOptions::default())
                .unwrap_or_else(|e| panic!("{scope:?}/{batch_size}: {e}"));
            assert_eq!(run.status, RunStatus::Committed);

            for sql in [
                "SELECT id FROM Project",
                "SELECT id FROM Task",
                "SELECT id FROM Comment",
                "SELECT projectId FROM Task",
                "SELECT taskId FROM Comment",
                "SELECT parentId FROM Comment WHERE parentId IS NOT NULL",
            ] {
                for value in fx.strings(sql) {
                    assert!(is_target_id(&value), "{scope:?}/{batch_size} {sql}: {value}");
                }
            }
            let replies = fx.pairs(
                "SELECT c.body, parent.body
                 FROM Comment c JOIN Comment parent ON parent.id = c.parentId
                 ORDER BY c.body",
            );
            let expected: Vec<(String, String)> = [("a01", "z10"), ("a03", "z09"), ("a05", "a02")]
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect();
            assert_eq!(replies, expected, "{scope:?}/{batch_size}");
            assert_eq!(
                fx.strings(
                    "SELECT c.body || '>' || t.title || '>' || p.name
                     FROM Comment c
                     JOIN Task t ON t.id = c.taskId
                     JOIN Project p ON p.id = t.projectId
                     WHERE c.body IN ('a01', 'z10')
                     ORDER BY c.body"
                ),
                vec!["a01>t1>p1", "z10>t5>p2"]
            );

            let verification = verify::verify(&fx.pool, &graph, &config.verify, 2).unwrap();
            assert!(verification.is_clean(), "{scope:?}/{batch_size}");
            assert_eq!(verification.unmigrated_keys(), 0);
        }
    }
}
