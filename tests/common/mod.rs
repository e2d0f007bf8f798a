//! Shared CRM fixture for engine integration tests.
#![allow(dead_code)]

use rekey::core::config::RekeyConfig;
use rekey::core::pool::SqlitePool;
use rekey::engine::graph::{SchemaGraph, TableDescriptor};
use rekey::engine::idgen::is_target_id;
use rekey::engine::resolver::{self, MigrationPlan};
use rusqlite::Connection;
use std::path::PathBuf;
use tempfile::TempDir;

/// Two projects, five tasks (three with a parent) and ten comments.
///
/// Every row carries its legacy id in a label column, so relationships can be
/// compared before and after the keys change.
pub const CRM_SQL: &str = "
    CREATE TABLE Project (id TEXT PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE Task (
        id TEXT PRIMARY KEY,
        projectId TEXT NOT NULL REFERENCES Project(id),
        parentId TEXT REFERENCES Task(id),
        title TEXT NOT NULL
    );
    CREATE TABLE Comment (
        id TEXT PRIMARY KEY,
        taskId TEXT NOT NULL REFERENCES Task(id),
        body TEXT NOT NULL
    );

    INSERT INTO Project VALUES ('prj-1', 'prj-1'), ('prj-2', 'prj-2');
    INSERT INTO Task VALUES
        ('tsk-1', 'prj-1', NULL, 'tsk-1'),
        ('tsk-2', 'prj-1', 'tsk-1', 'tsk-2'),
        ('tsk-3', 'prj-1', 'tsk-1', 'tsk-3'),
        ('tsk-4', 'prj-2', NULL, 'tsk-4'),
        ('tsk-5', 'prj-2', 'tsk-4', 'tsk-5');
    INSERT INTO Comment VALUES
        ('cmt-01', 'tsk-1', 'cmt-01'), ('cmt-02', 'tsk-1', 'cmt-02'),
        ('cmt-03', 'tsk-2', 'cmt-03'), ('cmt-04', 'tsk-2', 'cmt-04'),
        ('cmt-05', 'tsk-3', 'cmt-05'), ('cmt-06', 'tsk-3', 'cmt-06'),
        ('cmt-07', 'tsk-4', 'cmt-07'), ('cmt-08', 'tsk-4', 'cmt-08'),
        ('cmt-09', 'tsk-5', 'cmt-09'), ('cmt-10', 'tsk-5', 'cmt-10');
";

pub struct Fixture {
    pub dir: TempDir,
    pub db: PathBuf,
    pub pool: SqlitePool,
}

impl Fixture {
    pub fn new(sql: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("crm.db");
        let conn = Connection::open(&db).expect("open fixture db");
        // Bundled SQLite enforces foreign keys; orphan fixtures need them off.
        conn.pragma_update(None, "foreign_keys", false)
            .expect("disable foreign keys");
        conn.execute_batch(sql).expect("seed fixture db");
        drop(conn);
        let pool = SqlitePool::new(&db);
        Self { dir, db, pool }
    }

    pub fn crm() -> Self {
        Self::new(CRM_SQL)
    }

    pub fn conn(&self) -> Connection {
        let conn = Connection::open(&self.db).expect("open fixture db");
        conn.pragma_update(None, "foreign_keys", false)
            .expect("disable foreign keys");
        conn
    }

    pub fn graph(&self, descriptors: Vec<TableDescriptor>) -> SchemaGraph {
        let mut graph = SchemaGraph::build(descriptors).expect("valid descriptors");
        self.pool
            .with_read(|conn| graph.check_live(conn))
            .expect("descriptors match the database");
        graph
    }

    /// Strings from a single-column query, in query order.
    pub fn strings(&self, sql: &str) -> Vec<String> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).expect("prepare");
        stmt.query_map([], |row| row.get::<_, String>(0))
            .expect("query")
            .map(|r| r.expect("row"))
            .collect()
    }

    /// Pairs from a two-column query, in query order.
    pub fn pairs(&self, sql: &str) -> Vec<(String, String)> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).expect("prepare");
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("query")
            .map(|r| r.expect("row"))
            .collect()
    }
}

pub fn crm_descriptors() -> Vec<TableDescriptor> {
    vec![
        TableDescriptor::new("Comment", "id").with_fk("taskId", "Task"),
        TableDescriptor::new("Project", "id"),
        TableDescriptor::new("Task", "id")
            .with_fk("projectId", "Project")
            .with_fk("parentId", "Task"),
    ]
}

/// Small batches so every phase spans several of them.
pub fn test_config() -> RekeyConfig {
    RekeyConfig {
        batch_size: 2,
        workers: 2,
        ..RekeyConfig::default()
    }
}

pub fn plan(graph: &SchemaGraph, config: &RekeyConfig) -> MigrationPlan {
    resolver::resolve(graph, &config.deferred_edges).expect("acyclic plan")
}

/// Comment label, task label and project label joined through the live keys.
pub const COMMENT_CHAIN_SQL: &str = "
    SELECT c.body || '>' || t.title || '>' || p.name
    FROM Comment c
    JOIN Task t ON t.id = c.taskId
    JOIN Project p ON p.id = t.projectId
    ORDER BY c.body";

pub const TASK_PARENT_SQL: &str = "
    SELECT t.title, parent.title
    FROM Task t JOIN Task parent ON parent.id = t.parentId
    ORDER BY t.title";

pub fn expected_chains() -> Vec<String> {
    [
        "cmt-01>tsk-1>prj-1",
        "cmt-02>tsk-1>prj-1",
        "cmt-03>tsk-2>prj-1",
        "cmt-04>tsk-2>prj-1",
        "cmt-05>tsk-3>prj-1",
        "cmt-06>tsk-3>prj-1",
        "cmt-07>tsk-4>prj-2",
        "cmt-08>tsk-4>prj-2",
        "cmt-09>tsk-5>prj-2",
        "cmt-10>tsk-5>prj-2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn expected_parents() -> Vec<(String, String)> {
    [("tsk-2", "tsk-1"), ("tsk-3", "tsk-1"), ("tsk-5", "tsk-4")]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

/// Every key and reference in the CRM fixture is a ULID and every
/// relationship survived.
pub fn assert_crm_migrated(fx: &Fixture) {
    for sql in [
        "SELECT id FROM Project",
        "SELECT id FROM Task",
        "SELECT id FROM Comment",
        "SELECT projectId FROM Task",
        "SELECT parentId FROM Task WHERE parentId IS NOT NULL",
        "SELECT taskId FROM Comment",
    ] {
        for value in fx.strings(sql) {
            assert!(is_target_id(&value), "{sql}: {value} is not a ULID");
        }
    }
    assert_eq!(fx.strings(COMMENT_CHAIN_SQL), expected_chains());
    assert_eq!(fx.pairs(TASK_PARENT_SQL), expected_parents());
}
