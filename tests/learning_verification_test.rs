use dbguru::execution::{QueryResult, SqliteExecutor};
use dbguru::execution_loop::ErrorKind;
use dbguru::learning::CorrectionLearner;
use dbguru::learning_store::SqliteCorrectionStore;
use dbguru::schema::SchemaProvider;
use dbguru::sql_generation::DatabaseKind;
use dbguru::verification::{IssueKind, ResultVerifier};
use serde_json::json;
use std::sync::Arc;

fn learner_at(path: &std::path::Path) -> CorrectionLearner {
    CorrectionLearner::new(Arc::new(SqliteCorrectionStore::open(path).unwrap()), true)
}

#[test]
fn test_learning_same_fix_twice_reinforces_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let learner = learner_at(&dir.path().join("corrections.db"));

    let learn = || {
        learner
            .learn(
                ErrorKind::ColumnNotFound,
                "SELECT emial FROM customers",
                "no such column: emial",
                "SELECT email FROM customers",
                DatabaseKind::Sqlite,
                true,
            )
            .unwrap()
    };
    let first = learn().unwrap();
    let second = learn().unwrap();
    assert_eq!(first, second);

    let all = learner.list(10).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].times_applied, 2);
    assert!((all[0].confidence_score - 0.8).abs() < 1e-9);
}

#[test]
fn test_corrections_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("corrections.db");
    {
        let learner = learner_at(&path);
        learner
            .learn(
                ErrorKind::TableNotFound,
                "SELECT * FROM ordrs",
                "no such table: ordrs",
                "SELECT * FROM orders",
                DatabaseKind::Sqlite,
                true,
            )
            .unwrap();
    }

    let reopened = learner_at(&path);
    let found = reopened
        .find_applicable(ErrorKind::TableNotFound, "no such table: ordrs", DatabaseKind::Sqlite, None, 5)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].corrected_sql, "SELECT * FROM orders");

    // Different dialect never matches
    let other = reopened
        .find_applicable(ErrorKind::TableNotFound, "no such table: ordrs", DatabaseKind::Mysql, None, 5)
        .unwrap();
    assert!(other.is_empty());
}

#[test]
fn test_confidence_and_success_rate_stay_bounded() {
    let learner = CorrectionLearner::new(Arc::new(SqliteCorrectionStore::in_memory().unwrap()), true);
    let id = learner
        .learn(
            ErrorKind::SyntaxError,
            "SELEC 1",
            "near \"SELEC\": syntax error",
            "SELECT 1",
            DatabaseKind::Sqlite,
            true,
        )
        .unwrap()
        .unwrap();

    for _ in 0..25 {
        let c = learner.record_application(id, "SELECT 1", true).unwrap().unwrap();
        assert!(c.confidence_score <= 1.0);
        assert!((0.0..=1.0).contains(&c.success_rate));
    }
    let mut last_applied = 0;
    for _ in 0..25 {
        let c = learner.record_application(id, "SELECT 1", false).unwrap().unwrap();
        assert!(c.confidence_score >= 0.0);
        assert!((0.0..=1.0).contains(&c.success_rate));
        assert!(c.times_applied >= last_applied);
        last_applied = c.times_applied;
    }

    let c = learner.record_application(id, "SELECT 1", false).unwrap().unwrap();
    assert_eq!(c.confidence_score, 0.0);

    // Low confidence corrections are no longer offered
    let found = learner
        .find_applicable(ErrorKind::SyntaxError, "near \"SELEC\": syntax error", DatabaseKind::Sqlite, None, 5)
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn test_disabled_learning_is_inert() {
    let learner = CorrectionLearner::new(Arc::new(SqliteCorrectionStore::in_memory().unwrap()), false);
    let learned = learner
        .learn(
            ErrorKind::TableNotFound,
            "SELECT * FROM ordrs",
            "no such table: ordrs",
            "SELECT * FROM orders",
            DatabaseKind::Sqlite,
            true,
        )
        .unwrap();
    assert_eq!(learned, None);
    assert!(!learner.stats().unwrap().learning_enabled);
}

async fn inventory() -> SqliteExecutor {
    let executor = SqliteExecutor::open_in_memory().unwrap();
    executor
        .execute_batch(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, stock INTEGER);
             CREATE TABLE returns (id INTEGER PRIMARY KEY, product_id INTEGER);
             INSERT INTO products (name, stock) VALUES ('bolt', 10), ('nut', 0), ('washer', 4);",
        )
        .unwrap();
    executor
}

#[tokio::test]
async fn test_empty_result_diagnostics_find_empty_table() {
    let executor = inventory().await;
    let schema = executor.snapshot().await.unwrap();
    let verifier = ResultVerifier::default();

    let sql = "SELECT * FROM returns WHERE product_id = 1";
    let empty = QueryResult::from_values(&["id", "product_id"], vec![]);
    let verification = verifier.verify("show returns for bolts", sql, &empty, &schema, DatabaseKind::Sqlite);
    assert!(verification.is_suspicious);
    assert_eq!(verification.issue_kind, IssueKind::EmptyResult);
    assert_eq!(verification.diagnostic_queries.as_ref().unwrap().len(), 2);

    let report = verifier
        .run_diagnostics(sql, &verification, &executor, DatabaseKind::Sqlite)
        .await;
    assert!(report.table_exists);
    assert!(!report.table_has_data);
    assert_eq!(report.row_count, Some(0));
    assert!(report.diagnosis.starts_with("Table exists but is empty"));
}

#[tokio::test]
async fn test_empty_result_on_populated_table_blames_query() {
    let executor = inventory().await;
    let schema = executor.snapshot().await.unwrap();
    let verifier = ResultVerifier::default();

    let sql = "SELECT * FROM products WHERE stock > 100";
    let empty = QueryResult::from_values(&["id", "name", "stock"], vec![]);
    let verification = verifier.verify("overstocked products", sql, &empty, &schema, DatabaseKind::Sqlite);

    let report = verifier
        .run_diagnostics(sql, &verification, &executor, DatabaseKind::Sqlite)
        .await;
    assert!(report.table_has_data);
    assert_eq!(report.row_count, Some(3));
    assert_eq!(report.sample_data.as_ref().map(Vec::len), Some(3));

    let hints = verifier.generate_improvement_hints(&verification, Some(&report));
    assert!(hints.contains("query logic might need adjustment"));
}

#[test]
fn test_verifier_checks_are_bounded_and_ordered() {
    let verifier = ResultVerifier::default();
    let schema = dbguru::schema::SchemaSnapshot::new();
    let cases = vec![
        (QueryResult::from_values(&["total"], vec![vec![json!(null)]]), IssueKind::AllNulls),
        (QueryResult::from_values(&["total"], vec![vec![json!(5e12)]]), IssueKind::ExtremeValue),
        (QueryResult::from_values(&["count"], vec![vec![json!(-4)]]), IssueKind::NegativeCount),
        (QueryResult::from_values(&["total"], vec![vec![json!(42)]]), IssueKind::NoIssue),
    ];

    for (result, expected) in cases {
        let v = verifier.verify("what is the total", "SELECT SUM(x) FROM t", &result, &schema, DatabaseKind::Sqlite);
        assert_eq!(v.issue_kind, expected);
        assert!((0.0..=1.0).contains(&v.confidence));
        assert_eq!(v.is_suspicious, expected != IssueKind::NoIssue);
    }
}
