//! Self-Correcting Retry Loop
//!
//! Bounded generate -> execute -> diagnose -> repair loop. Repairs are tried
//! in cost order: schema quick fix, then the LLM fix call (enriched with
//! hints and any learned corrections). Every attempt is recorded, and
//! collaborator failures are recorded like execution errors instead of
//! aborting the run.

use crate::config::PipelineConfig;
use crate::error::{GuruError, Result};
use crate::execution::{ExecutionOptions, QueryResult, SqlExecutor};
use crate::execution_loop::error_classifier::{extract_context, ErrorClassifier, ErrorKind};
use crate::execution_loop::error_recovery::ErrorRecovery;
use crate::execution_loop::schema_fixer::SchemaAwareFixer;
use crate::learning::correction_learner::{CorrectionLearner, CorrectionSummary};
use crate::observability::execution_log::AttemptLog;
use crate::schema::SchemaSnapshot;
use crate::sql_generation::{DatabaseKind, SqlGenerator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Slack past the statement budget before the loop gives up on an executor
/// that never answers. Executors enforce the budget themselves.
const EXECUTOR_GRACE: Duration = Duration::from_secs(1);

/// Where the SQL of an attempt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    Generated,
    Provided,
    QuickFix,
    LlmFix,
}

/// Record of one iteration of the loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    /// Starts at 1
    pub attempt_number: u32,
    pub sql: String,
    pub error: Option<String>,
    pub error_kind: ErrorKind,
    pub succeeded: bool,
    pub execution_time_ms: Option<f64>,
    pub row_count: Option<usize>,
    pub source: SqlSource,
}

/// Final outcome of a run, successful or exhausted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub question: String,
    pub succeeded: bool,
    pub final_sql: String,
    pub execution_result: Option<QueryResult>,
    pub attempts: Vec<CorrectionAttempt>,
    pub self_corrected: bool,
    pub total_attempts: u32,
    pub model_used: String,
    /// Verbatim text of the last failure, if any
    pub last_error: Option<String>,
}

/// Failed SQL carried into the next attempt's repair step
struct PendingRepair {
    sql: String,
    error: String,
}

/// Per-run state shared by `run` and `execute_with_retry`
struct RunState<'a> {
    run_id: Uuid,
    question: &'a str,
    attempts: Vec<CorrectionAttempt>,
    last_error: Option<String>,
}

impl<'a> RunState<'a> {
    fn new(question: &'a str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            question,
            attempts: Vec::new(),
            last_error: None,
        }
    }

    fn record(&mut self, attempt: CorrectionAttempt) {
        AttemptLog::new(self.run_id, self.question).with_attempt(&attempt).emit();
        if let Some(err) = &attempt.error {
            self.last_error = Some(err.clone());
        }
        self.attempts.push(attempt);
    }

    fn record_failure(&mut self, attempt_number: u32, sql: &str, error: String, kind: ErrorKind, source: SqlSource) {
        self.record(CorrectionAttempt {
            attempt_number,
            sql: sql.to_string(),
            error: Some(error),
            error_kind: kind,
            succeeded: false,
            execution_time_ms: None,
            row_count: None,
            source,
        });
    }
}

enum Execution {
    Succeeded(QueryResult),
    Failed { error: String, result: Option<QueryResult> },
}

pub struct SelfCorrectingLoop {
    generator: Arc<dyn SqlGenerator>,
    learner: Option<Arc<CorrectionLearner>>,
    classifier: ErrorClassifier,
    config: PipelineConfig,
}

impl SelfCorrectingLoop {
    pub fn new(generator: Arc<dyn SqlGenerator>, config: PipelineConfig) -> Self {
        Self {
            generator,
            learner: None,
            classifier: ErrorClassifier::new(),
            config,
        }
    }

    pub fn with_learner(mut self, learner: Option<Arc<CorrectionLearner>>) -> Self {
        self.learner = learner;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Generate SQL for `question`, execute it and repair failures until it
    /// succeeds or the attempt budget runs out.
    pub async fn run(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
        database_kind: DatabaseKind,
        allow_write: bool,
        model_hint: Option<&str>,
    ) -> Result<RunOutcome> {
        self.check_budget()?;
        let model_used = model_hint.unwrap_or_else(|| self.generator.default_model()).to_string();
        info!("Self-correcting run for question: {}", question);
        self.drive(question, schema, executor, database_kind, allow_write, model_hint, None, model_used)
            .await
    }

    /// Same loop for callers that already have SQL; skips generation.
    pub async fn execute_with_retry(
        &self,
        sql: &str,
        schema: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
        database_kind: DatabaseKind,
        question: &str,
        allow_write: bool,
    ) -> Result<RunOutcome> {
        self.check_budget()?;
        if sql.trim().is_empty() {
            return Err(GuruError::Pipeline("No SQL provided to execute".to_string()));
        }
        let model_used = self.generator.default_model().to_string();
        self.drive(
            question,
            schema,
            executor,
            database_kind,
            allow_write,
            None,
            Some(sql.to_string()),
            model_used,
        )
        .await
    }

    fn check_budget(&self) -> Result<()> {
        if self.config.max_retries == 0 {
            return Err(GuruError::Pipeline("max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        executor: &dyn SqlExecutor,
        database_kind: DatabaseKind,
        allow_write: bool,
        model_hint: Option<&str>,
        provided_sql: Option<String>,
        model_used: String,
    ) -> Result<RunOutcome> {
        let max_retries = self.config.max_retries;
        let fixer = SchemaAwareFixer::new(schema)
            .with_thresholds(self.config.match_threshold, self.config.apply_threshold);
        let options = ExecutionOptions::new(self.config.max_rows, self.config.execution_timeout, allow_write);

        let mut state = RunState::new(question);
        let mut provided = provided_sql;
        let mut pending: Option<PendingRepair> = None;
        let mut final_sql = String::new();

        for attempt_number in 1..=max_retries {
            info!("Attempt {}/{} (run {})", attempt_number, max_retries, state.run_id);

            // Obtain the SQL for this attempt
            let (sql, source) = if let Some(failed) = &pending {
                match self.repair(&fixer, failed, schema, database_kind).await {
                    Ok(repaired) => repaired,
                    Err(e) => {
                        let message = e.to_string();
                        warn!("Repair failed on attempt {}: {}", attempt_number, message);
                        let kind = self.classifier.classify(&message);
                        state.record_failure(attempt_number, &failed.sql, message, kind, SqlSource::LlmFix);
                        continue;
                    }
                }
            } else if let Some(sql) = provided.take() {
                (sql, SqlSource::Provided)
            } else {
                match self
                    .generator
                    .generate(question, schema, database_kind, allow_write, model_hint)
                    .await
                {
                    Ok(generated) => {
                        if !generated.is_valid {
                            warn!("Generated SQL failed validation: {:?}", generated.warnings);
                        }
                        (generated.sql, SqlSource::Generated)
                    }
                    Err(e) => {
                        let message = e.to_string();
                        error!("Generation failed on attempt {}: {}", attempt_number, message);
                        let kind = self.classifier.classify(&message);
                        state.record_failure(attempt_number, "", message, kind, SqlSource::Generated);
                        continue;
                    }
                }
            };

            // An empty repair leaves `pending` in place so the same failure
            // is repaired again.
            if sql.trim().is_empty() {
                let message = "SQL generator returned an empty statement".to_string();
                let failed_sql = pending.as_ref().map_or("", |p| p.sql.as_str()).to_string();
                state.record_failure(attempt_number, &failed_sql, message, ErrorKind::Unknown, source);
                continue;
            }

            final_sql = sql.clone();
            match self.execute(executor, &sql, &options).await {
                Execution::Succeeded(result) => {
                    state.record(CorrectionAttempt {
                        attempt_number,
                        sql: sql.clone(),
                        error: None,
                        error_kind: ErrorKind::Unknown,
                        succeeded: true,
                        execution_time_ms: Some(result.execution_time_ms),
                        row_count: Some(result.row_count),
                        source,
                    });
                    info!("Query succeeded on attempt {}/{}", attempt_number, max_retries);

                    if attempt_number > 1 {
                        self.learn_from_run(&state.attempts, &sql, database_kind).await;
                    }

                    return Ok(RunOutcome {
                        run_id: state.run_id,
                        question: question.to_string(),
                        succeeded: true,
                        final_sql: sql,
                        execution_result: Some(result),
                        self_corrected: state.attempts.len() > 1,
                        total_attempts: state.attempts.len() as u32,
                        attempts: state.attempts,
                        model_used,
                        last_error: None,
                    });
                }
                Execution::Failed { error, result } => {
                    let kind = self.classifier.classify(&error);
                    warn!(
                        "Attempt {} failed ({}): {}",
                        attempt_number,
                        kind,
                        error.chars().take(200).collect::<String>()
                    );
                    state.record(CorrectionAttempt {
                        attempt_number,
                        sql: sql.clone(),
                        error: Some(error.clone()),
                        error_kind: kind,
                        succeeded: false,
                        execution_time_ms: result.as_ref().map(|r| r.execution_time_ms),
                        row_count: result.as_ref().map(|r| r.row_count),
                        source,
                    });
                    pending = Some(PendingRepair { sql, error });
                }
            }
        }

        error!("Query failed after {} attempts", max_retries);
        Ok(RunOutcome {
            run_id: state.run_id,
            question: question.to_string(),
            succeeded: false,
            final_sql,
            execution_result: None,
            self_corrected: state.attempts.len() > 1,
            total_attempts: state.attempts.len() as u32,
            attempts: state.attempts,
            model_used,
            last_error: state.last_error,
        })
    }

    /// Execute with the statement budget in `options`; every failure mode
    /// becomes text. The outer deadline only catches executors that hang.
    async fn execute(&self, executor: &dyn SqlExecutor, sql: &str, options: &ExecutionOptions) -> Execution {
        let deadline = options.timeout + EXECUTOR_GRACE;
        match tokio::time::timeout(deadline, executor.execute(sql, options)).await {
            Err(_) => Execution::Failed {
                error: format!(
                    "Query timeout after {} seconds",
                    self.config.execution_timeout.as_secs_f64()
                ),
                result: None,
            },
            Ok(Err(e)) => Execution::Failed {
                error: e.to_string(),
                result: None,
            },
            Ok(Ok(result)) if result.success => Execution::Succeeded(result),
            Ok(Ok(result)) => Execution::Failed {
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Query failed without an error message".to_string()),
                result: Some(result),
            },
        }
    }

    /// Schema quick fix first; otherwise the LLM fix call with hints.
    async fn repair(
        &self,
        fixer: &SchemaAwareFixer,
        failed: &PendingRepair,
        schema: &SchemaSnapshot,
        database_kind: DatabaseKind,
    ) -> Result<(String, SqlSource)> {
        let kind = self.classifier.classify(&failed.error);
        let context = extract_context(&failed.error, kind);

        let quick = fixer.quick_fix(&failed.sql, kind, &failed.error, Some(&context));
        if quick.succeeded && quick.confidence >= self.config.apply_threshold {
            if let Some(fixed) = quick.fixed_sql.filter(|f| f != &failed.sql) {
                info!(
                    "Quick fix applied ({:.2}): {}",
                    quick.confidence,
                    quick.explanation.as_deref().unwrap_or("schema correction")
                );
                return Ok((fixed, SqlSource::QuickFix));
            }
        }

        let learned = self.learned_hints(kind, &failed.error, &failed.sql, database_kind).await;
        let prompt = ErrorRecovery::build_fix_prompt(&failed.error, &context, &learned);

        info!("Requesting LLM fix for {} error", kind);
        let fixed = self
            .generator
            .fix_error(&failed.sql, &prompt, schema, database_kind)
            .await?;
        if !fixed.is_valid {
            warn!("Corrected SQL failed validation: {:?}", fixed.warnings);
        }
        Ok((fixed.sql, SqlSource::LlmFix))
    }

    /// Learned corrections for the prompt. Lookup failures never stop the run.
    async fn learned_hints(
        &self,
        kind: ErrorKind,
        error: &str,
        sql: &str,
        database_kind: DatabaseKind,
    ) -> Vec<CorrectionSummary> {
        let learner = match &self.learner {
            Some(learner) => Arc::clone(learner),
            None => return Vec::new(),
        };
        let error = error.to_string();
        let sql = sql.to_string();
        let limit = self.config.learned_lookup_limit;

        let lookup = tokio::task::spawn_blocking(move || {
            learner.find_applicable(kind, &error, database_kind, Some(&sql), limit)
        })
        .await;

        match lookup {
            Ok(Ok(found)) => {
                if !found.is_empty() {
                    info!("Found {} learned corrections for {}", found.len(), kind);
                }
                found
            }
            Ok(Err(e)) => {
                warn!("Learned correction lookup failed: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("Learned correction lookup did not complete: {}", e);
                Vec::new()
            }
        }
    }

    /// Learn the net transformation from the first failure to `final_sql`.
    async fn learn_from_run(&self, attempts: &[CorrectionAttempt], final_sql: &str, database_kind: DatabaseKind) {
        let learner = match &self.learner {
            Some(learner) => Arc::clone(learner),
            None => return,
        };
        let first_failure = attempts
            .iter()
            .find(|a| !a.succeeded && !a.sql.trim().is_empty() && a.error.is_some());
        let (kind, original_sql, error) = match first_failure {
            Some(a) => (a.error_kind, a.sql.clone(), a.error.clone().unwrap_or_default()),
            None => return,
        };
        let final_sql = final_sql.to_string();

        let learned = tokio::task::spawn_blocking(move || {
            learner.learn(kind, &original_sql, &error, &final_sql, database_kind, true)
        })
        .await;

        match learned {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to learn from correction: {}", e),
            Err(e) => warn!("Learning task did not complete: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SqliteExecutor;
    use crate::learning_store::SqliteCorrectionStore;
    use crate::schema::TableSchema;
    use crate::sql_generation::GeneratedSql;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Generator that replays scripted responses
    struct ScriptedGenerator {
        generated: Mutex<VecDeque<Result<String>>>,
        fixes: Mutex<VecDeque<Result<String>>>,
        fix_calls: AtomicUsize,
        fix_prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(generated: Vec<Result<String>>, fixes: Vec<Result<String>>) -> Self {
            Self {
                generated: Mutex::new(generated.into()),
                fixes: Mutex::new(fixes.into()),
                fix_calls: AtomicUsize::new(0),
                fix_prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SqlGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _question: &str,
            _schema: &SchemaSnapshot,
            _database_kind: DatabaseKind,
            _allow_write: bool,
            _model_hint: Option<&str>,
        ) -> Result<GeneratedSql> {
            let next = self.generated.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(GuruError::Llm("script exhausted".to_string())))
                .map(GeneratedSql::checked)
        }

        async fn fix_error(
            &self,
            sql: &str,
            error_with_hints: &str,
            _schema: &SchemaSnapshot,
            _database_kind: DatabaseKind,
        ) -> Result<GeneratedSql> {
            self.fix_calls.fetch_add(1, Ordering::SeqCst);
            self.fix_prompts.lock().unwrap().push(error_with_hints.to_string());
            let next = self.fixes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(sql.to_string())).map(GeneratedSql::checked)
        }

        fn default_model(&self) -> &str {
            "scripted"
        }
    }

    fn products_db() -> (SqliteExecutor, SchemaSnapshot) {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .execute_batch(
                "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, price REAL);
                 INSERT INTO products (name, price) VALUES ('widget', 2.5), ('gadget', 10.0);",
            )
            .unwrap();
        let schema = SchemaSnapshot::new()
            .with_table("products", TableSchema::new(["id", "name", "price"]).with_primary_key("id"));
        (executor, schema)
    }

    fn learner() -> Arc<CorrectionLearner> {
        Arc::new(CorrectionLearner::new(Arc::new(SqliteCorrectionStore::in_memory().unwrap()), true))
    }

    #[tokio::test]
    async fn test_first_try_success() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok("SELECT COUNT(*) FROM products".into())], vec![]));
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default());

        let outcome = pipeline
            .run("how many products?", &schema, &executor, DatabaseKind::Sqlite, false, None)
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert!(!outcome.self_corrected);
        assert_eq!(outcome.total_attempts, 1);
        assert_eq!(outcome.model_used, "scripted");
        assert_eq!(outcome.attempts[0].source, SqlSource::Generated);
        assert_eq!(generator.fix_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_misspelled_table_fixed_without_llm() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok("SELECT COUNT(*) FROM prodcuts".into())], vec![]));
        let learner = learner();
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default())
            .with_learner(Some(learner.clone()));

        let outcome = pipeline
            .run("how many products?", &schema, &executor, DatabaseKind::Sqlite, false, Some("gpt-4"))
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert!(outcome.self_corrected);
        assert_eq!(outcome.total_attempts, 2);
        assert_eq!(outcome.final_sql, "SELECT COUNT(*) FROM products");
        assert_eq!(outcome.model_used, "gpt-4");
        assert_eq!(outcome.attempts[0].error_kind, ErrorKind::TableNotFound);
        assert_eq!(outcome.attempts[1].source, SqlSource::QuickFix);
        assert_eq!(generator.fix_calls.load(Ordering::SeqCst), 0);

        let stats = learner.stats().unwrap();
        assert_eq!(stats.total_corrections, 1);
        assert_eq!(stats.by_error_kind.get("table_not_found"), Some(&1));
    }

    #[tokio::test]
    async fn test_attempt_budget_is_exact() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(
            vec![Ok("SELECT * FROM nowhere_at_all".into())],
            vec![],
        ));
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default());

        let outcome = pipeline
            .run("q", &schema, &executor, DatabaseKind::Sqlite, false, None)
            .await
            .unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.total_attempts, 3);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.execution_result.is_none());
        assert!(outcome.last_error.unwrap().contains("nowhere_at_all"));
        let numbers: Vec<u32> = outcome.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(generator.fix_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fix_error_failure_is_recorded() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(
            vec![Ok("SELECT qqqqqq FROM products".into())],
            vec![
                Err(GuruError::Llm("upstream unavailable".into())),
                Ok("SELECT name FROM products".into()),
            ],
        ));
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default());

        let outcome = pipeline
            .run("list names", &schema, &executor, DatabaseKind::Sqlite, false, None)
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_attempts, 3);
        let second = &outcome.attempts[1];
        assert!(!second.succeeded);
        assert_eq!(second.sql, "SELECT qqqqqq FROM products");
        assert!(second.error.as_deref().unwrap().contains("upstream unavailable"));
        assert_eq!(outcome.attempts[2].source, SqlSource::LlmFix);
    }

    #[tokio::test]
    async fn test_generation_failure_is_recorded() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(
            vec![Err(GuruError::Llm("rate limited".into())), Ok("SELECT 1".into())],
            vec![],
        ));
        let pipeline = SelfCorrectingLoop::new(generator, PipelineConfig::default());

        let outcome = pipeline
            .run("q", &schema, &executor, DatabaseKind::Sqlite, false, None)
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_attempts, 2);
        assert_eq!(outcome.attempts[0].sql, "");
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_learned_corrections_feed_prompt_only() {
        let (executor, schema) = products_db();
        let learner = learner();
        learner
            .learn(
                ErrorKind::ColumnNotFound,
                "SELECT zzz FROM products",
                "no such column: zzz",
                "SELECT name FROM products",
                DatabaseKind::Sqlite,
                true,
            )
            .unwrap();

        let generator = Arc::new(ScriptedGenerator::new(
            vec![Ok("SELECT zzz FROM products".into())],
            vec![Ok("SELECT zzz FROM products".into())],
        ));
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default().with_max_retries(2))
            .with_learner(Some(learner));

        let outcome = pipeline
            .run("q", &schema, &executor, DatabaseKind::Sqlite, false, None)
            .await
            .unwrap();

        // The learned SQL is offered as a hint, never executed directly
        assert!(!outcome.succeeded);
        assert!(outcome.attempts.iter().all(|a| a.sql != "SELECT name FROM products"));
        let prompts = generator.fix_prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Previously successful fixes"));
        assert!(prompts[0].contains("SELECT name FROM products"));
    }

    #[tokio::test]
    async fn test_execute_with_retry_uses_provided_sql() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(vec![], vec![]));
        let pipeline = SelfCorrectingLoop::new(generator, PipelineConfig::default());

        let outcome = pipeline
            .execute_with_retry("SELECT nme FROM products", &schema, &executor, DatabaseKind::Sqlite, "", false)
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.attempts[0].source, SqlSource::Provided);
        assert_eq!(outcome.final_sql, "SELECT name FROM products");
    }

    #[tokio::test]
    async fn test_empty_repair_retries_same_failure() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(
            vec![],
            vec![Ok(String::new()), Ok("SELECT name FROM products".into())],
        ));
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default());

        let outcome = pipeline
            .execute_with_retry("SELECT qqqqqq FROM products", &schema, &executor, DatabaseKind::Sqlite, "", false)
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_attempts, 3);
        assert_eq!(outcome.attempts[1].sql, "SELECT qqqqqq FROM products");
        assert!(outcome.attempts.iter().all(|a| a.source != SqlSource::Generated));
        assert_eq!(generator.fix_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let (executor, schema) = products_db();
        let generator = Arc::new(ScriptedGenerator::new(vec![], vec![]));
        let pipeline = SelfCorrectingLoop::new(generator.clone(), PipelineConfig::default());
        let empty = pipeline
            .execute_with_retry("   ", &schema, &executor, DatabaseKind::Sqlite, "", false)
            .await;
        assert!(matches!(empty, Err(GuruError::Pipeline(_))));

        let zero = SelfCorrectingLoop::new(generator, PipelineConfig::default().with_max_retries(0));
        let result = zero.run("q", &schema, &executor, DatabaseKind::Sqlite, false, None).await;
        assert!(matches!(result, Err(GuruError::Pipeline(_))));
    }
}
