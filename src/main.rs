use dbguru::config::Settings;
use dbguru::execution::{QueryResult, SqliteExecutor};
use dbguru::execution_loop::{RunOutcome, SelfCorrectingLoop};
use dbguru::learning::CorrectionLearner;
use dbguru::learning_store::SqliteCorrectionStore;
use dbguru::llm::LlmSqlGenerator;
use dbguru::observability::RunReport;
use dbguru::schema::SchemaProvider;
use dbguru::sql_generation::DatabaseKind;
use dbguru::verification::ResultVerifier;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbguru")]
#[command(about = "Ask questions of a database in plain language, with self-correcting SQL")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question against a SQLite database
    Ask {
        /// The question in natural language
        question: String,

        /// Path to the SQLite database
        #[arg(short, long)]
        db: PathBuf,

        /// Check the result for suspicious values and run diagnostics
        #[arg(long)]
        verify: bool,

        /// Model override for generation
        #[arg(long)]
        model: Option<String>,

        /// Permit INSERT/UPDATE/DELETE statements
        #[arg(long)]
        allow_write: bool,

        /// Attempt budget (overrides DBGURU_MAX_RETRIES)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-query timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the detailed run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Execute SQL, repairing it automatically if it fails
    Exec {
        /// SQL to execute
        sql: String,

        /// Path to the SQLite database
        #[arg(short, long)]
        db: PathBuf,

        /// Permit INSERT/UPDATE/DELETE statements
        #[arg(long)]
        allow_write: bool,

        /// Print the detailed run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or prune learned corrections
    Corrections {
        #[command(subcommand)]
        action: CorrectionAction,
    },
}

#[derive(Subcommand)]
enum CorrectionAction {
    /// List learned corrections, most recent first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show learning statistics
    Stats,
    /// Delete a learned correction by id
    Delete { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env().context("Failed to load settings")?;

    match args.command {
        Commands::Ask { question, db, verify, model, allow_write, max_retries, timeout, json } => {
            if let Some(max_retries) = max_retries {
                settings.pipeline.max_retries = max_retries;
            }
            if let Some(secs) = timeout {
                settings.pipeline.execution_timeout = Duration::from_secs(secs.max(1));
            }
            settings.allow_write |= allow_write;
            ask(&settings, &db, &question, model.as_deref(), verify, json).await
        }
        Commands::Exec { sql, db, allow_write, json } => {
            settings.allow_write |= allow_write;
            exec(&settings, &db, &sql, json).await
        }
        Commands::Corrections { action } => corrections(&settings, action),
    }
}

fn build_loop(settings: &Settings) -> SelfCorrectingLoop {
    let learner = if settings.pipeline.enable_learning {
        match SqliteCorrectionStore::open(&settings.learning_db) {
            Ok(store) => Some(Arc::new(CorrectionLearner::new(Arc::new(store), true))),
            Err(e) => {
                warn!("Learning disabled, could not open correction store: {}", e);
                None
            }
        }
    } else {
        None
    };

    SelfCorrectingLoop::new(
        Arc::new(LlmSqlGenerator::from_settings(&settings.llm)),
        settings.pipeline.clone(),
    )
    .with_learner(learner)
}

fn open_database(db: &Path) -> Result<SqliteExecutor> {
    if !db.exists() {
        anyhow::bail!("Database not found: {}", db.display());
    }
    SqliteExecutor::open(db).with_context(|| format!("Failed to open {}", db.display()))
}

async fn ask(
    settings: &Settings,
    db: &Path,
    question: &str,
    model: Option<&str>,
    verify: bool,
    json: bool,
) -> Result<()> {
    let executor = open_database(db)?;
    let schema = executor.snapshot().await.context("Failed to read schema")?;
    info!("Loaded schema with {} tables", schema.tables.len());

    let pipeline = build_loop(settings);
    let outcome = pipeline
        .run(question, &schema, &executor, DatabaseKind::Sqlite, settings.allow_write, model)
        .await?;

    print_outcome(&outcome, json)?;

    if verify && outcome.succeeded {
        if let Some(result) = &outcome.execution_result {
            let verifier = ResultVerifier::from_config(&settings.pipeline);
            let verification = verifier.verify(question, &outcome.final_sql, result, &schema, DatabaseKind::Sqlite);
            let diagnostics = if verification.is_suspicious && verifier.enable_diagnostics {
                Some(
                    verifier
                        .run_diagnostics(&outcome.final_sql, &verification, &executor, DatabaseKind::Sqlite)
                        .await,
                )
            } else {
                None
            };

            println!("\n=== Verification ===");
            if verification.is_suspicious {
                println!("Suspicious ({:.0}% confidence): {}", verification.confidence * 100.0, verification.description);
                println!("{}", verifier.generate_improvement_hints(&verification, diagnostics.as_ref()));
            } else {
                println!("{}", verification.description);
            }
        }
    }
    Ok(())
}

async fn exec(settings: &Settings, db: &Path, sql: &str, json: bool) -> Result<()> {
    let executor = open_database(db)?;
    let schema = executor.snapshot().await.context("Failed to read schema")?;

    let pipeline = build_loop(settings);
    let outcome = pipeline
        .execute_with_retry(sql, &schema, &executor, DatabaseKind::Sqlite, "", settings.allow_write)
        .await?;
    print_outcome(&outcome, json)
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    let report = RunReport::from_outcome(outcome);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n=== SQL ===");
    println!("{}", outcome.final_sql);
    println!("\n{}", report.summary);

    if let Some(result) = &outcome.execution_result {
        print_table(result);
    }
    Ok(())
}

fn print_table(result: &QueryResult) {
    println!("\n{}", result.columns.join(" | "));
    println!("{}", "-".repeat(80));
    for row in &result.data {
        let cells: Vec<String> = result
            .cells(row)
            .into_iter()
            .map(|(_, value)| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
    println!("\n{} row(s){}", result.row_count, if result.truncated { " (truncated)" } else { "" });
}

fn corrections(settings: &Settings, action: CorrectionAction) -> Result<()> {
    let store = SqliteCorrectionStore::open(&settings.learning_db)?;
    let learner = CorrectionLearner::new(Arc::new(store), settings.pipeline.enable_learning);

    match action {
        CorrectionAction::List { limit } => {
            for c in learner.list(limit)? {
                println!(
                    "#{} [{}] {} (confidence {:.2}, applied {}x)",
                    c.id,
                    c.error_kind,
                    c.description.as_deref().unwrap_or("-"),
                    c.confidence_score,
                    c.times_applied
                );
                println!("    {}  ->  {}", c.original_sql, c.corrected_sql);
            }
        }
        CorrectionAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&learner.stats()?)?);
        }
        CorrectionAction::Delete { id } => {
            if learner.delete(id)? {
                println!("Deleted correction {}", id);
            } else {
                println!("No correction with id {}", id);
            }
        }
    }
    Ok(())
}
