pub mod config;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod fuzzy_matcher;
pub mod learning;
pub mod learning_store;
pub mod llm;
pub mod observability;
pub mod schema;
pub mod sql_generation;
pub mod verification;

pub use config::{PipelineConfig, Settings};
pub use error::{GuruError, Result};
pub use execution::{ExecutionOptions, QueryResult, Row, SqlExecutor, SqliteExecutor};
pub use execution_loop::{CorrectionAttempt, ErrorKind, RunOutcome, SelfCorrectingLoop, SqlSource};
pub use learning::CorrectionLearner;
pub use learning_store::{CorrectionStore, SqliteCorrectionStore};
pub use observability::{correction_summary, RunReport};
pub use schema::{SchemaProvider, SchemaSnapshot, TableSchema};
pub use sql_generation::{DatabaseKind, GeneratedSql, SqlGenerator, SqlValidator};
pub use verification::{DiagnosticReport, ResultVerifier, VerificationResult};
