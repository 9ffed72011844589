//! Execution Module - SQL execution behind a pluggable engine trait
//!
//! - `SqlExecutor` is the contract the retry loop and the verifier execute through
//! - `QueryResult` is the fixed-shape outcome of one execution
//! - `SqliteExecutor` is the embedded engine used by the CLI and tests

pub mod engine;
pub mod result;
pub mod sqlite_engine;

pub use engine::{ExecutionOptions, SqlExecutor};
pub use result::{QueryResult, Row};
pub use sqlite_engine::SqliteExecutor;
