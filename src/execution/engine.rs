//! Execution Engine Trait - Core contract for executing SQL
//!
//! The retry loop never opens or closes connections. Callers hand it an
//! engine that already wraps a live session and the loop only issues
//! statements through it.

use crate::error::Result;
use crate::execution::result::QueryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-call execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Rows beyond this are dropped and the result is marked truncated
    pub max_rows: usize,

    /// Wall-clock budget for the statement
    pub timeout: Duration,

    /// Whether statements other than reads may run
    pub allow_write: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            timeout: Duration::from_secs(30),
            allow_write: false,
        }
    }
}

impl ExecutionOptions {
    pub fn new(max_rows: usize, timeout: Duration, allow_write: bool) -> Self {
        Self {
            max_rows,
            timeout,
            allow_write,
        }
    }
}

/// SQL execution engine.
///
/// Database-reported failures (bad table, syntax, timeout, blocked write)
/// come back as `Ok(QueryResult)` with `success == false`. `Err` is reserved
/// for the engine itself breaking down.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Engine name (e.g., "sqlite")
    fn name(&self) -> &'static str;

    /// Execute one SQL statement
    async fn execute(&self, sql: &str, options: &ExecutionOptions) -> Result<QueryResult>;
}
