//! Execution Logging
//!
//! Structured logging for correction attempts, plus the human-readable
//! report of a finished run.

use crate::execution_loop::error_classifier::ErrorKind;
use crate::execution_loop::retry_loop::{CorrectionAttempt, RunOutcome, SqlSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const REPORT_TEXT_LIMIT: usize = 200;

/// Log entry for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptLog {
    pub run_id: Uuid,
    pub question: String,
    pub attempt: u32,
    pub source: Option<SqlSource>,
    pub error_kind: Option<ErrorKind>,
    pub db_error: Option<String>,
    pub sql: Option<String>,
    pub execution_time_ms: Option<f64>,
    pub row_count: Option<usize>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AttemptLog {
    pub fn new(run_id: Uuid, question: impl Into<String>) -> Self {
        Self {
            run_id,
            question: question.into(),
            attempt: 0,
            source: None,
            error_kind: None,
            db_error: None,
            sql: None,
            execution_time_ms: None,
            row_count: None,
            success: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: &CorrectionAttempt) -> Self {
        self.attempt = attempt.attempt_number;
        self.source = Some(attempt.source);
        self.sql = Some(attempt.sql.clone());
        self.execution_time_ms = attempt.execution_time_ms;
        self.row_count = attempt.row_count;
        match &attempt.error {
            Some(err) => self.with_error(attempt.error_kind, err.clone()),
            None => {
                self.success = attempt.succeeded;
                self
            }
        }
    }

    pub fn with_error(mut self, error_kind: ErrorKind, error_msg: String) -> Self {
        self.error_kind = Some(error_kind);
        self.db_error = Some(error_msg);
        self.success = false;
        self
    }

    /// Emit as a structured tracing event
    pub fn emit(&self) {
        let sql = self.sql.as_deref().map(|s| truncate(s, REPORT_TEXT_LIMIT)).unwrap_or_default();
        if self.success {
            info!(
                run_id = %self.run_id,
                attempt = self.attempt,
                source = ?self.source,
                rows = ?self.row_count,
                execution_time_ms = ?self.execution_time_ms,
                sql = %sql,
                "attempt succeeded"
            );
        } else {
            warn!(
                run_id = %self.run_id,
                attempt = self.attempt,
                source = ?self.source,
                error_kind = ?self.error_kind.map(|k| k.as_str()),
                error = %self.db_error.as_deref().map(|e| truncate(e, REPORT_TEXT_LIMIT)).unwrap_or_default(),
                sql = %sql,
                "attempt failed"
            );
        }
    }
}

/// Per-attempt line of a [`RunReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptDetail {
    pub attempt: u32,
    /// Truncated, with "..." appended when cut
    pub sql: String,
    pub success: bool,
    pub error_type: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: Option<f64>,
    pub row_count: Option<usize>,
}

impl From<&CorrectionAttempt> for AttemptDetail {
    fn from(attempt: &CorrectionAttempt) -> Self {
        let sql = if attempt.sql.chars().count() > REPORT_TEXT_LIMIT {
            format!("{}...", truncate(&attempt.sql, REPORT_TEXT_LIMIT))
        } else {
            attempt.sql.clone()
        };
        Self {
            attempt: attempt.attempt_number,
            sql,
            success: attempt.succeeded,
            error_type: attempt.error.as_ref().map(|_| attempt.error_kind.as_str().to_string()),
            error: attempt.error.as_deref().map(|e| truncate(e, REPORT_TEXT_LIMIT)),
            execution_time_ms: attempt.execution_time_ms,
            row_count: attempt.row_count,
        }
    }
}

/// Detailed report of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub summary: String,
    pub success: bool,
    pub total_attempts: u32,
    pub self_corrected: bool,
    pub final_sql: String,
    pub question: String,
    pub model_used: String,
    pub attempts: Vec<AttemptDetail>,
}

impl RunReport {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            run_id: outcome.run_id,
            summary: correction_summary(outcome),
            success: outcome.succeeded,
            total_attempts: outcome.total_attempts,
            self_corrected: outcome.self_corrected,
            final_sql: outcome.final_sql.clone(),
            question: outcome.question.clone(),
            model_used: outcome.model_used.clone(),
            attempts: outcome.attempts.iter().map(AttemptDetail::from).collect(),
        }
    }
}

/// One-line description of how a run went
pub fn correction_summary(outcome: &RunOutcome) -> String {
    let n = outcome.total_attempts;
    if outcome.succeeded {
        if n <= 1 {
            "Query succeeded on first try".to_string()
        } else {
            format!(
                "Query succeeded after {} attempts (auto-corrected from {} error(s))",
                n,
                n - 1
            )
        }
    } else {
        let error = outcome.last_error.as_deref().unwrap_or("unknown error");
        format!(
            "Query failed after {} attempts\nFinal error: {}",
            n,
            truncate(error, REPORT_TEXT_LIMIT)
        )
    }
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
