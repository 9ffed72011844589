//! Result Verification
//!
//! Post-execution sanity checks. A query can run cleanly and still answer
//! the wrong question; these checks look at the returned rows for the usual
//! symptoms (nothing back, only NULLs, absurd magnitudes, impossible counts)
//! and can run follow-up diagnostic queries to explain an empty result.

use crate::config::PipelineConfig;
use crate::execution::{ExecutionOptions, QueryResult, SqlExecutor};
use crate::schema::SchemaSnapshot;
use crate::sql_generation::DatabaseKind;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

lazy_static! {
    static ref TABLE_REFERENCE: Regex = Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][\w.]*)").unwrap();
    static ref CTE_NAME: Regex =
        Regex::new(r"(?i)(?:\bWITH(?:\s+RECURSIVE)?|,)\s*([A-Za-z_]\w*)\s*(?:\([^()]*\))?\s+AS\s*\(").unwrap();
    // Functions whose argument syntax uses FROM
    static ref FROM_IN_CALL: Regex =
        Regex::new(r"(?i)\b(?:EXTRACT|SUBSTRING|TRIM|POSITION|OVERLAY)\s*\([^()]*\)").unwrap();
}

const COUNT_INTENT: &[&str] = &["how many", "count", "number of", "total"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyResult,
    AllNulls,
    ExtremeValue,
    UnexpectedCount,
    NegativeCount,
    NoIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_suspicious: bool,
    /// How sure we are that something is wrong, in [0, 1]
    pub confidence: f64,
    pub issue_kind: IssueKind,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub diagnostic_queries: Option<Vec<String>>,
}

impl VerificationResult {
    fn no_issue(description: impl Into<String>) -> Self {
        Self {
            is_suspicious: false,
            confidence: 0.0,
            issue_kind: IssueKind::NoIssue,
            description: description.into(),
            suggested_fix: None,
            diagnostic_queries: None,
        }
    }

    fn issue(kind: IssueKind, confidence: f64, description: String, suggested_fix: &str) -> Self {
        Self {
            is_suspicious: true,
            confidence: confidence.clamp(0.0, 1.0),
            issue_kind: kind,
            description,
            suggested_fix: Some(suggested_fix.to_string()),
            diagnostic_queries: None,
        }
    }
}

/// Findings from the diagnostic queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub table_exists: bool,
    pub table_has_data: bool,
    pub column_exists: bool,
    pub sample_data: Option<Vec<crate::execution::Row>>,
    pub row_count: Option<i64>,
    pub diagnosis: String,
}

impl DiagnosticReport {
    fn assume_healthy() -> Self {
        Self {
            table_exists: true,
            table_has_data: true,
            column_exists: true,
            sample_data: None,
            row_count: None,
            diagnosis: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub table_exists: bool,
    pub table_has_data: bool,
    pub row_count: Option<i64>,
    pub diagnosis: String,
}

/// Flat, serialisable view of a verification and its diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub is_suspicious: bool,
    pub confidence: f64,
    pub issue_kind: IssueKind,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub diagnostics: Option<DiagnosticSummary>,
}

pub struct ResultVerifier {
    pub enable_diagnostics: bool,
    pub extreme_value_threshold: f64,
    pub diagnostic_timeout: Duration,
    pub diagnostic_max_rows: usize,
}

impl Default for ResultVerifier {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl ResultVerifier {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            enable_diagnostics: config.enable_diagnostics,
            extreme_value_threshold: config.extreme_value_threshold,
            diagnostic_timeout: config.diagnostic_timeout,
            diagnostic_max_rows: config.diagnostic_max_rows,
        }
    }

    pub fn with_extreme_value_threshold(mut self, threshold: f64) -> Self {
        self.extreme_value_threshold = threshold;
        self
    }

    /// Check a successful result for semantic red flags. Checks run in a
    /// fixed order and the first positive one is returned.
    pub fn verify(
        &self,
        question: &str,
        sql: &str,
        result: &QueryResult,
        schema: &SchemaSnapshot,
        database_kind: DatabaseKind,
    ) -> VerificationResult {
        if !result.success {
            return VerificationResult::no_issue("Query failed, cannot verify results");
        }

        let verdict = if result.row_count == 0 || result.data.is_empty() {
            Some(self.check_empty(sql, schema))
        } else if has_all_nulls(result) {
            Some(VerificationResult::issue(
                IssueKind::AllNulls,
                0.8,
                "All values in the result are NULL. This usually indicates wrong column names or JOINs.".to_string(),
                "Check column names in SELECT clause, verify JOIN conditions, or check for missing data",
            ))
        } else {
            self.check_extreme_values(result)
                .or_else(|| check_unexpected_count(question, sql, result))
                .or_else(|| check_negative_count(result))
        };

        match verdict {
            Some(found) => {
                info!(
                    "Result verification flagged {:?} (confidence {:.2}) on {}",
                    found.issue_kind, found.confidence, database_kind
                );
                found
            }
            None => {
                debug!("Result verification passed");
                VerificationResult::no_issue("Results look valid")
            }
        }
    }

    fn check_empty(&self, sql: &str, schema: &SchemaSnapshot) -> VerificationResult {
        let tables = extract_table_names(sql, schema);
        let diagnostic_queries: Vec<String> = tables
            .iter()
            .flat_map(|t| {
                [
                    format!("SELECT COUNT(*) as count FROM {}", t),
                    format!("SELECT * FROM {} LIMIT 5", t),
                ]
            })
            .collect();

        let mut found = VerificationResult::issue(
            IssueKind::EmptyResult,
            0.7,
            format!(
                "Query returned 0 rows. This might be correct, but let's verify the table(s) {} actually contain data.",
                tables.join(", ")
            ),
            "Verify table has data, check WHERE clause filters, or adjust query logic",
        );
        found.diagnostic_queries = Some(diagnostic_queries);
        found
    }

    fn check_extreme_values(&self, result: &QueryResult) -> Option<VerificationResult> {
        let (column, value) = result.data.iter().find_map(|row| {
            result.cells(row).into_iter().find_map(|(col, val)| {
                let number = val.as_f64()?;
                (number.abs() > self.extreme_value_threshold).then(|| (col.to_string(), val.clone()))
            })
        })?;

        Some(VerificationResult::issue(
            IssueKind::ExtremeValue,
            0.6,
            format!(
                "Found extreme value: {} in column '{}'. This might indicate wrong aggregation or calculation.",
                value, column
            ),
            "Check aggregation functions (SUM, COUNT), verify JOIN multipliers, or check data types",
        ))
    }

    /// Run the diagnostic queries attached to `verification` through
    /// `executor`. Failures are recorded as an inaccessible table.
    pub async fn run_diagnostics(
        &self,
        sql: &str,
        verification: &VerificationResult,
        executor: &dyn SqlExecutor,
        database_kind: DatabaseKind,
    ) -> DiagnosticReport {
        let mut report = DiagnosticReport::assume_healthy();

        if !self.enable_diagnostics {
            info!("Diagnostics disabled, skipping");
            report.diagnosis = "Diagnostics disabled".to_string();
            return report;
        }

        let queries = verification.diagnostic_queries.as_deref().unwrap_or_default();
        if !queries.is_empty() {
            info!(
                "Running {} diagnostic queries on {} for: {}",
                queries.len(),
                database_kind,
                sql.chars().take(100).collect::<String>()
            );
        }

        let options = ExecutionOptions::new(self.diagnostic_max_rows, self.diagnostic_timeout, false);
        for query in queries {
            match executor.execute(query, &options).await {
                Ok(result) if result.success => {
                    if query.to_uppercase().contains("COUNT(") {
                        if let Some(count) = result.first_value().and_then(Value::as_i64) {
                            report.row_count = Some(count);
                            report.table_has_data = count > 0;
                            debug!("Table has {} rows", count);
                        }
                    } else {
                        debug!("Retrieved {} sample rows", result.row_count);
                        report.sample_data = Some(result.data);
                    }
                }
                Ok(result) => {
                    warn!("Diagnostic query failed: {:?}", result.error);
                    report.table_exists = false;
                }
                Err(e) => {
                    warn!("Error running diagnostic query: {}", e);
                    report.table_exists = false;
                }
            }
        }

        report.diagnosis = if !report.table_has_data {
            "Table exists but is empty. The query is correct but there's no data to return."
        } else if !report.table_exists {
            "Table does not exist or is not accessible."
        } else {
            "Table exists and has data. The query logic might need adjustment."
        }
        .to_string();

        report
    }

    /// Human-readable hint block for a regeneration prompt or a user
    pub fn generate_improvement_hints(
        &self,
        verification: &VerificationResult,
        diagnostics: Option<&DiagnosticReport>,
    ) -> String {
        let mut hints = vec![format!("Issue detected: {}", verification.description)];

        if let Some(fix) = &verification.suggested_fix {
            hints.push(format!("Suggested fix: {}", fix));
        }

        if let Some(diag) = diagnostics {
            hints.push(format!("Diagnostics: {}", diag.diagnosis));
            if let Some(count) = diag.row_count {
                hints.push(format!("Table has {} rows", count));
            }
            if let Some(sample) = diag.sample_data.as_ref().filter(|s| !s.is_empty()) {
                hints.push(format!("Sample data available: {} rows", sample.len()));
            }
        }

        let generic: &[&str] = match verification.issue_kind {
            IssueKind::EmptyResult => &[
                "Are the WHERE clause filters too restrictive?",
                "Are you using the correct table name?",
                "Do you need to use LEFT JOIN instead of INNER JOIN?",
            ],
            IssueKind::AllNulls => &[
                "Are column names correct?",
                "Are JOIN conditions correct?",
                "Are you selecting from the right table?",
            ],
            IssueKind::ExtremeValue => &[
                "Are you using SUM when you should use COUNT?",
                "Are JOINs creating duplicate rows?",
                "Do you need DISTINCT?",
            ],
            _ => &[],
        };
        hints.extend(generic.iter().map(|h| format!("Consider: {}", h)));

        hints.join("\n")
    }

    pub fn summarize(
        &self,
        verification: &VerificationResult,
        diagnostics: Option<&DiagnosticReport>,
    ) -> VerificationSummary {
        VerificationSummary {
            is_suspicious: verification.is_suspicious,
            confidence: verification.confidence,
            issue_kind: verification.issue_kind,
            description: verification.description.clone(),
            suggested_fix: verification.suggested_fix.clone(),
            diagnostics: diagnostics.map(|d| DiagnosticSummary {
                table_exists: d.table_exists,
                table_has_data: d.table_has_data,
                row_count: d.row_count,
                diagnosis: d.diagnosis.clone(),
            }),
        }
    }
}

/// At least one row and no non-null value anywhere
fn has_all_nulls(result: &QueryResult) -> bool {
    !result.data.is_empty() && result.data.iter().all(|row| row.values().all(Value::is_null))
}

fn is_zero(value: &Value) -> bool {
    value.as_f64() == Some(0.0)
}

fn check_unexpected_count(question: &str, sql: &str, result: &QueryResult) -> Option<VerificationResult> {
    if !sql.to_uppercase().contains("COUNT(") {
        return None;
    }
    let question_lower = question.to_lowercase();
    if !COUNT_INTENT.iter().any(|kw| question_lower.contains(kw)) {
        return None;
    }

    let first = result.data.first()?;
    let cells = result.cells(first);
    let zero_count = cells
        .iter()
        .any(|(col, val)| col.to_lowercase().contains("count") && is_zero(val))
        || (cells.len() == 1 && is_zero(cells[0].1));

    zero_count.then(|| {
        VerificationResult::issue(
            IssueKind::UnexpectedCount,
            0.5,
            format!("COUNT returned 0 for question '{}'. Verify this is expected.", question),
            "Check table has data, verify WHERE clause filters",
        )
    })
}

fn check_negative_count(result: &QueryResult) -> Option<VerificationResult> {
    let value = result.data.iter().find_map(|row| {
        result.cells(row).into_iter().find_map(|(col, val)| {
            let negative = col.to_lowercase().contains("count") && val.as_f64().map_or(false, |n| n < 0.0);
            negative.then(|| val.clone())
        })
    })?;

    Some(VerificationResult::issue(
        IssueKind::NegativeCount,
        1.0,
        format!(
            "Negative count detected: {}. This indicates a serious error in the query.",
            value
        ),
        "Check query logic, aggregation functions, or data types",
    ))
}

/// Table names after FROM/JOIN, first occurrence order. CTE names are
/// skipped; names the schema knows take its casing, unknown names are kept
/// as written.
pub fn extract_table_names(sql: &str, schema: &SchemaSnapshot) -> Vec<String> {
    let scanned = FROM_IN_CALL.replace_all(sql, "NULL");
    let cte_names: Vec<String> = CTE_NAME
        .captures_iter(&scanned)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_lowercase()))
        .collect();

    TABLE_REFERENCE
        .captures_iter(&scanned)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str();
            if cte_names.contains(&name.to_lowercase()) {
                return None;
            }
            let known = schema.table_names().find(|t| t.eq_ignore_ascii_case(name));
            Some(known.unwrap_or(name).to_string())
        })
        .unique()
        .collect()
}
