//! Correction Learner
//!
//! Turns successful self-corrections into reusable knowledge. A fix is keyed
//! by a fingerprint of the error (kind, normalized message, database kind and
//! the table/column it complained about) so structurally identical failures
//! later on can be pointed at the SQL that worked before.

use crate::error::Result;
use crate::execution_loop::error_classifier::{extract_column, extract_table, ErrorKind};
use crate::learning_store::{ApplicableQuery, CorrectionStore, LearnedCorrection, NewCorrection};
use crate::sql_generation::DatabaseKind;
use chrono::Utc;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

const INITIAL_CONFIDENCE: f64 = 0.7;
const LEARN_BOOST: f64 = 0.1;
const SUCCESS_BOOST: f64 = 0.05;
const FAILURE_PENALTY: f64 = 0.1;
const MIN_APPLICABLE_CONFIDENCE: f64 = 0.5;

lazy_static! {
    static ref DOUBLE_QUOTED: Regex = Regex::new(r#""[^"]*""#).unwrap();
    static ref SINGLE_QUOTED: Regex = Regex::new(r"'[^']*'").unwrap();
    static ref NUMBER: Regex = Regex::new(r"\b\d+\b").unwrap();
}

/// Compact view of a learned correction handed to callers and prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSummary {
    pub id: i64,
    pub description: String,
    pub original_sql: String,
    pub corrected_sql: String,
    pub confidence_score: f64,
    pub times_applied: u32,
    pub success_rate: f64,
}

impl From<LearnedCorrection> for CorrectionSummary {
    fn from(c: LearnedCorrection) -> Self {
        Self {
            id: c.id,
            description: c.description.unwrap_or_else(|| "Learned correction".to_string()),
            original_sql: c.original_sql,
            corrected_sql: c.corrected_sql,
            confidence_score: c.confidence_score,
            times_applied: c.times_applied,
            success_rate: c.success_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningStats {
    pub total_corrections: usize,
    pub by_error_kind: BTreeMap<String, usize>,
    pub top_corrections: Vec<CorrectionSummary>,
    pub learning_enabled: bool,
}

/// Lower-case the message and replace quoted literals and bare integers
/// with placeholders.
pub fn normalize_error(error_message: &str) -> String {
    let lower = error_message.to_lowercase();
    let lower = DOUBLE_QUOTED.replace_all(&lower, "\"<name>\"");
    let lower = SINGLE_QUOTED.replace_all(&lower, "'<name>'");
    NUMBER.replace_all(&lower, "<num>").into_owned()
}

/// Table or column pattern for a kind, lower-cased
fn patterns_for(kind: ErrorKind, error_message: &str) -> (Option<String>, Option<String>) {
    match kind {
        ErrorKind::TableNotFound => (extract_table(error_message).map(|t| t.to_lowercase()), None),
        ErrorKind::ColumnNotFound => (None, extract_column(error_message).map(|c| c.to_lowercase())),
        _ => (None, None),
    }
}

/// Word-level summary of what changed between two statements
fn describe_diff(original: &str, corrected: &str) -> String {
    let before: Vec<String> = original.to_lowercase().split_whitespace().map(String::from).unique().collect();
    let after: Vec<String> = corrected.to_lowercase().split_whitespace().map(String::from).unique().collect();
    let before_set: HashSet<&String> = before.iter().collect();
    let after_set: HashSet<&String> = after.iter().collect();

    let removed = before.iter().filter(|w| !after_set.contains(w)).take(3).join(", ");
    let added = after.iter().filter(|w| !before_set.contains(w)).take(3).join(", ");

    match (removed.is_empty(), added.is_empty()) {
        (false, false) => format!("Changed {} to {}", removed, added),
        (true, false) => format!("Added {}", added),
        (false, true) => format!("Removed {}", removed),
        (true, true) => "Minor correction".to_string(),
    }
}

pub struct CorrectionLearner {
    store: Arc<dyn CorrectionStore>,
    enable_learning: bool,
}

impl CorrectionLearner {
    pub fn new(store: Arc<dyn CorrectionStore>, enable_learning: bool) -> Self {
        Self { store, enable_learning }
    }

    pub fn is_enabled(&self) -> bool {
        self.enable_learning
    }

    /// Record that `corrected_sql` fixed `original_error`. A repeat of the
    /// same fingerprint bumps the existing record instead of adding one.
    pub fn learn(
        &self,
        error_kind: ErrorKind,
        original_sql: &str,
        original_error: &str,
        corrected_sql: &str,
        database_kind: DatabaseKind,
        was_successful: bool,
    ) -> Result<Option<i64>> {
        if !self.enable_learning || !was_successful {
            return Ok(None);
        }

        let (table_pattern, column_pattern) = patterns_for(error_kind, original_error);
        let description = match (&table_pattern, &column_pattern) {
            (Some(table), _) => format!("Fix for missing table: {}", table),
            (_, Some(column)) => format!("Fix for missing column: {}", column),
            _ => describe_diff(original_sql, corrected_sql),
        };

        let new = NewCorrection {
            error_kind,
            error_pattern: normalize_error(original_error),
            database_kind,
            original_sql: original_sql.to_string(),
            original_error: original_error.to_string(),
            corrected_sql: corrected_sql.to_string(),
            description: Some(description),
            table_pattern,
            column_pattern,
            confidence_score: INITIAL_CONFIDENCE,
        };

        let (id, created) = self.store.upsert(&new, &mut |existing| {
            existing.times_applied += 1;
            existing.last_applied_at = Utc::now();
            existing.confidence_score = (existing.confidence_score + LEARN_BOOST).min(1.0);
        })?;

        if created {
            info!("Learned new correction {} for {}", id, error_kind);
        } else {
            info!("Reinforced existing correction {} for {}", id, error_kind);
        }
        Ok(Some(id))
    }

    /// Learned corrections that may help with `error_message`, best first
    pub fn find_applicable(
        &self,
        error_kind: ErrorKind,
        error_message: &str,
        database_kind: DatabaseKind,
        sql: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CorrectionSummary>> {
        if !self.enable_learning || limit == 0 {
            return Ok(Vec::new());
        }

        let (table_pattern, column_pattern) = patterns_for(error_kind, error_message);
        let query = ApplicableQuery {
            error_kind,
            database_kind,
            min_confidence: MIN_APPLICABLE_CONFIDENCE,
            table_pattern,
            column_pattern,
            limit,
        };

        let found: Vec<CorrectionSummary> = self
            .store
            .query_applicable(&query)?
            .into_iter()
            .map(CorrectionSummary::from)
            .collect();

        debug!(
            "Found {} applicable corrections for {} (sql: {:?})",
            found.len(),
            error_kind,
            sql.map(|s| s.chars().take(80).collect::<String>())
        );
        Ok(found)
    }

    /// Feed back the outcome of reusing a learned correction
    pub fn record_application(
        &self,
        correction_id: i64,
        applied_sql: &str,
        was_successful: bool,
    ) -> Result<Option<LearnedCorrection>> {
        let updated = self.store.update(correction_id, &mut |c| {
            c.last_applied_at = Utc::now();
            if was_successful {
                c.times_applied += 1;
                c.confidence_score = (c.confidence_score + SUCCESS_BOOST).min(1.0);
            } else {
                c.confidence_score = (c.confidence_score - FAILURE_PENALTY).max(0.0);
            }

            let n = f64::from(c.times_applied);
            if n > 0.0 {
                let outcome = if was_successful { 1.0 } else { 0.0 };
                c.success_rate = (c.success_rate * (n - 1.0) + outcome) / n;
            }
        })?;

        match &updated {
            Some(c) => debug!(
                "Correction {} applied to {:?}: success={}, confidence now {:.2}",
                correction_id,
                applied_sql.chars().take(80).collect::<String>(),
                was_successful,
                c.confidence_score
            ),
            None => debug!("Correction {} no longer exists", correction_id),
        }
        Ok(updated)
    }

    pub fn stats(&self) -> Result<LearningStats> {
        let stats = self.store.stats()?;
        Ok(LearningStats {
            total_corrections: stats.total_corrections,
            by_error_kind: stats.by_error_kind,
            top_corrections: stats.top_corrections.into_iter().map(CorrectionSummary::from).collect(),
            learning_enabled: self.enable_learning,
        })
    }

    pub fn list(&self, limit: usize) -> Result<Vec<LearnedCorrection>> {
        self.store.list(limit)
    }

    pub fn delete(&self, correction_id: i64) -> Result<bool> {
        self.store.delete(correction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning_store::SqliteCorrectionStore;

    fn learner() -> CorrectionLearner {
        CorrectionLearner::new(Arc::new(SqliteCorrectionStore::in_memory().unwrap()), true)
    }

    #[test]
    fn test_normalize_error_replaces_literals() {
        assert_eq!(
            normalize_error("Column \"Pric\" does not exist at position 42"),
            "column \"<name>\" does not exist at position <num>"
        );
        assert_eq!(normalize_error("Unknown column 'x' in 'field list'"), "unknown column '<name>' in '<name>'");
    }

    #[test]
    fn test_describe_diff() {
        assert_eq!(describe_diff("SELECT pric FROM t", "SELECT price FROM t"), "Changed pric to price");
        assert_eq!(describe_diff("SELECT a FROM t", "SELECT a FROM t LIMIT"), "Added limit");
        assert_eq!(describe_diff("SELECT a FROM t", "select a from t"), "Minor correction");
    }

    #[test]
    fn test_learn_is_noop_when_disabled_or_unsuccessful() {
        let disabled = CorrectionLearner::new(Arc::new(SqliteCorrectionStore::in_memory().unwrap()), false);
        let id = disabled
            .learn(ErrorKind::TableNotFound, "a", "no such table: x", "b", DatabaseKind::Sqlite, true)
            .unwrap();
        assert!(id.is_none());

        let learner = learner();
        let id = learner
            .learn(ErrorKind::TableNotFound, "a", "no such table: x", "b", DatabaseKind::Sqlite, false)
            .unwrap();
        assert!(id.is_none());
        assert_eq!(learner.stats().unwrap().total_corrections, 0);
    }

    #[test]
    fn test_learn_records_table_pattern_and_description() {
        let learner = learner();
        let id = learner
            .learn(
                ErrorKind::TableNotFound,
                "SELECT * FROM Prodcuts",
                "no such table: Prodcuts",
                "SELECT * FROM products",
                DatabaseKind::Sqlite,
                true,
            )
            .unwrap()
            .unwrap();
        let stored = learner.list(10).unwrap().into_iter().find(|c| c.id == id).unwrap();
        assert_eq!(stored.table_pattern.as_deref(), Some("prodcuts"));
        assert_eq!(stored.description.as_deref(), Some("Fix for missing table: prodcuts"));
        assert_eq!(stored.confidence_score, 0.7);
    }

    #[test]
    fn test_find_applicable_respects_kind_and_limit() {
        let learner = learner();
        for column in ["pric", "nam", "emial"] {
            learner
                .learn(
                    ErrorKind::ColumnNotFound,
                    &format!("SELECT {} FROM t", column),
                    &format!("no such column: {}", column),
                    "SELECT price FROM t",
                    DatabaseKind::Sqlite,
                    true,
                )
                .unwrap();
        }

        let hits = learner
            .find_applicable(ErrorKind::ColumnNotFound, "no such column: pric", DatabaseKind::Sqlite, None, 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].description, "Fix for missing column: pric");

        let none = learner
            .find_applicable(ErrorKind::TableNotFound, "no such table: pric", DatabaseKind::Sqlite, None, 5)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_record_application_updates_running_average() {
        let learner = learner();
        let id = learner
            .learn(ErrorKind::SyntaxError, "SELEC 1", "near \"SELEC\": syntax error", "SELECT 1", DatabaseKind::Sqlite, true)
            .unwrap()
            .unwrap();

        let after_success = learner.record_application(id, "SELECT 1", true).unwrap().unwrap();
        assert_eq!(after_success.times_applied, 2);
        assert!((after_success.confidence_score - 0.75).abs() < 1e-9);
        assert!((after_success.success_rate - 1.0).abs() < 1e-9);

        let after_failure = learner.record_application(id, "SELECT 1", false).unwrap().unwrap();
        assert_eq!(after_failure.times_applied, 2);
        assert!((after_failure.confidence_score - 0.65).abs() < 1e-9);
        assert!((after_failure.success_rate - 0.5).abs() < 1e-9);

        assert!(learner.record_application(424242, "SELECT 1", true).unwrap().is_none());
    }
}
