//! Schema-Aware Fixer
//!
//! Zero-cost corrections for identifier typos using only schema metadata.
//! No LLM call is made here; anything it cannot handle is escalated by the
//! retry loop.

use crate::execution_loop::error_classifier::{extract_column, extract_table, ErrorContext, ErrorKind};
use crate::fuzzy_matcher::FuzzyMatcher;
use crate::schema::SchemaSnapshot;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

lazy_static! {
    static ref TABLE_REFERENCE: Regex =
        Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+["'`]?([A-Za-z_][\w.]*)"#).unwrap();
    static ref REPEATED_WHITESPACE: Regex = Regex::new(r"\s{2,}").unwrap();
    static ref COMMA_WITHOUT_SPACE: Regex = Regex::new(r",(\S)").unwrap();
}

/// Confidence reported for mechanical syntax fixes
const SYNTAX_FIX_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    TableName,
    ColumnName,
    Syntax,
}

/// Result of a quick fix attempt
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuickFix {
    pub succeeded: bool,
    pub fixed_sql: Option<String>,
    pub correction_kind: Option<CorrectionKind>,
    pub original_value: Option<String>,
    pub corrected_value: Option<String>,
    pub confidence: f64,
    pub explanation: Option<String>,
}

impl QuickFix {
    fn failed() -> Self {
        Self::default()
    }

    /// Failure that still reports the best candidate seen
    fn below_threshold(original: &str, candidate: &str, confidence: f64) -> Self {
        Self {
            original_value: Some(original.to_string()),
            corrected_value: Some(candidate.to_string()),
            confidence,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixerStats {
    pub total_tables: usize,
    pub total_columns: usize,
    pub tables_with_columns: usize,
    pub average_columns_per_table: f64,
}

/// Schema-backed fixer built once per snapshot
pub struct SchemaAwareFixer {
    table_names: Vec<String>,
    columns_by_table: BTreeMap<String, Vec<String>>,
    all_columns: Vec<String>,
    match_threshold: f64,
    apply_threshold: f64,
}

impl SchemaAwareFixer {
    pub fn new(schema: &SchemaSnapshot) -> Self {
        let table_names: Vec<String> = schema.table_names().map(String::from).collect();
        let columns_by_table: BTreeMap<String, Vec<String>> = schema
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.columns.clone()))
            .collect();
        let all_columns: Vec<String> = columns_by_table.values().flatten().unique().cloned().collect();

        debug!(
            "Schema cache built: {} tables, {} unique columns",
            table_names.len(),
            all_columns.len()
        );

        Self {
            table_names,
            columns_by_table,
            all_columns,
            match_threshold: 0.6,
            apply_threshold: 0.7,
        }
    }

    pub fn with_thresholds(mut self, match_threshold: f64, apply_threshold: f64) -> Self {
        self.match_threshold = match_threshold;
        self.apply_threshold = apply_threshold;
        self
    }

    /// Attempt to fix `sql` without calling the LLM
    pub fn quick_fix(
        &self,
        sql: &str,
        kind: ErrorKind,
        error_message: &str,
        context: Option<&ErrorContext>,
    ) -> QuickFix {
        match kind {
            ErrorKind::TableNotFound => {
                let missing = context
                    .and_then(|c| c.missing_table.clone())
                    .or_else(|| extract_table(error_message));
                match missing {
                    Some(missing) => self.fix_identifier(sql, &missing, &self.table_names, CorrectionKind::TableName),
                    None => QuickFix::failed(),
                }
            }
            ErrorKind::ColumnNotFound => {
                let missing = context
                    .and_then(|c| c.missing_column.clone())
                    .or_else(|| extract_column(error_message));
                match missing {
                    Some(missing) => {
                        let candidates = self.column_candidates(sql);
                        self.fix_identifier(sql, &missing, &candidates, CorrectionKind::ColumnName)
                    }
                    None => QuickFix::failed(),
                }
            }
            ErrorKind::SyntaxError => Self::fix_syntax(sql),
            _ => QuickFix::failed(),
        }
    }

    /// Known tables referenced through FROM/JOIN, in canonical casing
    pub fn referenced_tables(&self, sql: &str) -> Vec<String> {
        TABLE_REFERENCE
            .captures_iter(sql)
            .filter_map(|caps| {
                let raw = caps.get(1)?.as_str();
                let name = raw.rsplit('.').next().unwrap_or(raw);
                self.table_names.iter().find(|t| t.eq_ignore_ascii_case(name)).cloned()
            })
            .unique()
            .collect()
    }

    /// Columns of the referenced tables, or every known column when none resolve
    fn column_candidates(&self, sql: &str) -> Vec<String> {
        let tables = self.referenced_tables(sql);
        if tables.is_empty() {
            debug!("Searching in all columns (table unknown)");
            return self.all_columns.clone();
        }
        debug!("Searching columns of {:?}", tables);
        tables
            .iter()
            .filter_map(|t| self.columns_by_table.get(t))
            .flatten()
            .unique()
            .cloned()
            .collect()
    }

    fn fix_identifier(&self, sql: &str, missing: &str, candidates: &[String], kind: CorrectionKind) -> QuickFix {
        let best = match FuzzyMatcher::find_best_match(missing, candidates, self.match_threshold) {
            Some(best) => best,
            None => {
                info!("No schema match for {}", missing);
                return QuickFix::failed();
            }
        };

        info!(
            "Found match: {} -> {} (confidence: {:.2})",
            missing, best.candidate, best.score
        );

        if best.score < self.apply_threshold {
            return QuickFix::below_threshold(missing, &best.candidate, best.score);
        }

        let fixed_sql = replace_identifier(sql, missing, &best.candidate);
        let label = match kind {
            CorrectionKind::TableName => "table",
            _ => "column",
        };
        QuickFix {
            succeeded: true,
            explanation: Some(format!("Corrected {} name: {} -> {}", label, missing, best.candidate)),
            fixed_sql: Some(fixed_sql),
            correction_kind: Some(kind),
            original_value: Some(missing.to_string()),
            corrected_value: Some(best.candidate),
            confidence: best.score,
        }
    }

    /// Whitespace collapse, space after comma, trailing terminator
    fn fix_syntax(sql: &str) -> QuickFix {
        let mut fixed = REPEATED_WHITESPACE.replace_all(sql.trim(), " ").into_owned();
        fixed = COMMA_WITHOUT_SPACE.replace_all(&fixed, ", $1").into_owned();
        if !fixed.is_empty() && !fixed.ends_with(';') {
            fixed.push(';');
        }

        if fixed.is_empty() || fixed == sql {
            return QuickFix::failed();
        }

        QuickFix {
            succeeded: true,
            fixed_sql: Some(fixed),
            correction_kind: Some(CorrectionKind::Syntax),
            confidence: SYNTAX_FIX_CONFIDENCE,
            explanation: Some("Normalized spacing and statement terminator".to_string()),
            ..QuickFix::default()
        }
    }

    pub fn stats(&self) -> FixerStats {
        FixerStats {
            total_tables: self.table_names.len(),
            total_columns: self.all_columns.len(),
            tables_with_columns: self.columns_by_table.values().filter(|c| !c.is_empty()).count(),
            average_columns_per_table: if self.table_names.is_empty() {
                0.0
            } else {
                self.all_columns.len() as f64 / self.table_names.len() as f64
            },
        }
    }
}

/// Case-insensitive whole-word replacement
fn replace_identifier(sql: &str, old: &str, new: &str) -> String {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(old))) {
        Ok(re) => re.replace_all(sql, NoExpand(new)).into_owned(),
        Err(_) => sql.to_string(),
    }
}
