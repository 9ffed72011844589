//! Error Classifier
//!
//! Classifies raw database error text into a coarse taxonomy that selects
//! the repair strategy, and pulls the offending identifier out of it.

use crate::error::{GuruError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SQL error classification taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyntaxError,
    TableNotFound,
    ColumnNotFound,
    TypeMismatch,
    PermissionDenied,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::TableNotFound => "table_not_found",
            ErrorKind::ColumnNotFound => "column_not_found",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = GuruError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "syntax_error" => ErrorKind::SyntaxError,
            "table_not_found" => ErrorKind::TableNotFound,
            "column_not_found" => ErrorKind::ColumnNotFound,
            "type_mismatch" => ErrorKind::TypeMismatch,
            "permission_denied" => ErrorKind::PermissionDenied,
            "timeout" => ErrorKind::Timeout,
            "unknown" => ErrorKind::Unknown,
            other => return Err(GuruError::Storage(format!("Unknown error kind: {}", other))),
        })
    }
}

/// Predicate over lower-cased error text
pub type Predicate = fn(&str) -> bool;

lazy_static! {
    static ref QUOTED_BEFORE_MISSING: Regex =
        Regex::new(r#"["'`][A-Za-z_][\w.]*["'`][^"'`]*does not exist"#).unwrap();

    static ref TABLE_PATTERNS: Vec<Regex> = [
        r"(?i)no such table:\s*([A-Za-z_][\w.]*)",
        r#"(?i)table with name\s+["'`]?([A-Za-z_][\w.]*)"#,
        r#"(?i)relation["'`\s]+([A-Za-z_][\w.]*)"#,
        r#"(?i)table["'`\s]+([A-Za-z_][\w.]*)"#,
        r#"["'`]([A-Za-z_][\w.]*)["'`][^"'`]*does not exist"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();

    static ref COLUMN_PATTERNS: Vec<Regex> = [
        r"(?i)no such column:\s*([A-Za-z_][\w.]*)",
        r#"(?i)unknown column\s+["'`]?([A-Za-z_][\w.]*)"#,
        r#"(?i)column["'`\s]+([A-Za-z_][\w.]*)"#,
        r#"(?i)field["'`\s]+([A-Za-z_][\w.]*)"#,
        r#"["'`]([A-Za-z_][\w.]*)["'`][^"'`]*does not exist"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();

    static ref DEFAULT_CLASSIFIER: ErrorClassifier = ErrorClassifier::new();
}

/// Words the loose patterns can pick up that are never identifiers
const NOT_IDENTIFIERS: &[&str] = &["does", "not", "with", "name", "is", "or", "exists", "in", "of"];

fn any_of(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

fn is_syntax(text: &str) -> bool {
    any_of(text, &["syntax error", "syntax", "parse error", "unexpected"])
}

fn is_missing_table(text: &str) -> bool {
    if text.contains("no such table") {
        return true;
    }
    if any_of(text, &["column", "field", "permission denied"]) {
        return false;
    }
    text.contains("relation")
        || (text.contains("table")
            && any_of(text, &["not found", "does not exist", "doesn't exist", "unknown"]))
        || QUOTED_BEFORE_MISSING.is_match(text)
}

fn is_missing_column(text: &str) -> bool {
    any_of(text, &["no such column", "unknown column", "column", "field"])
}

fn is_type_mismatch(text: &str) -> bool {
    any_of(
        text,
        &["operator does not exist", "type", "cast", "conversion", "incompatible", "mismatch"],
    )
}

fn is_permission(text: &str) -> bool {
    any_of(text, &["permission", "denied", "access", "unauthorized"])
}

fn is_timeout(text: &str) -> bool {
    any_of(text, &["timeout", "timed out", "exceeded"])
}

/// Priority-ordered rule list; the first matching predicate wins.
pub struct ErrorClassifier {
    rules: Vec<(Predicate, ErrorKind)>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            rules: vec![
                (is_syntax as Predicate, ErrorKind::SyntaxError),
                (is_missing_table, ErrorKind::TableNotFound),
                (is_missing_column, ErrorKind::ColumnNotFound),
                (is_type_mismatch, ErrorKind::TypeMismatch),
                (is_permission, ErrorKind::PermissionDenied),
                (is_timeout, ErrorKind::Timeout),
            ],
        }
    }

    /// Build from an explicit rule list
    pub fn with_rules(rules: Vec<(Predicate, ErrorKind)>) -> Self {
        Self { rules }
    }

    /// Insert a rule ahead of the built-in ones
    pub fn prepend_rule(mut self, predicate: Predicate, kind: ErrorKind) -> Self {
        self.rules.insert(0, (predicate, kind));
        self
    }

    pub fn rules(&self) -> &[(Predicate, ErrorKind)] {
        &self.rules
    }

    /// Classify an error message into the taxonomy
    pub fn classify(&self, error_text: &str) -> ErrorKind {
        let lower = error_text.to_lowercase();
        self.rules
            .iter()
            .find(|(predicate, _)| predicate(&lower))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify with the built-in rule list
pub fn classify(error_text: &str) -> ErrorKind {
    DEFAULT_CLASSIFIER.classify(error_text)
}

/// Structured details pulled out of an error message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub raw_error: String,
    pub missing_table: Option<String>,
    pub missing_column: Option<String>,
}

impl ErrorContext {
    pub fn is_empty(&self) -> bool {
        self.missing_table.is_none() && self.missing_column.is_none()
    }
}

fn first_identifier(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let raw = caps.get(1)?.as_str();
            // schema-qualified names resolve to their last segment
            let ident = raw.rsplit('.').next().unwrap_or(raw);
            if ident.is_empty() || NOT_IDENTIFIERS.contains(&ident.to_lowercase().as_str()) {
                None
            } else {
                Some(ident.to_string())
            }
        })
    })
}

/// Table name mentioned by the error, as written
pub fn extract_table(error_text: &str) -> Option<String> {
    first_identifier(&TABLE_PATTERNS, error_text)
}

/// Column name mentioned by the error, as written
pub fn extract_column(error_text: &str) -> Option<String> {
    first_identifier(&COLUMN_PATTERNS, error_text)
}

/// Pull the identifier relevant to `kind` out of the error text.
pub fn extract_context(error_text: &str, kind: ErrorKind) -> ErrorContext {
    let (missing_table, missing_column) = match kind {
        ErrorKind::TableNotFound => (extract_table(error_text), None),
        ErrorKind::ColumnNotFound => (None, extract_column(error_text)),
        _ => (None, None),
    };
    ErrorContext {
        kind,
        raw_error: error_text.to_string(),
        missing_table,
        missing_column,
    }
}
