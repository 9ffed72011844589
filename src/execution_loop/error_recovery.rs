//! Error Recovery
//!
//! Builds the enriched error text handed to the LLM fix call from an error
//! classification, its extracted context and any learned corrections.

use crate::execution_loop::error_classifier::{ErrorContext, ErrorKind};
use crate::learning::correction_learner::CorrectionSummary;

/// Short remediation hints for an error kind, one per line
pub fn generate_hints(kind: ErrorKind, context: &ErrorContext) -> String {
    let mut hints = Vec::new();

    match kind {
        ErrorKind::TableNotFound => {
            hints.push("Check the schema for the correct table name.".to_string());
            hints.push("Table names may be case-sensitive.".to_string());
            if let Some(table) = &context.missing_table {
                hints.push(format!("Could not find table: {}", table));
            }
        }
        ErrorKind::ColumnNotFound => {
            hints.push("Check the schema for the correct column name.".to_string());
            hints.push("Make sure you're referencing the right table.".to_string());
            if let Some(column) = &context.missing_column {
                hints.push(format!("Could not find column: {}", column));
            }
        }
        ErrorKind::SyntaxError => {
            hints.push("Check for missing commas, parentheses, or keywords.".to_string());
            hints.push("Verify SQL syntax is correct for the database type.".to_string());
        }
        ErrorKind::TypeMismatch => {
            hints.push("Check data types in comparisons and operations.".to_string());
            hints.push("You may need to cast values to the correct type.".to_string());
        }
        ErrorKind::PermissionDenied | ErrorKind::Timeout | ErrorKind::Unknown => {}
    }

    hints.join("\n")
}

/// Fix-prompt builder
pub struct ErrorRecovery;

impl ErrorRecovery {
    /// Error text plus hints, in the layout the fix call expects
    pub fn enhanced_error(error_text: &str, context: &ErrorContext) -> String {
        format!(
            "{}\n\nHints:\n{}",
            error_text,
            generate_hints(context.kind, context)
        )
    }

    /// Learned corrections rendered as extra hint lines. They inform the fix
    /// call only; none of their SQL is applied directly.
    pub fn learned_hints(corrections: &[CorrectionSummary]) -> Option<String> {
        if corrections.is_empty() {
            return None;
        }
        let mut lines = vec!["Previously successful fixes for similar errors:".to_string()];
        for correction in corrections {
            lines.push(format!(
                "- {} (confidence {:.2}, used {} times): {}",
                correction.description,
                correction.confidence_score,
                correction.times_applied,
                correction.corrected_sql
            ));
        }
        Some(lines.join("\n"))
    }

    /// Full text for the fix call
    pub fn build_fix_prompt(
        error_text: &str,
        context: &ErrorContext,
        learned: &[CorrectionSummary],
    ) -> String {
        let mut prompt = Self::enhanced_error(error_text, context);
        if let Some(extra) = Self::learned_hints(learned) {
            prompt.push_str("\n\n");
            prompt.push_str(&extra);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_loop::error_classifier::extract_context;

    #[test]
    fn test_table_hints_name_the_missing_table() {
        let ctx = extract_context("no such table: prodcuts", ErrorKind::TableNotFound);
        let hints = generate_hints(ErrorKind::TableNotFound, &ctx);
        assert!(hints.starts_with("Check the schema for the correct table name."));
        assert!(hints.ends_with("Could not find table: prodcuts"));
    }

    #[test]
    fn test_timeout_has_no_hints() {
        let ctx = extract_context("Query timeout after 30 seconds", ErrorKind::Timeout);
        assert!(generate_hints(ErrorKind::Timeout, &ctx).is_empty());
    }

    #[test]
    fn test_fix_prompt_layout() {
        let ctx = extract_context("column \"pric\" does not exist", ErrorKind::ColumnNotFound);
        let learned = vec![CorrectionSummary {
            id: 4,
            description: "Fix for missing column: pric".to_string(),
            original_sql: "SELECT pric FROM products".to_string(),
            corrected_sql: "SELECT price FROM products".to_string(),
            confidence_score: 0.8,
            times_applied: 2,
            success_rate: 1.0,
        }];
        let prompt = ErrorRecovery::build_fix_prompt("column \"pric\" does not exist", &ctx, &learned);
        assert!(prompt.starts_with("column \"pric\" does not exist\n\nHints:\n"));
        assert!(prompt.contains("Could not find column: pric"));
        assert!(prompt.contains("- Fix for missing column: pric (confidence 0.80, used 2 times): SELECT price FROM products"));

        let plain = ErrorRecovery::build_fix_prompt("column \"pric\" does not exist", &ctx, &[]);
        assert!(!plain.contains("Previously successful"));
    }
}
