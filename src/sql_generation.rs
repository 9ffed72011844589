//! SQL Generation
//!
//! Contract for the text-to-SQL service the retry loop drives, and the
//! validator used to clean and vet whatever that service returns.

use crate::error::{GuruError, Result};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Database dialect the SQL targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgresql,
    Mysql,
    Sqlite,
    Duckdb,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgresql => "postgresql",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::Duckdb => "duckdb",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = GuruError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseKind::Postgresql),
            "mysql" => Ok(DatabaseKind::Mysql),
            "sqlite" => Ok(DatabaseKind::Sqlite),
            "duckdb" => Ok(DatabaseKind::Duckdb),
            other => Err(GuruError::Config(format!("Unknown database kind: {}", other))),
        }
    }
}

/// Output of a generation or repair call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub is_valid: bool,
    pub is_read_only: bool,
    pub warnings: Vec<String>,
}

impl GeneratedSql {
    /// Vet raw SQL with the validator and wrap it.
    pub fn checked(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let (is_valid, problem) = match SqlValidator::validate_syntax(&sql) {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        };
        Self {
            is_read_only: SqlValidator::is_read_only(&sql),
            sql,
            is_valid,
            warnings: problem.into_iter().collect(),
        }
    }
}

/// Text-to-SQL service.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Generate SQL answering `question` against `schema`.
    async fn generate(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        database_kind: DatabaseKind,
        allow_write: bool,
        model_hint: Option<&str>,
    ) -> Result<GeneratedSql>;

    /// Repair `sql` given the error text (already enriched with hints).
    async fn fix_error(
        &self,
        sql: &str,
        error_with_hints: &str,
        schema: &SchemaSnapshot,
        database_kind: DatabaseKind,
    ) -> Result<GeneratedSql>;

    /// Model used when no hint is supplied
    fn default_model(&self) -> &str;
}

const DANGEROUS_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE", "EXEC", "EXECUTE",
    "GRANT", "REVOKE",
];

const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE"];

lazy_static! {
    static ref READ_ONLY: Regex = Regex::new(r"(?i)^\s*(SELECT|WITH)\s").unwrap();
    static ref DML_VERB: Regex = Regex::new(r"(?i)\b(SELECT|INSERT|UPDATE|DELETE)\b").unwrap();
    static ref SUSPICIOUS: Vec<Regex> = [
        r"(?i);\s*DROP",
        r"--",
        r"(?s)/\*.*\*/",
        r"(?i)UNION\s+SELECT",
        r"(?i)OR\s+1\s*=\s*1",
        r"(?i)OR\s+'1'\s*=\s*'1'",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();
    static ref CODE_FENCE: Regex = Regex::new(r"```(?:sql)?\s*").unwrap();
    static ref ANSWER_PREFIX: Regex =
        Regex::new(r"(?i)^\s*(SQL Query:|Query:|Answer:|SQLite|PostgreSQL|MySQL|SQL:)\s*").unwrap();
    static ref DIALECT_BEFORE_VERB: Regex = Regex::new(
        r"(?i)\b(sqlite|postgresql|mysql|duckdb)\s+(SELECT|INSERT|UPDATE|DELETE|CREATE|DROP|ALTER|WITH)\b"
    )
    .unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref ALWAYS_BLOCKED: Regex =
        Regex::new(r"(?i)\b(DROP|TRUNCATE|ALTER\s+TABLE|CREATE\s+TABLE)\b").unwrap();
    // String literals, quoted identifiers and comments
    static ref QUOTED_OR_COMMENT: Regex = Regex::new(
        r#"(?s)'(?:[^']|'')*'|"(?:[^"]|"")*"|`[^`]*`|\[[^\]]*\]|--[^\n]*|/\*.*?\*/"#
    )
    .unwrap();
}

/// Validates and sanitizes SQL text
pub struct SqlValidator;

impl SqlValidator {
    /// Read-only means the statement starts with SELECT or WITH
    pub fn is_read_only(sql: &str) -> bool {
        READ_ONLY.is_match(&format!("{} ", sql.trim()))
    }

    /// Dangerous keywords present as whole words
    pub fn dangerous_keywords(sql: &str) -> Vec<&'static str> {
        let upper = keyword_text(sql);
        DANGEROUS_KEYWORDS
            .iter()
            .filter(|kw| contains_word(&upper, kw))
            .copied()
            .collect()
    }

    /// Basic structural checks; `Err` carries the reason
    pub fn validate_syntax(sql: &str) -> std::result::Result<(), String> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err("Empty SQL query".to_string());
        }
        if !DML_VERB.is_match(sql) {
            return Err("No valid SQL command found".to_string());
        }
        if sql.matches('(').count() != sql.matches(')').count() {
            return Err("Unbalanced parentheses".to_string());
        }
        if let Some(pattern) = SUSPICIOUS.iter().find(|re| re.is_match(sql)) {
            return Err(format!("Suspicious pattern detected: {}", pattern.as_str()));
        }
        Ok(())
    }

    /// Reason a statement must not run, if any. DROP/TRUNCATE and table DDL
    /// are always refused; other writes only when `allow_write` is false.
    pub fn check_statement_safety(sql: &str, allow_write: bool) -> Option<String> {
        let upper = keyword_text(sql);

        if !allow_write {
            if let Some(kw) = WRITE_KEYWORDS.iter().find(|kw| contains_word(&upper, kw)) {
                return Some(format!(
                    "Permission denied: write operation not allowed in read-only mode ({})",
                    kw
                ));
            }
        }

        ALWAYS_BLOCKED.find(&upper).map(|m| {
            format!(
                "Permission denied: dangerous operation not allowed ({})",
                WHITESPACE.replace_all(m.as_str(), " ")
            )
        })
    }

    /// Extract the first SQL statement from free-form LLM output
    pub fn clean_llm_output(text: &str) -> String {
        let text = CODE_FENCE.replace_all(text, "");
        let text = ANSWER_PREFIX.replace(&text, "");
        let text = DIALECT_BEFORE_VERB.replace_all(&text, "$2");

        let mut lines = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("--") || line.starts_with("/*") {
                continue;
            }
            lines.push(line);
            if line.ends_with(';') {
                break;
            }
        }

        WHITESPACE.replace_all(&lines.join(" "), " ").trim().to_string()
    }
}

/// Uppercased SQL with literals, quoted identifiers and comments blanked,
/// so only real keywords are left to scan.
fn keyword_text(sql: &str) -> String {
    QUOTED_OR_COMMENT.replace_all(sql.trim(), " ").to_uppercase()
}

fn contains_word(haystack_upper: &str, word: &str) -> bool {
    haystack_upper
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|token| token == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_kind_round_trips_through_str() {
        assert_eq!("postgres".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgresql);
        assert_eq!(DatabaseKind::Duckdb.to_string(), "duckdb");
        assert!("oracle".parse::<DatabaseKind>().is_err());
    }

    #[test]
    fn test_read_only_detection() {
        assert!(SqlValidator::is_read_only("  select * from t"));
        assert!(SqlValidator::is_read_only("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!SqlValidator::is_read_only("DELETE FROM t"));
    }

    #[test]
    fn test_dangerous_keywords_need_word_boundaries() {
        assert_eq!(SqlValidator::dangerous_keywords("DROP TABLE users"), vec!["DROP"]);
        assert!(SqlValidator::dangerous_keywords("SELECT created_at, updated FROM t").is_empty());
    }

    #[test]
    fn test_validate_syntax() {
        assert!(SqlValidator::validate_syntax("SELECT COUNT(*) FROM t").is_ok());
        assert_eq!(SqlValidator::validate_syntax("   ").unwrap_err(), "Empty SQL query");
        assert!(SqlValidator::validate_syntax("SELECT (1").unwrap_err().contains("parentheses"));
        assert!(SqlValidator::validate_syntax("SELECT * FROM t WHERE a = 1 OR 1=1").is_err());
        assert!(SqlValidator::validate_syntax("hello there").is_err());
    }

    #[test]
    fn test_statement_safety() {
        assert!(SqlValidator::check_statement_safety("SELECT * FROM t", false).is_none());
        let blocked = SqlValidator::check_statement_safety("UPDATE t SET a = 1", false).unwrap();
        assert!(blocked.contains("Permission denied"));
        assert!(SqlValidator::check_statement_safety("UPDATE t SET a = 1", true).is_none());
        assert!(SqlValidator::check_statement_safety("DROP TABLE t", true).is_some());
        assert!(SqlValidator::check_statement_safety("SELECT dropped_at FROM t", true).is_none());
    }

    #[test]
    fn test_keywords_inside_literals_are_ignored() {
        let read_only = [
            "SELECT COUNT(*) FROM events WHERE kind = 'update'",
            "SELECT * FROM audit WHERE action IN ('delete', 'create')",
            "SELECT \"update\" FROM t",
            "SELECT [drop] FROM t",
            "SELECT `insert` FROM t",
            "SELECT * FROM t WHERE note = 'it''s an update'",
            "SELECT 1 /* drop later */",
        ];
        for sql in read_only {
            assert_eq!(SqlValidator::check_statement_safety(sql, false), None, "{}", sql);
        }

        let with_drop_literal = "SELECT * FROM events WHERE kind = 'drop'";
        assert_eq!(SqlValidator::check_statement_safety(with_drop_literal, true), None);
        assert_eq!(SqlValidator::check_statement_safety(with_drop_literal, false), None);
        assert!(SqlValidator::dangerous_keywords(with_drop_literal).is_empty());
    }

    #[test]
    fn test_real_keywords_next_to_literals_still_blocked() {
        let blocked = SqlValidator::check_statement_safety("UPDATE t SET kind = 'select'", false).unwrap();
        assert!(blocked.ends_with("(UPDATE)"));
        assert!(SqlValidator::check_statement_safety("DROP TABLE 'events'", true).is_some());
    }

    #[test]
    fn test_clean_llm_output() {
        let fenced = "```sql\nSELECT name\nFROM products;\n```";
        assert_eq!(SqlValidator::clean_llm_output(fenced), "SELECT name FROM products;");
        assert_eq!(
            SqlValidator::clean_llm_output("SQL: sqlite SELECT 1;"),
            "SELECT 1;"
        );
        assert_eq!(
            SqlValidator::clean_llm_output("-- comment\nSELECT *   FROM t"),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn test_checked_marks_invalid_sql() {
        let generated = GeneratedSql::checked("");
        assert!(!generated.is_valid);
        assert_eq!(generated.warnings.len(), 1);
        assert!(GeneratedSql::checked("SELECT 1").is_read_only);
    }
}
