//! Query Result - Standardized result format from execution engines

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// Standardized query result from any execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Success status
    pub success: bool,

    /// Result rows, capped at the requested maximum
    pub data: Vec<Row>,

    /// Column names in select-list order
    pub columns: Vec<String>,

    /// Number of rows returned
    pub row_count: usize,

    /// Execution time in milliseconds
    pub execution_time_ms: f64,

    /// Whether rows were dropped to honour the row cap
    pub truncated: bool,

    /// Error text reported by the engine (if any)
    pub error: Option<String>,
}

impl QueryResult {
    /// Create a successful result
    pub fn success(columns: Vec<String>, data: Vec<Row>, execution_time_ms: f64) -> Self {
        Self {
            success: true,
            row_count: data.len(),
            data,
            columns,
            execution_time_ms,
            truncated: false,
            error: None,
        }
    }

    /// Create an error result
    pub fn failure(error: impl Into<String>, execution_time_ms: f64) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
            execution_time_ms,
            truncated: false,
            error: Some(error.into()),
        }
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// Build a successful result from column names and positional values.
    pub fn from_values(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let data = rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .map(|c| c.to_string())
                    .zip(values)
                    .collect::<Row>()
            })
            .collect();
        Self::success(columns.iter().map(|c| c.to_string()).collect(), data, 0.0)
    }

    /// Iterate `(column, value)` pairs of a row in select-list order.
    /// Falls back to the row's own key order when no column list is known.
    pub fn cells<'a>(&'a self, row: &'a Row) -> Vec<(&'a str, &'a Value)> {
        if self.columns.is_empty() {
            return row.iter().map(|(k, v)| (k.as_str(), v)).collect();
        }
        self.columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.as_str(), v)))
            .collect()
    }

    /// First value of the first row, if any
    pub fn first_value(&self) -> Option<&Value> {
        let row = self.data.first()?;
        match self.columns.first() {
            Some(col) => row.get(col),
            None => row.values().next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_values_keeps_column_order() {
        let result = QueryResult::from_values(&["zeta", "alpha"], vec![vec![json!(1), json!(2)]]);
        assert_eq!(result.row_count, 1);
        let cells = result.cells(&result.data[0]);
        assert_eq!(cells[0].0, "zeta");
        assert_eq!(cells[1].0, "alpha");
        assert_eq!(result.first_value(), Some(&json!(1)));
    }

    #[test]
    fn test_failure_has_no_rows() {
        let result = QueryResult::failure("no such table: x", 1.5);
        assert!(!result.success);
        assert_eq!(result.row_count, 0);
        assert_eq!(result.error.as_deref(), Some("no such table: x"));
    }
}
