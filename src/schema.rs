//! Schema Snapshot
//!
//! Table and column metadata consumed by the schema-aware fixer and rendered
//! into prompts for the SQL generator.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Column names in declaration order
    pub columns: Vec<String>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }
}

/// Point-in-time view of a database's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: TableSchema) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Compact text form used in generation and repair prompts.
    pub fn to_prompt_text(&self) -> String {
        let mut lines = Vec::with_capacity(self.tables.len());
        for (name, table) in &self.tables {
            let mut line = format!("Table {} ({})", name, table.columns.join(", "));
            if let Some(pk) = &table.primary_key {
                line.push_str(&format!(" PRIMARY KEY {}", pk));
            }
            for fk in &table.foreign_keys {
                line.push_str(&format!(
                    "; {} REFERENCES {}({})",
                    fk.column, fk.references_table, fk.references_column
                ));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Supplies the schema snapshot for a connected database.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn snapshot(&self) -> Result<SchemaSnapshot>;
}
