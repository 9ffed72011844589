//! Learning Store - Persists corrections that fixed a failing query
//!
//! Each record maps an error fingerprint (kind, normalized message, database
//! kind, optional table/column pattern) to the SQL that made the error go
//! away. Records are shared by every concurrent run, so all mutation goes
//! through single-record read-modify-write transactions.
//!
//! Architecture: SQLite behind a `Mutex<Connection>`

use crate::error::{GuruError, Result};
use crate::execution_loop::error_classifier::ErrorKind;
use crate::sql_generation::DatabaseKind;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Correction learned from a successful self-correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedCorrection {
    pub id: i64,
    pub error_kind: ErrorKind,

    /// Error text with literals and numbers replaced by placeholders
    pub error_pattern: String,

    pub database_kind: DatabaseKind,
    pub original_sql: String,
    pub original_error: String,
    pub corrected_sql: String,
    pub description: Option<String>,
    pub table_pattern: Option<String>,
    pub column_pattern: Option<String>,

    /// Never decreases
    pub times_applied: u32,

    /// Running average over `times_applied` trials, in [0, 1]
    pub success_rate: f64,

    /// In [0, 1]
    pub confidence_score: f64,

    pub learned_at: DateTime<Utc>,
    pub last_applied_at: DateTime<Utc>,
}

impl LearnedCorrection {
    fn clamp(&mut self) {
        self.confidence_score = self.confidence_score.clamp(0.0, 1.0);
        self.success_rate = self.success_rate.clamp(0.0, 1.0);
    }
}

/// Fields supplied when a correction is first recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewCorrection {
    pub error_kind: ErrorKind,
    pub error_pattern: String,
    pub database_kind: DatabaseKind,
    pub original_sql: String,
    pub original_error: String,
    pub corrected_sql: String,
    pub description: Option<String>,
    pub table_pattern: Option<String>,
    pub column_pattern: Option<String>,
    pub confidence_score: f64,
}

/// Exact identity of a correction. Unset patterns only match unset patterns.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionKey<'a> {
    pub error_kind: ErrorKind,
    pub error_pattern: &'a str,
    pub database_kind: DatabaseKind,
    pub table_pattern: Option<&'a str>,
    pub column_pattern: Option<&'a str>,
}

impl<'a> From<&'a NewCorrection> for CorrectionKey<'a> {
    fn from(new: &'a NewCorrection) -> Self {
        Self {
            error_kind: new.error_kind,
            error_pattern: &new.error_pattern,
            database_kind: new.database_kind,
            table_pattern: new.table_pattern.as_deref(),
            column_pattern: new.column_pattern.as_deref(),
        }
    }
}

/// Filter for corrections that may help with a fresh error.
/// A set pattern matches records with the same pattern or none at all.
#[derive(Debug, Clone)]
pub struct ApplicableQuery {
    pub error_kind: ErrorKind,
    pub database_kind: DatabaseKind,
    pub min_confidence: f64,
    pub table_pattern: Option<String>,
    pub column_pattern: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_corrections: usize,
    pub by_error_kind: BTreeMap<String, usize>,
    /// Most-applied corrections, at most ten
    pub top_corrections: Vec<LearnedCorrection>,
}

/// Storage for learned corrections.
pub trait CorrectionStore: Send + Sync {
    fn find_exact(&self, key: &CorrectionKey<'_>) -> Result<Option<LearnedCorrection>>;

    fn insert(&self, new: &NewCorrection) -> Result<i64>;

    /// Insert `new`, or run `bump` on the record with the same key.
    /// Returns the id and whether a record was created.
    fn upsert(&self, new: &NewCorrection, bump: &mut dyn FnMut(&mut LearnedCorrection)) -> Result<(i64, bool)>;

    /// Atomic read-modify-write of one record; `None` if the id is unknown
    fn update(&self, id: i64, apply: &mut dyn FnMut(&mut LearnedCorrection)) -> Result<Option<LearnedCorrection>>;

    fn get(&self, id: i64) -> Result<Option<LearnedCorrection>>;

    /// Ordered by confidence, then times applied, both descending
    fn query_applicable(&self, query: &ApplicableQuery) -> Result<Vec<LearnedCorrection>>;

    /// Most recently learned first
    fn list(&self, limit: usize) -> Result<Vec<LearnedCorrection>>;

    fn delete(&self, id: i64) -> Result<bool>;

    fn stats(&self) -> Result<StoreStats>;
}

const COLUMNS: &str = "id, error_kind, error_pattern, database_kind, original_sql, original_error, \
    corrected_sql, description, table_pattern, column_pattern, times_applied, success_rate, \
    confidence_score, learned_at, last_applied_at";

/// SQLite-backed correction store
pub struct SqliteCorrectionStore {
    db: Mutex<Connection>,
}

impl SqliteCorrectionStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| GuruError::Storage(format!("Failed to open correction store: {}", e)))?;
        info!("Correction store opened at {}", path.display());
        Self::with_connection(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| GuruError::Storage(format!("Failed to open correction store: {}", e)))?;
        Self::with_connection(db)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS learned_corrections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                error_kind TEXT NOT NULL,
                error_pattern TEXT NOT NULL,
                database_kind TEXT NOT NULL,
                original_sql TEXT NOT NULL,
                original_error TEXT NOT NULL,
                corrected_sql TEXT NOT NULL,
                description TEXT,
                table_pattern TEXT,
                column_pattern TEXT,
                times_applied INTEGER NOT NULL DEFAULT 1,
                success_rate REAL NOT NULL DEFAULT 1.0,
                confidence_score REAL NOT NULL DEFAULT 0.7,
                learned_at TEXT NOT NULL,
                last_applied_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_learned_lookup
                ON learned_corrections(error_kind, database_kind, confidence_score);",
        )
        .map_err(|e| GuruError::Storage(format!("Failed to create schema: {}", e)))?;

        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_column<T, E>(idx: usize, raw: String, parse: impl FnOnce(&str) -> std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_column(idx, raw, |s| DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)))
}

fn row_to_correction(row: &Row<'_>) -> rusqlite::Result<LearnedCorrection> {
    Ok(LearnedCorrection {
        id: row.get(0)?,
        error_kind: parse_column(1, row.get(1)?, |s| s.parse::<ErrorKind>())?,
        error_pattern: row.get(2)?,
        database_kind: parse_column(3, row.get(3)?, |s| s.parse::<DatabaseKind>())?,
        original_sql: row.get(4)?,
        original_error: row.get(5)?,
        corrected_sql: row.get(6)?,
        description: row.get(7)?,
        table_pattern: row.get(8)?,
        column_pattern: row.get(9)?,
        times_applied: row.get(10)?,
        success_rate: row.get(11)?,
        confidence_score: row.get(12)?,
        learned_at: parse_time(13, row.get(13)?)?,
        last_applied_at: parse_time(14, row.get(14)?)?,
    })
}

fn select_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<LearnedCorrection>> {
    conn.query_row(
        &format!("SELECT {} FROM learned_corrections WHERE id = ?1", COLUMNS),
        params![id],
        row_to_correction,
    )
    .optional()
}

fn select_exact(conn: &Connection, key: &CorrectionKey<'_>) -> rusqlite::Result<Option<LearnedCorrection>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM learned_corrections
             WHERE error_kind = ?1 AND error_pattern = ?2 AND database_kind = ?3
               AND table_pattern IS ?4 AND column_pattern IS ?5
             ORDER BY id LIMIT 1",
            COLUMNS
        ),
        params![
            key.error_kind.as_str(),
            key.error_pattern,
            key.database_kind.as_str(),
            key.table_pattern,
            key.column_pattern
        ],
        row_to_correction,
    )
    .optional()
}

fn insert_row(conn: &Connection, new: &NewCorrection) -> rusqlite::Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO learned_corrections (
            error_kind, error_pattern, database_kind, original_sql, original_error, corrected_sql,
            description, table_pattern, column_pattern, times_applied, success_rate,
            confidence_score, learned_at, last_applied_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 1.0, ?10, ?11, ?11)",
        params![
            new.error_kind.as_str(),
            new.error_pattern,
            new.database_kind.as_str(),
            new.original_sql,
            new.original_error,
            new.corrected_sql,
            new.description,
            new.table_pattern,
            new.column_pattern,
            new.confidence_score.clamp(0.0, 1.0),
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Apply `mutate` to `current` and write the mutable fields back.
fn write_back(
    conn: &Connection,
    mut current: LearnedCorrection,
    mutate: &mut dyn FnMut(&mut LearnedCorrection),
) -> rusqlite::Result<LearnedCorrection> {
    let floor = current.times_applied;
    mutate(&mut current);
    current.times_applied = current.times_applied.max(floor);
    current.clamp();

    conn.execute(
        "UPDATE learned_corrections
         SET corrected_sql = ?2, description = ?3, times_applied = ?4, success_rate = ?5,
             confidence_score = ?6, last_applied_at = ?7
         WHERE id = ?1",
        params![
            current.id,
            current.corrected_sql,
            current.description,
            current.times_applied,
            current.success_rate,
            current.confidence_score,
            current.last_applied_at.to_rfc3339(),
        ],
    )?;
    Ok(current)
}

impl CorrectionStore for SqliteCorrectionStore {
    fn find_exact(&self, key: &CorrectionKey<'_>) -> Result<Option<LearnedCorrection>> {
        select_exact(&self.conn(), key)
            .map_err(|e| GuruError::Storage(format!("Failed to look up correction: {}", e)))
    }

    fn insert(&self, new: &NewCorrection) -> Result<i64> {
        insert_row(&self.conn(), new)
            .map_err(|e| GuruError::Storage(format!("Failed to insert correction: {}", e)))
    }

    fn upsert(&self, new: &NewCorrection, bump: &mut dyn FnMut(&mut LearnedCorrection)) -> Result<(i64, bool)> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| GuruError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let outcome = match select_exact(&tx, &CorrectionKey::from(new))? {
            Some(existing) => {
                let updated = write_back(&tx, existing, bump)?;
                (updated.id, false)
            }
            None => (insert_row(&tx, new)?, true),
        };

        tx.commit()
            .map_err(|e| GuruError::Storage(format!("Failed to commit correction: {}", e)))?;
        debug!("Upserted correction {} (created: {})", outcome.0, outcome.1);
        Ok(outcome)
    }

    fn update(&self, id: i64, apply: &mut dyn FnMut(&mut LearnedCorrection)) -> Result<Option<LearnedCorrection>> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| GuruError::Storage(format!("Failed to begin transaction: {}", e)))?;

        let updated = match select_by_id(&tx, id)? {
            Some(current) => Some(write_back(&tx, current, apply)?),
            None => None,
        };

        tx.commit()
            .map_err(|e| GuruError::Storage(format!("Failed to commit correction: {}", e)))?;
        Ok(updated)
    }

    fn get(&self, id: i64) -> Result<Option<LearnedCorrection>> {
        select_by_id(&self.conn(), id)
            .map_err(|e| GuruError::Storage(format!("Failed to load correction {}: {}", id, e)))
    }

    fn query_applicable(&self, query: &ApplicableQuery) -> Result<Vec<LearnedCorrection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learned_corrections
             WHERE error_kind = ?1 AND database_kind = ?2 AND confidence_score >= ?3
               AND (?4 IS NULL OR table_pattern = ?4 OR table_pattern IS NULL)
               AND (?5 IS NULL OR column_pattern = ?5 OR column_pattern IS NULL)
             ORDER BY confidence_score DESC, times_applied DESC, id ASC
             LIMIT ?6",
            COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                query.error_kind.as_str(),
                query.database_kind.as_str(),
                query.min_confidence,
                query.table_pattern,
                query.column_pattern,
                query.limit as i64,
            ],
            row_to_correction,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| GuruError::Storage(format!("Failed to query corrections: {}", e)))
    }

    fn list(&self, limit: usize) -> Result<Vec<LearnedCorrection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learned_corrections ORDER BY learned_at DESC, id DESC LIMIT ?1",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_correction)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| GuruError::Storage(format!("Failed to list corrections: {}", e)))
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM learned_corrections WHERE id = ?1", params![id])
            .map_err(|e| GuruError::Storage(format!("Failed to delete correction {}: {}", id, e)))?;
        if removed > 0 {
            info!("Deleted learned correction {}", id);
        }
        Ok(removed > 0)
    }

    fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM learned_corrections", [], |row| row.get(0))?;

        let mut by_kind_stmt =
            conn.prepare("SELECT error_kind, COUNT(*) FROM learned_corrections GROUP BY error_kind")?;
        let by_error_kind = by_kind_stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        let mut top_stmt = conn.prepare(&format!(
            "SELECT {} FROM learned_corrections ORDER BY times_applied DESC, confidence_score DESC, id ASC LIMIT 10",
            COLUMNS
        ))?;
        let top_corrections = top_stmt
            .query_map([], row_to_correction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(StoreStats {
            total_corrections: total as usize,
            by_error_kind,
            top_corrections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_correction(pattern: &str, table: Option<&str>) -> NewCorrection {
        NewCorrection {
            error_kind: ErrorKind::TableNotFound,
            error_pattern: pattern.to_string(),
            database_kind: DatabaseKind::Sqlite,
            original_sql: "SELECT * FROM prodcuts".to_string(),
            original_error: "no such table: prodcuts".to_string(),
            corrected_sql: "SELECT * FROM products".to_string(),
            description: Some("Fix for missing table: prodcuts".to_string()),
            table_pattern: table.map(String::from),
            column_pattern: None,
            confidence_score: 0.7,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteCorrectionStore::in_memory().unwrap();
        let id = store.insert(&new_correction("no such table: prodcuts", Some("prodcuts"))).unwrap();
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.times_applied, 1);
        assert_eq!(stored.success_rate, 1.0);
        assert_eq!(stored.confidence_score, 0.7);
        assert_eq!(stored.error_kind, ErrorKind::TableNotFound);
        assert_eq!(stored.learned_at, stored.last_applied_at);
    }

    #[test]
    fn test_find_exact_treats_null_patterns_as_identity() {
        let store = SqliteCorrectionStore::in_memory().unwrap();
        let with_table = new_correction("p", Some("prodcuts"));
        let without_table = new_correction("p", None);
        store.insert(&with_table).unwrap();

        assert!(store.find_exact(&CorrectionKey::from(&with_table)).unwrap().is_some());
        assert!(store.find_exact(&CorrectionKey::from(&without_table)).unwrap().is_none());
    }

    #[test]
    fn test_upsert_bumps_existing_record() {
        let store = SqliteCorrectionStore::in_memory().unwrap();
        let new = new_correction("no such table: prodcuts", Some("prodcuts"));
        let (first, created) = store.upsert(&new, &mut |c| c.times_applied += 1).unwrap();
        assert!(created);
        let (second, created) = store.upsert(&new, &mut |c| c.times_applied += 1).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(store.get(first).unwrap().unwrap().times_applied, 2);
    }

    #[test]
    fn test_update_clamps_and_never_decreases_times_applied() {
        let store = SqliteCorrectionStore::in_memory().unwrap();
        let id = store.insert(&new_correction("p", None)).unwrap();
        let updated = store
            .update(id, &mut |c| {
                c.confidence_score = 7.0;
                c.success_rate = -1.0;
                c.times_applied = 0;
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.confidence_score, 1.0);
        assert_eq!(updated.success_rate, 0.0);
        assert_eq!(updated.times_applied, 1);

        assert!(store.update(9999, &mut |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_query_applicable_filters_and_orders() {
        let store = SqliteCorrectionStore::in_memory().unwrap();
        let specific = store.insert(&new_correction("a", Some("prodcuts"))).unwrap();
        let generic = store.insert(&new_correction("b", None)).unwrap();
        let other_table = store.insert(&new_correction("c", Some("custmers"))).unwrap();
        let weak = store.insert(&new_correction("d", None)).unwrap();
        store.update(generic, &mut |c| c.confidence_score = 0.9).unwrap();
        store.update(weak, &mut |c| c.confidence_score = 0.4).unwrap();

        let query = ApplicableQuery {
            error_kind: ErrorKind::TableNotFound,
            database_kind: DatabaseKind::Sqlite,
            min_confidence: 0.5,
            table_pattern: Some("prodcuts".to_string()),
            column_pattern: None,
            limit: 5,
        };
        let ids: Vec<i64> = store.query_applicable(&query).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![generic, specific]);

        let broad = ApplicableQuery { table_pattern: None, ..query.clone() };
        let ids: Vec<i64> = store.query_applicable(&broad).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![generic, specific, other_table]);

        let postgres = ApplicableQuery { database_kind: DatabaseKind::Postgresql, ..query };
        assert!(store.query_applicable(&postgres).unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_stats() {
        let store = SqliteCorrectionStore::in_memory().unwrap();
        let id = store.insert(&new_correction("a", None)).unwrap();
        let mut column = new_correction("b", None);
        column.error_kind = ErrorKind::ColumnNotFound;
        store.insert(&column).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_corrections, 2);
        assert_eq!(stats.by_error_kind["table_not_found"], 1);
        assert_eq!(stats.by_error_kind["column_not_found"], 1);
        assert_eq!(stats.top_corrections.len(), 2);

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert_eq!(store.list(10).unwrap().len(), 1);
    }

    #[test]
    fn test_reopens_persisted_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("corrections.db");
        let id = {
            let store = SqliteCorrectionStore::open(&path).unwrap();
            store.insert(&new_correction("a", None)).unwrap()
        };
        let reopened = SqliteCorrectionStore::open(&path).unwrap();
        assert!(reopened.get(id).unwrap().is_some());
    }
}
