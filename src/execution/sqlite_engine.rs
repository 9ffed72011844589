//! SQLite Execution Engine
//!
//! Runs statements on a shared rusqlite connection from the blocking pool.
//! The guard check runs before anything reaches the database. The timeout
//! covers the statement only: its clock starts once the connection lock is
//! held, and a progress handler aborts that statement alone at the deadline.

use crate::error::{GuruError, Result};
use crate::execution::engine::{ExecutionOptions, SqlExecutor};
use crate::execution::result::{QueryResult, Row};
use crate::schema::{ForeignKey, SchemaProvider, SchemaSnapshot, TableSchema};
use crate::sql_generation::SqlValidator;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// VM instructions between deadline checks
const PROGRESS_OPS: i32 = 1000;

pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            GuruError::Database(format!("Failed to open {}: {}", path.as_ref().display(), e))
        })?;
        info!("Opened SQLite database at {}", path.as_ref().display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| GuruError::Database(format!("Failed to open in-memory database: {}", e)))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run setup statements directly, bypassing the guard.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        lock(&self.conn)
            .execute_batch(sql)
            .map_err(|e| GuruError::Database(format!("Batch failed: {}", e)))
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

/// Rows collected from one statement; the flag is set when the cap cut rows off.
fn run_statement(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
) -> rusqlite::Result<(Vec<String>, Vec<Row>, bool)> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        let changed = stmt.execute([])?;
        debug!("Statement changed {} rows", changed);
        return Ok((columns, Vec::new(), false));
    }

    let mut rows = stmt.query([])?;
    let mut data = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if data.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(idx)?));
        }
        data.push(record);
    }
    Ok((columns, data, truncated))
}

/// Run one statement under its own deadline. The handler is removed again
/// before the lock is released.
fn run_with_deadline(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
    timeout: Duration,
) -> rusqlite::Result<(Vec<String>, Vec<Row>, bool)> {
    let deadline = Instant::now() + timeout;
    conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
    let outcome = run_statement(conn, sql, max_rows);
    conn.progress_handler(0, None::<fn() -> bool>);
    outcome
}

fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted)
}

fn load_schema(conn: &Connection) -> rusqlite::Result<SchemaSnapshot> {
    let mut snapshot = SchemaSnapshot::new();
    let mut tables = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = tables
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut columns = conn.prepare("SELECT name, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let mut fks = conn.prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)")?;

    for name in names {
        let mut table = TableSchema::default();
        let cols = columns
            .query_map([&name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (column, pk) in cols {
            if pk == 1 {
                table.primary_key = Some(column.clone());
            }
            table.columns.push(column);
        }
        table.foreign_keys = fks
            .query_map([&name], |row| {
                Ok(ForeignKey {
                    column: row.get(0)?,
                    references_table: row.get(1)?,
                    references_column: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        snapshot.tables.insert(name, table);
    }
    Ok(snapshot)
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, sql: &str, options: &ExecutionOptions) -> Result<QueryResult> {
        let start_time = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;

        if let Some(reason) = SqlValidator::check_statement_safety(sql, options.allow_write) {
            warn!("Blocked statement: {}", reason);
            return Ok(QueryResult::failure(reason, elapsed_ms(start_time)));
        }

        debug!("Executing on sqlite: {}", sql);
        let conn = Arc::clone(&self.conn);
        let owned_sql = sql.to_string();
        let max_rows = options.max_rows;
        let timeout = options.timeout;
        let outcome = tokio::task::spawn_blocking(move || {
            let guard = lock(&conn);
            run_with_deadline(&guard, &owned_sql, max_rows, timeout)
        })
        .await
        .map_err(|e| GuruError::Execution(format!("SQLite worker failed: {}", e)))?;

        Ok(match outcome {
            Ok((columns, data, truncated)) => {
                QueryResult::success(columns, data, elapsed_ms(start_time)).with_truncated(truncated)
            }
            Err(e) if is_interrupted(&e) => {
                warn!("Statement exceeded {:?}, interrupted", timeout);
                QueryResult::failure(
                    format!("Query timeout after {} seconds", timeout.as_secs_f64()),
                    elapsed_ms(start_time),
                )
            }
            Err(e) => QueryResult::failure(format!("SQL error: {}", e), elapsed_ms(start_time)),
        })
    }
}

#[async_trait]
impl SchemaProvider for SqliteExecutor {
    async fn snapshot(&self) -> Result<SchemaSnapshot> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || load_schema(&lock(&conn)))
            .await
            .map_err(|e| GuruError::Execution(format!("SQLite worker failed: {}", e)))?
            .map_err(|e| GuruError::Schema(format!("Failed to read schema: {}", e)))
    }
}
