use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuruError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Correction storage error: {0}")]
    Storage(String),

    #[error("Schema error: {0}")]
    Schema(String),

    /// Defects in the pipeline itself, as opposed to failures of the
    /// collaborators it drives.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, GuruError>;
