//! Pipeline configuration
//!
//! Tunables for the retry loop, the repair cascade and result verification,
//! plus process-level settings read from the environment (and `.env`).

use crate::error::{GuruError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Knobs shared by the retry loop, the fixer and the verifier.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Total attempts per question, the first one included.
    pub max_retries: u32,
    /// Wall-clock budget for a single execution call.
    pub execution_timeout: Duration,
    pub max_rows: usize,
    /// Minimum similarity for a schema name to be considered at all.
    pub match_threshold: f64,
    /// Minimum confidence before a quick fix is applied to SQL.
    pub apply_threshold: f64,
    pub learned_lookup_limit: usize,
    pub enable_learning: bool,
    pub enable_diagnostics: bool,
    pub extreme_value_threshold: f64,
    pub diagnostic_timeout: Duration,
    pub diagnostic_max_rows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            execution_timeout: Duration::from_secs(30),
            max_rows: 1000,
            match_threshold: 0.6,
            apply_threshold: 0.7,
            learned_lookup_limit: 5,
            enable_learning: true,
            enable_diagnostics: true,
            extreme_value_threshold: 1e9,
            diagnostic_timeout: Duration::from_secs(10),
            diagnostic_max_rows: 10,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }
}

/// Connection details for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Process settings: pipeline tunables plus where things live.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub allow_write: bool,
    pub learning_db: PathBuf,
    pub llm: LlmSettings,
}

impl Settings {
    /// Load settings from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PipelineConfig::default();

        let pipeline = PipelineConfig {
            max_retries: parse_or(&lookup, "DBGURU_MAX_RETRIES", defaults.max_retries)?,
            execution_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DBGURU_QUERY_TIMEOUT_SECONDS",
                defaults.execution_timeout.as_secs(),
            )?),
            max_rows: parse_or(&lookup, "DBGURU_MAX_QUERY_ROWS", defaults.max_rows)?,
            enable_learning: parse_or(&lookup, "DBGURU_ENABLE_LEARNING", defaults.enable_learning)?,
            enable_diagnostics: parse_or(
                &lookup,
                "DBGURU_ENABLE_DIAGNOSTICS",
                defaults.enable_diagnostics,
            )?,
            extreme_value_threshold: parse_or(
                &lookup,
                "DBGURU_EXTREME_VALUE_THRESHOLD",
                defaults.extreme_value_threshold,
            )?,
            ..defaults
        };

        if pipeline.max_retries == 0 {
            return Err(GuruError::Config(
                "DBGURU_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if pipeline.execution_timeout.is_zero() {
            return Err(GuruError::Config(
                "DBGURU_QUERY_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }

        let llm = LlmSettings {
            api_key: lookup("OPENAI_API_KEY").unwrap_or_else(|| "dummy-api-key".to_string()),
            model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4".to_string()),
            base_url: lookup("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        };

        Ok(Self {
            pipeline,
            allow_write: parse_or(&lookup, "DBGURU_ALLOW_WRITE", false)?,
            learning_db: lookup("DBGURU_LEARNING_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("learned_corrections.db")),
            llm,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| GuruError::Config(format!("Invalid value for {}: {} ({})", key, raw, e))),
        _ => Ok(default),
    }
}
