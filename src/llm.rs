//! OpenAI-compatible chat client and the LLM-backed SQL generator.

use crate::config::LlmSettings;
use crate::error::{GuruError, Result};
use crate::schema::SchemaSnapshot;
use crate::sql_generation::{DatabaseKind, GeneratedSql, SqlGenerator, SqlValidator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const SYSTEM_PROMPT: &str = r#"You are an expert SQL query generator. Convert natural language questions into valid SQL queries.

Rules:
1. Return ONLY the SQL query, with no explanation or markdown
2. Use the syntax of the specified database type
3. Use table and column names exactly as they appear in the schema
4. Only generate SELECT queries unless a modification is explicitly requested
5. Never use DROP, DELETE or TRUNCATE unless explicitly requested
6. Always name the table in the FROM clause
7. Add a LIMIT to queries that could return large result sets"#;

/// API key that short-circuits every call with a canned answer
pub const OFFLINE_API_KEY: &str = "dummy-api-key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(settings.api_key.clone(), settings.model.clone(), settings.base_url.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_offline(&self) -> bool {
        self.api_key.is_empty() || self.api_key == OFFLINE_API_KEY
    }

    /// Send a chat completion and return the first choice's text.
    /// Offline clients return `offline_reply` instead.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        temperature: f64,
        offline_reply: &str,
    ) -> Result<String> {
        if self.is_offline() {
            return Ok(offline_reply.to_string());
        }

        let body = serde_json::json!({
            "model": model.unwrap_or(&self.model),
            "messages": messages,
            "temperature": temperature,
            "max_tokens": 1000
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GuruError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GuruError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            let message = response_json["error"]["message"].as_str().unwrap_or("no error message");
            return Err(GuruError::Llm(format!("LLM API returned {}: {}", status, message)));
        }

        response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GuruError::Llm("No content in LLM response".to_string()))
    }
}

/// [`SqlGenerator`] backed by a chat completion endpoint
pub struct LlmSqlGenerator {
    client: LlmClient,
}

impl LlmSqlGenerator {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(LlmClient::from_settings(settings))
    }
}

fn generation_prompt(question: &str, schema: &SchemaSnapshot, database_kind: DatabaseKind) -> String {
    format!(
        "Given the following database schema:\n\n{}\n\nGenerate a SQL query to answer this question: {}\n\nDatabase type: {}\n\nSQL Query:",
        schema.to_prompt_text(),
        question,
        database_kind
    )
}

fn fix_prompt(sql: &str, error_with_hints: &str, schema: &SchemaSnapshot, database_kind: DatabaseKind) -> String {
    format!(
        "This SQL query resulted in an error. Fix it:\n\nQuery:\n{}\n\nError:\n{}\n\nSchema:\n{}\n\nDatabase type: {}\n\nProvide the corrected SQL query ONLY.",
        sql,
        error_with_hints,
        schema.to_prompt_text(),
        database_kind
    )
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        database_kind: DatabaseKind,
        allow_write: bool,
        model_hint: Option<&str>,
    ) -> Result<GeneratedSql> {
        let model = model_hint.unwrap_or_else(|| self.client.model());
        info!("Generating SQL for: {} (using model: {})", question, model);

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(generation_prompt(question, schema, database_kind)),
        ];
        let raw = self.client.chat(&messages, Some(model), 0.1, "SELECT 1;").await?;

        let mut generated = GeneratedSql::checked(SqlValidator::clean_llm_output(&raw));
        if !allow_write && !generated.is_read_only {
            generated
                .warnings
                .push("Write operations not allowed. Query may be rejected.".to_string());
        }
        let dangerous = SqlValidator::dangerous_keywords(&generated.sql);
        if !dangerous.is_empty() {
            generated
                .warnings
                .push(format!("Dangerous operations detected: {}", dangerous.join(", ")));
        }

        if !generated.warnings.is_empty() {
            warn!("Warnings: {:?}", generated.warnings);
        }
        Ok(generated)
    }

    async fn fix_error(
        &self,
        sql: &str,
        error_with_hints: &str,
        schema: &SchemaSnapshot,
        database_kind: DatabaseKind,
    ) -> Result<GeneratedSql> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(fix_prompt(sql, error_with_hints, schema, database_kind)),
        ];

        match self.client.chat(&messages, None, 0.1, sql).await {
            Ok(raw) => Ok(GeneratedSql::checked(SqlValidator::clean_llm_output(&raw))),
            Err(e) => {
                error!("SQL error correction failed: {}", e);
                Ok(GeneratedSql {
                    sql: sql.to_string(),
                    is_valid: false,
                    is_read_only: SqlValidator::is_read_only(sql),
                    warnings: vec![format!("Correction failed: {}", e)],
                })
            }
        }
    }

    fn default_model(&self) -> &str {
        self.client.model()
    }
}
