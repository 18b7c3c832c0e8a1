use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,

    // Database
    pub database_url: String,

    // Authentication
    pub jwt_secret: String,

    // Media
    pub media_dir: String,
    pub media_base_url: String,

    // Translation backends
    pub translation: TranslationConfig,
}

/// Everything the translation adapter needs, injected at construction.
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    /// Self-hosted machine translation service. `None` disables the primary backend.
    pub primary_backend_url: Option<String>,

    /// Chat completion backend. `None` disables the LLM backend.
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_api_url: String,

    /// Cloud translation API, only tried when a key is configured.
    pub cloud_api_key: Option<String>,
    pub cloud_api_url: String,

    pub per_backend_timeout_ms: u64,
}

impl TranslationConfig {
    pub fn per_backend_timeout(&self) -> Duration {
        Duration::from_millis(self.per_backend_timeout_ms)
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            primary_backend_url: Some("http://localhost:8000/translate".to_string()),
            llm_api_key: None,
            llm_model: "gpt-3.5-turbo".to_string(),
            llm_api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            cloud_api_key: None,
            cloud_api_url: "https://translation.googleapis.com/language/translate/v2".to_string(),
            per_backend_timeout_ms: 5000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = TranslationConfig::default();

        Ok(Self {
            // Server
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),

            // Database
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL not set")?,

            // Authentication
            jwt_secret: std::env::var("JWT_SECRET").context("JWT_SECRET not set")?,

            // Media
            media_dir: std::env::var("MEDIA_DIR").unwrap_or_else(|_| "./uploads".to_string()),
            media_base_url: std::env::var("MEDIA_BASE_URL")
                .unwrap_or_else(|_| "/media".to_string()),

            translation: TranslationConfig {
                primary_backend_url: match std::env::var("TRANSLATOR_URL") {
                    Ok(url) => non_empty(url),
                    Err(_) => defaults.primary_backend_url,
                },
                llm_api_key: std::env::var("OPENAI_API_KEY").ok().and_then(non_empty),
                llm_model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.llm_model),
                llm_api_url: std::env::var("OPENAI_API_URL").unwrap_or(defaults.llm_api_url),
                cloud_api_key: std::env::var("GOOGLE_API_KEY").ok().and_then(non_empty),
                cloud_api_url: std::env::var("GOOGLE_TRANSLATE_URL")
                    .unwrap_or(defaults.cloud_api_url),
                per_backend_timeout_ms: std::env::var("TRANSLATION_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.per_backend_timeout_ms),
            },
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
