//! Translation adapter: an ordered chain of backends with per-backend
//! timeouts.
//!
//! Translation is an enhancement, never a dependency of a send. Every backend
//! error is logged and absorbed here; when the whole chain fails the caller
//! gets the original text back under the [`NOOP_MODEL`] tag.

use crate::cloud_translate::CloudTranslateBackend;
use crate::config::TranslationConfig;
use crate::i18n::TranslationMetrics;
use crate::models::NOOP_MODEL;
use crate::openai::OpenAiBackend;
use crate::opus_mt::OpusMtBackend;
use crate::retry::RetryConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TranslationError {
    /// Network failures, rate limiting (429) and server errors (5xx) are
    /// transient. Other client errors and malformed responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TranslationError::Network(_) => true,
            TranslationError::Api { status, .. } => *status == 429 || *status >= 500,
            TranslationError::InvalidResponse(_) => false,
        }
    }
}

/// Turn a non-success HTTP response into a [`TranslationError::Api`].
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, TranslationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
    Err(TranslationError::Api {
        status: status.as_u16(),
        body,
    })
}

/// One translation service in the fallback chain.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    /// Tag recorded on messages this backend translated.
    fn model_tag(&self) -> &str;

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub translated_text: String,
    pub model_tag: String,
}

impl TranslationResult {
    /// The original text, untouched.
    pub fn noop(text: &str) -> Self {
        Self {
            translated_text: text.to_string(),
            model_tag: NOOP_MODEL.to_string(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.model_tag == NOOP_MODEL
    }
}

pub struct Translator {
    backends: Vec<Arc<dyn TranslationBackend>>,
    per_backend_timeout: Duration,
    metrics: Arc<TranslationMetrics>,
}

impl Translator {
    pub fn new(backends: Vec<Arc<dyn TranslationBackend>>, per_backend_timeout: Duration) -> Self {
        Self {
            backends,
            per_backend_timeout,
            metrics: Arc::new(TranslationMetrics::new()),
        }
    }

    /// Build the chain from configuration: self-hosted MT first, then the
    /// LLM, then the cloud API. Backends without their URL or key are left out.
    pub fn from_config(config: &TranslationConfig, client: reqwest::Client) -> Self {
        let retry = RetryConfig::translation_backend();
        let mut backends: Vec<Arc<dyn TranslationBackend>> = Vec::new();

        if let Some(url) = &config.primary_backend_url {
            backends.push(Arc::new(OpusMtBackend::new(
                client.clone(),
                url.clone(),
                retry.clone(),
            )));
        }

        if let Some(api_key) = &config.llm_api_key {
            backends.push(Arc::new(OpenAiBackend::new(
                client.clone(),
                config.llm_api_url.clone(),
                api_key.clone(),
                config.llm_model.clone(),
                retry.clone(),
            )));
        }

        if let Some(api_key) = &config.cloud_api_key {
            backends.push(Arc::new(CloudTranslateBackend::new(
                client,
                config.cloud_api_url.clone(),
                api_key.clone(),
                retry,
            )));
        }

        let tags: Vec<&str> = backends.iter().map(|b| b.model_tag()).collect();
        info!("Translation chain: [{}]", tags.join(" -> "));

        Self::new(backends, config.per_backend_timeout())
    }

    pub fn metrics(&self) -> Arc<TranslationMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Translate `text`, falling through the chain until a backend succeeds.
    ///
    /// Never fails. Equal languages or blank text short-circuit to a no-op
    /// without touching any backend.
    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> TranslationResult {
        if source_lang == target_lang || text.trim().is_empty() {
            return TranslationResult::noop(text);
        }

        self.metrics.record_request();

        for backend in &self.backends {
            let tag = backend.model_tag();
            let attempt = timeout(
                self.per_backend_timeout,
                backend.translate(text, source_lang, target_lang),
            )
            .await;

            match attempt {
                Ok(Ok(translated)) => {
                    let translated = translated.trim();
                    if translated.is_empty() {
                        warn!("{} returned an empty translation, trying next backend", tag);
                        self.metrics.record_failure(tag);
                        continue;
                    }

                    debug!("{} translated {} -> {}", tag, source_lang, target_lang);
                    self.metrics.record_success(tag);
                    return TranslationResult {
                        translated_text: translated.to_string(),
                        model_tag: tag.to_string(),
                    };
                }
                Ok(Err(e)) => {
                    warn!(
                        "{} failed to translate {} -> {}: {}",
                        tag, source_lang, target_lang, e
                    );
                    self.metrics.record_failure(tag);
                }
                Err(_) => {
                    warn!(
                        "{} timed out after {:?} translating {} -> {}",
                        tag, self.per_backend_timeout, source_lang, target_lang
                    );
                    self.metrics.record_timeout(tag);
                }
            }
        }

        warn!(
            "All translation backends failed for {} -> {}, keeping original text",
            source_lang, target_lang
        );
        self.metrics.record_noop();
        TranslationResult::noop(text)
    }
}
