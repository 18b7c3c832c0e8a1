//! Self-hosted machine translation service (OPUS-MT models behind a small
//! HTTP wrapper).
//!
//! The service takes explicit source and target codes:
//!
//! ```text
//! POST {url}  {"src_text": "...", "src_lang": "en", "tgt_lang": "es"}
//!          -> {"translated_text": "...", "model": "..."}
//! ```

use crate::retry::{with_retry_if, RetryConfig};
use crate::translation::{check_status, TranslationBackend, TranslationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const OPUS_MT_TAG: &str = "OPUS-MT";

#[derive(Debug, Serialize)]
struct OpusRequest<'a> {
    src_text: &'a str,
    src_lang: &'a str,
    tgt_lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpusResponse {
    translated_text: Option<String>,
}

pub struct OpusMtBackend {
    client: reqwest::Client,
    url: String,
    retry: RetryConfig,
}

impl OpusMtBackend {
    pub fn new(client: reqwest::Client, url: String, retry: RetryConfig) -> Self {
        Self { client, url, retry }
    }
}

#[async_trait]
impl TranslationBackend for OpusMtBackend {
    fn model_tag(&self) -> &str {
        OPUS_MT_TAG
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslationError> {
        let request = OpusRequest {
            src_text: text,
            src_lang: source_lang,
            tgt_lang: target_lang,
        };

        with_retry_if(
            &self.retry,
            &format!("OPUS-MT {} -> {}", source_lang, target_lang),
            || async {
                let response = self.client.post(&self.url).json(&request).send().await?;
                let response = check_status(response).await?;

                let body: OpusResponse = response.json().await.map_err(|e| {
                    TranslationError::InvalidResponse(format!(
                        "failed to parse OPUS-MT response: {}",
                        e
                    ))
                })?;

                body.translated_text.ok_or_else(|| {
                    TranslationError::InvalidResponse(
                        "OPUS-MT response has no translated_text".to_string(),
                    )
                })
            },
            TranslationError::is_retryable,
        )
        .await
    }
}
