//! Google Cloud Translation (v2 REST) as the last backend in the chain.

use crate::retry::{with_retry_if, RetryConfig};
use crate::translation::{check_status, TranslationBackend, TranslationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const CLOUD_TRANSLATE_TAG: &str = "google-translate";

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Debug, Deserialize)]
struct TranslateData {
    translations: Vec<TranslatedItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslatedItem {
    translated_text: String,
}

pub struct CloudTranslateBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl CloudTranslateBackend {
    pub fn new(client: reqwest::Client, api_url: String, api_key: String, retry: RetryConfig) -> Self {
        Self {
            client,
            api_url,
            api_key,
            retry,
        }
    }
}

#[async_trait]
impl TranslationBackend for CloudTranslateBackend {
    fn model_tag(&self) -> &str {
        CLOUD_TRANSLATE_TAG
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslationError> {
        let request = TranslateRequest {
            q: text,
            source: source_lang,
            target: target_lang,
            // "html" would escape apostrophes and ampersands
            format: "text",
        };

        with_retry_if(
            &self.retry,
            &format!("Cloud translate {} -> {}", source_lang, target_lang),
            || async {
                let response = self
                    .client
                    .post(&self.api_url)
                    .query(&[("key", self.api_key.as_str())])
                    .json(&request)
                    .send()
                    .await?;
                let response = check_status(response).await?;

                let body: TranslateResponse = response.json().await.map_err(|e| {
                    TranslationError::InvalidResponse(format!(
                        "failed to parse cloud translation response: {}",
                        e
                    ))
                })?;

                body.data
                    .translations
                    .into_iter()
                    .next()
                    .map(|item| item.translated_text)
                    .ok_or_else(|| {
                        TranslationError::InvalidResponse(
                            "cloud translation returned no translations".to_string(),
                        )
                    })
            },
            TranslationError::is_retryable,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::{
        matchers::{body_partial_json, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn backend(server: &MockServer) -> CloudTranslateBackend {
        CloudTranslateBackend::new(
            reqwest::Client::new(),
            format!("{}/language/translate/v2", server.uri()),
            "cloud-key".to_string(),
            RetryConfig::new(2, Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_translate_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/language/translate/v2"))
            .and(query_param("key", "cloud-key"))
            .and(body_partial_json(serde_json::json!({
                "q": "Good morning",
                "target": "ja",
                "format": "text"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "translations": [ { "translatedText": "おはようございます" } ] }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = backend(&mock_server)
            .translate("Good morning", "en", "ja")
            .await;
        assert_eq!(result.expect("Should translate"), "おはようございます");
    }

    #[tokio::test]
    async fn test_empty_translations_is_invalid() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/language/translate/v2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "translations": [] }
            })))
            .mount(&mock_server)
            .await;

        let err = backend(&mock_server)
            .translate("Hello", "en", "ru")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no translations"));
    }

    #[tokio::test]
    async fn test_bad_key_fails_without_retry() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/language/translate/v2"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = backend(&mock_server)
            .translate("Hello", "en", "ru")
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::Api { status: 403, .. }));
    }
}
