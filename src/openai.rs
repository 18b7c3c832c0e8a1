//! Chat-completion translation backend.

use crate::i18n::LanguageRegistry;
use crate::retry::{with_retry_if, RetryConfig};
use crate::translation::{check_status, TranslationBackend, TranslationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const SYSTEM_PROMPT: &str = "You are a translation assistant.";

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
}

/// Check if a model is a reasoning model that doesn't support temperature
fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("gpt-5")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

fn build_user_prompt(text: &str, target_language: &str) -> String {
    format!(
        "Translate ONLY the following text to {}. Do NOT explain, just reply with the translation. Text: {}",
        target_language, text
    )
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    retry: RetryConfig,
}

impl OpenAiBackend {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: String,
        model: String,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            api_url,
            api_key,
            model,
            retry,
        }
    }

    fn build_request(&self, text: &str, target_lang: &str) -> ChatRequest {
        let target_language = LanguageRegistry::get().display_name(target_lang);
        let is_reasoning = is_reasoning_model(&self.model);

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_user_prompt(text, target_language),
                },
            ],
            // Reasoning models spend tokens before answering
            max_completion_tokens: if is_reasoning { 4000 } else { 1000 },
            temperature: if is_reasoning { None } else { Some(0.2) },
            reasoning_effort: if is_reasoning {
                Some("low".to_string())
            } else {
                None
            },
        }
    }
}

#[async_trait]
impl TranslationBackend for OpenAiBackend {
    fn model_tag(&self) -> &str {
        &self.model
    }

    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslationError> {
        let request = self.build_request(text, target_lang);

        with_retry_if(
            &self.retry,
            &format!("{} translation to {}", self.model, target_lang),
            || async {
                let response = self
                    .client
                    .post(&self.api_url)
                    .bearer_auth(&self.api_key)
                    .json(&request)
                    .send()
                    .await?;
                let response = check_status(response).await?;

                let chat_response: ChatResponse = response.json().await.map_err(|e| {
                    TranslationError::InvalidResponse(format!(
                        "failed to parse chat completion: {}",
                        e
                    ))
                })?;

                chat_response
                    .choices
                    .first()
                    .map(|c| c.message.content.trim().to_string())
                    .ok_or_else(|| {
                        TranslationError::InvalidResponse(
                            "chat completion contained no choices".to_string(),
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
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn backend(server: &MockServer, model: &str) -> OpenAiBackend {
        OpenAiBackend::new(
            reqwest::Client::new(),
            format!("{}/v1/chat/completions", server.uri()),
            "test-openai-key".to_string(),
            model.to_string(),
            RetryConfig::new(3, Duration::from_millis(10)),
        )
    }

    fn create_openai_response(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [
                {
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": content
                    },
                    "finish_reason": "stop"
                }
            ]
        })
    }

    #[test]
    fn test_user_prompt_is_strict() {
        let prompt = build_user_prompt("Hello", "Spanish");
        assert!(prompt.contains("Translate ONLY"));
        assert!(prompt.contains("Do NOT explain"));
        assert!(prompt.contains("Spanish"));
        assert!(prompt.ends_with("Text: Hello"));
    }

    #[test]
    fn test_unknown_target_uses_english_name() {
        let server_less = OpenAiBackend::new(
            reqwest::Client::new(),
            "http://unused.test".to_string(),
            "key".to_string(),
            "gpt-4o-mini".to_string(),
            RetryConfig::default(),
        );
        let request = server_less.build_request("Hola", "xx");
        assert!(request.messages[1].content.contains("to English."));
    }

    #[test]
    fn test_request_serialization() {
        let backend = OpenAiBackend::new(
            reqwest::Client::new(),
            "http://unused.test".to_string(),
            "key".to_string(),
            "gpt-4o-mini".to_string(),
            RetryConfig::default(),
        );
        let json = serde_json::to_string(&backend.build_request("Hello", "ko")).expect("serialize");
        assert!(json.contains("gpt-4o-mini"));
        assert!(json.contains("0.2"));
        assert!(json.contains("Korean"));
        assert!(!json.contains("reasoning_effort"));
    }

    #[test]
    fn test_request_serialization_reasoning_model() {
        let backend = OpenAiBackend::new(
            reqwest::Client::new(),
            "http://unused.test".to_string(),
            "key".to_string(),
            "o4-mini".to_string(),
            RetryConfig::default(),
        );
        let json = serde_json::to_string(&backend.build_request("Hello", "ko")).expect("serialize");
        assert!(json.contains("reasoning_effort"));
        assert!(!json.contains("temperature"));
    }

    #[test]
    fn test_is_reasoning_model() {
        assert!(is_reasoning_model("gpt-5-mini"));
        assert!(is_reasoning_model("o1-mini"));
        assert!(is_reasoning_model("o3"));
        assert!(is_reasoning_model("o4-mini"));
        assert!(!is_reasoning_model("gpt-4o-mini"));
        assert!(!is_reasoning_model("gpt-3.5-turbo"));
    }

    #[tokio::test]
    async fn test_translate_success_trims_content() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-openai-key"))
            .and(body_partial_json(serde_json::json!({ "model": "gpt-3.5-turbo" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(create_openai_response("  Hola  \n")),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = backend(&mock_server, "gpt-3.5-turbo")
            .translate("Hello", "en", "es")
            .await
            .expect("Should succeed");

        assert_eq!(result, "Hola");
    }

    #[tokio::test]
    async fn test_translate_empty_choices() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = backend(&mock_server, "gpt-3.5-turbo")
            .translate("Hello", "en", "es")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no choices"));
    }

    #[tokio::test]
    async fn test_translate_retries_on_500_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(create_openai_response("Bonjour")),
            )
            .mount(&mock_server)
            .await;

        let result = backend(&mock_server, "gpt-3.5-turbo")
            .translate("Hello", "en", "fr")
            .await;
        assert_eq!(result.expect("Should succeed after retries"), "Bonjour");
    }

    #[tokio::test]
    async fn test_translate_no_retry_on_401_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error": {"message": "Invalid API key"}}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = backend(&mock_server, "gpt-3.5-turbo")
            .translate("Hello", "en", "fr")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
