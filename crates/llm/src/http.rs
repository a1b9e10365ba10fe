//! OpenAI-compatible chat-completions client.
//!
//! Both providers are reached through the same request shape; Gemini is
//! addressed via its OpenAI-compatible endpoint. Only the base URL, key, and
//! default model differ per provider.
//!
//! ## Status mapping
//!
//! | HTTP / transport | LlmError |
//! |---|---|
//! | timeout, 408 | `Timeout` |
//! | 429 | `RateLimited` |
//! | 5xx, connection failure | `Unavailable` |
//! | 404 | `InvalidModel` |
//! | 400 with a content-policy code | `PolicyRejected` |
//! | other 4xx | `InvalidRequest` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use demandflow_core::{LlmConfig, LlmProvider, TokenUsage};

use crate::client::{LlmClient, LlmResponse};
use crate::error::LlmError;
use crate::prompt::Prompt;

/// Where and how to reach one provider.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl ProviderEndpoint {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            default_model: default_model.into(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    openai: ProviderEndpoint,
    gemini: ProviderEndpoint,
}

impl HttpLlmClient {
    /// `request_timeout` bounds a single HTTP exchange, independently of any
    /// per-attempt timeout the caller applies.
    pub fn new(
        openai: ProviderEndpoint,
        gemini: ProviderEndpoint,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            http,
            openai,
            gemini,
        })
    }

    fn endpoint(&self, provider: LlmProvider) -> &ProviderEndpoint {
        match provider {
            LlmProvider::OpenAi => &self.openai,
            LlmProvider::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn build_request<'a>(prompt: &'a Prompt, config: &LlmConfig, model: &'a str) -> ChatRequest<'a> {
    let mut messages = vec![
        ChatMessage {
            role: "system",
            content: &prompt.system,
        },
        ChatMessage {
            role: "user",
            content: &prompt.user,
        },
    ];
    if let Some(assistant) = prompt.assistant.as_deref() {
        messages.push(ChatMessage {
            role: "assistant",
            content: assistant,
        });
    }
    ChatRequest {
        model,
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        top_p: config.top_p,
    }
}

fn classify_status(status: StatusCode, body: &str) -> LlmError {
    let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
    match status {
        StatusCode::REQUEST_TIMEOUT => LlmError::Timeout(detail),
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(detail),
        StatusCode::NOT_FOUND => LlmError::InvalidModel(detail),
        s if s.is_server_error() => LlmError::Unavailable(detail),
        StatusCode::BAD_REQUEST if body.contains("content_policy") || body.contains("SAFETY") => {
            LlmError::PolicyRejected(detail)
        }
        _ => LlmError::InvalidRequest(detail),
    }
}

fn classify_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(err.to_string())
    } else {
        LlmError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    #[instrument(skip(self, prompt, config), fields(provider = %config.provider), err)]
    async fn generate(&self, prompt: &Prompt, config: &LlmConfig) -> Result<LlmResponse, LlmError> {
        let endpoint = self.endpoint(config.provider);
        let api_key = endpoint
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::NotConfigured(format!("no api key for {}", config.provider)))?;
        let model = config.model.as_deref().unwrap_or(&endpoint.default_model);

        let response = self
            .http
            .post(endpoint.completions_url())
            .bearer_auth(api_key)
            .json(&build_request(prompt, config, model))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                LlmError::InvalidRequest(format!("unexpected response body: {e}"))
            } else {
                classify_transport(e)
            }
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidRequest("response had no content".to_string()))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        debug!(model, total_tokens = usage.total(), "completion received");

        Ok(LlmResponse::new(text, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_retry_classes() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());

        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "model does not exist"),
            LlmError::InvalidModel(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, r#"{"code":"content_policy_violation"}"#),
            LlmError::PolicyRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            LlmError::InvalidRequest(_)
        ));
    }

    #[test]
    fn request_body_includes_optional_assistant_and_top_p() {
        let prompt = Prompt {
            system: "sys".into(),
            user: "usr".into(),
            assistant: Some("asst".into()),
        };
        let config = LlmConfig {
            top_p: Some(0.9),
            ..LlmConfig::default()
        };
        let body = serde_json::to_value(build_request(&prompt, &config, "gpt")).unwrap();
        assert_eq!(body["model"], "gpt");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["max_tokens"], 1000);
        assert!(body.get("top_p").is_some());

        let plain = serde_json::to_value(build_request(
            &Prompt { assistant: None, ..prompt },
            &LlmConfig::default(),
            "gpt",
        ))
        .unwrap();
        assert!(plain.get("top_p").is_none());
    }

    #[tokio::test]
    async fn missing_api_key_is_a_permanent_error() {
        let client = HttpLlmClient::new(
            ProviderEndpoint::new("http://127.0.0.1:9", "gpt"),
            ProviderEndpoint::new("http://127.0.0.1:9", "gemini-pro"),
            Duration::from_secs(1),
        )
        .unwrap();
        let prompt = Prompt {
            system: "s".into(),
            user: "u".into(),
            assistant: None,
        };
        let err = client.generate(&prompt, &LlmConfig::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured(_)));
    }
}
