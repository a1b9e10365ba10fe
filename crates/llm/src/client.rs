use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use demandflow_core::{LlmConfig, TokenUsage};

use crate::error::LlmError;
use crate::prompt::Prompt;

/// A completion returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// Generates a completion for an assembled prompt.
///
/// One call is one attempt; retries and timeouts are the caller's concern.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &Prompt, config: &LlmConfig) -> Result<LlmResponse, LlmError>;
}
