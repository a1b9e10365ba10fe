//! Deterministic client for tests and local runs without a provider.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use demandflow_core::{LlmConfig, TokenUsage};

use crate::client::{LlmClient, LlmResponse};
use crate::error::LlmError;
use crate::prompt::Prompt;

/// Replays a scripted sequence of outcomes, one per call.
///
/// Once the script runs out, every call returns the fallback (if set) or an
/// `InvalidRequest` error.
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    fallback: Option<Result<LlmResponse, LlmError>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            fallback: Some(Ok(LlmResponse::new(text, TokenUsage::new(10, 20)))),
            ..Self::default()
        }
    }

    /// Always fail with `error`.
    pub fn always_failing(error: LlmError) -> Self {
        Self {
            fallback: Some(Err(error)),
            ..Self::default()
        }
    }

    pub fn then_ok(self, text: impl Into<String>) -> Self {
        self.then(Ok(LlmResponse::new(text, TokenUsage::new(10, 20))))
    }

    pub fn then_err(self, error: LlmError) -> Self {
        self.then(Err(error))
    }

    pub fn then(self, outcome: Result<LlmResponse, LlmError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `generate` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, prompt: &Prompt, _config: &LlmConfig) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(outcome) => outcome,
            None => self
                .fallback
                .clone()
                .unwrap_or_else(|| Err(LlmError::InvalidRequest("script exhausted".to_string()))),
        }
    }
}
