use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("llm call timed out: {0}")]
    Timeout(String),

    #[error("llm rate limited: {0}")]
    RateLimited(String),

    #[error("llm provider unavailable: {0}")]
    Unavailable(String),

    #[error("llm rejected request: {0}")]
    InvalidRequest(String),

    #[error("llm refused content: {0}")]
    PolicyRejected(String),

    #[error("invalid llm model: {0}")]
    InvalidModel(String),

    #[error("llm provider not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    /// Timeouts, rate limits and provider outages may succeed on retry.
    /// Everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::RateLimited(_) | LlmError::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(LlmError::Timeout("t".into()).is_transient());
        assert!(LlmError::RateLimited("429".into()).is_transient());
        assert!(LlmError::Unavailable("503".into()).is_transient());

        assert!(!LlmError::InvalidRequest("400".into()).is_transient());
        assert!(!LlmError::PolicyRejected("policy".into()).is_transient());
        assert!(!LlmError::InvalidModel("404".into()).is_transient());
        assert!(!LlmError::NotConfigured("gemini".into()).is_transient());
    }
}
