use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid model configuration: {0}")]
    Configuration(String),

    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
