//! Provider contract.

use async_trait::async_trait;

use crate::errors::LlmError;
use crate::types::{ModelRequest, ModelResponse};

/// One model backend. Implementations adapt a concrete provider client to
/// the engine's generate capability and must be safe to share across turns.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, LlmError>;
}
