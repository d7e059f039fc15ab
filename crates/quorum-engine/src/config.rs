use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::EngineError;
use crate::catalog::ToolResource;

/// Identifier of one configuration/code snapshot. Tool isolation and
/// effective-config loading are both scoped by this value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionRef(String);

impl RevisionRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Conventional form for git-backed revisions.
    pub fn from_commit(sha: &str) -> Self {
        Self(format!("git:{sha}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Per-step view of the active configuration, produced by a [`ConfigLoader`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub revision: RevisionRef,
    pub model: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<ToolResource>,
}

impl EffectiveConfig {
    pub fn required_tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|resource| resource.required)
            .map(|resource| resource.name.clone())
            .collect()
    }
}

/// Collaborator contract: resolves the active revision pointer and loads the
/// effective configuration for one agent at one revision.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn active_revision(&self) -> Result<RevisionRef, EngineError>;

    async fn load(
        &self,
        revision: &RevisionRef,
        agent_name: &str,
    ) -> Result<EffectiveConfig, EngineError>;
}

/// Fixed-config loader. The active revision can still be advanced, which is
/// how changeset commits become visible to subsequent steps.
pub struct StaticConfigLoader {
    active: Mutex<RevisionRef>,
    config: EffectiveConfig,
}

impl StaticConfigLoader {
    pub fn new(config: EffectiveConfig) -> Self {
        Self {
            active: Mutex::new(config.revision.clone()),
            config,
        }
    }

    pub fn advance(&self, revision: RevisionRef) {
        if let Ok(mut active) = self.active.lock() {
            *active = revision;
        }
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn active_revision(&self) -> Result<RevisionRef, EngineError> {
        self.active
            .lock()
            .map(|active| active.clone())
            .map_err(|_| EngineError::InvalidConfiguration("active revision poisoned".to_string()))
    }

    async fn load(
        &self,
        revision: &RevisionRef,
        _agent_name: &str,
    ) -> Result<EffectiveConfig, EngineError> {
        let mut config = self.config.clone();
        config.revision = revision.clone();
        Ok(config)
    }
}

/// Engine-wide limits and defaults.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Hard ceiling on steps per turn; reaching it synthesizes a
    /// limit-reached response.
    pub max_steps_per_turn: usize,
    /// Default cap on tool error messages, overridable per tool resource.
    pub error_message_limit: usize,
    /// Worker-generation pool size before LRU eviction starts.
    pub max_worker_generations: usize,
    /// Dispatch tool calls through per-revision worker tasks.
    pub isolate_tools: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_turn: 32,
            error_message_limit: 1000,
            max_worker_generations: 4,
            isolate_tools: true,
        }
    }
}

pub type SharedConfigLoader = Arc<dyn ConfigLoader>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps_per_turn, 32);
        assert_eq!(config.error_message_limit, 1000);
        assert_eq!(config.max_worker_generations, 4);
        assert!(config.isolate_tools);
    }

    #[test]
    fn revision_ref_commit_form() {
        let revision = RevisionRef::from_commit("abc123");
        assert_eq!(revision.as_str(), "git:abc123");
    }

    #[tokio::test]
    async fn static_loader_advances_active_revision() {
        let loader = StaticConfigLoader::new(EffectiveConfig {
            revision: RevisionRef::from_commit("aaa"),
            model: "stub".to_string(),
            system_prompt: "You are a test agent.".to_string(),
            tools: vec![],
        });
        loader.advance(RevisionRef::from_commit("bbb"));
        let active = loader.active_revision().await.expect("active revision");
        assert_eq!(active.as_str(), "git:bbb");
    }
}
