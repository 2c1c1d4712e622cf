//! LLM collaborator boundary.
//!
//! No concrete vendor client is implemented here — that integration lives
//! outside the coordination core. `LlmAdapter` is the seam the intent
//! router calls through for general-query fallback replies; production
//! wiring supplies a real HTTP-backed adapter, tests supply
//! `DeterministicLlmAdapter`.

use async_trait::async_trait;

use crate::error::CoordinatorError;

/// Text-completion boundary used by the chat orchestrator's general-query
/// fallback path.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Completes `prompt`, returning the model's response text.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Coordination` if the underlying call fails.
    async fn complete(&self, prompt: &str) -> Result<String, CoordinatorError>;
}

/// A deterministic stand-in used by orchestrator tests: echoes a canned
/// reply derived from the prompt so assertions can check routing and
/// persistence behavior without a live model.
#[derive(Debug, Default)]
pub struct DeterministicLlmAdapter {
    canned_reply: Option<String>,
}

impl DeterministicLlmAdapter {
    /// An adapter that always answers with a fixed string.
    #[must_use]
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self { canned_reply: Some(reply.into()) }
    }
}

#[async_trait]
impl LlmAdapter for DeterministicLlmAdapter {
    async fn complete(&self, prompt: &str) -> Result<String, CoordinatorError> {
        Ok(self
            .canned_reply
            .clone()
            .unwrap_or_else(|| format!("Here's what I can tell you about that: {prompt}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_adapter_echoes_the_prompt() {
        let adapter = DeterministicLlmAdapter::default();
        let reply = adapter.complete("what's trending in home goods?").await.unwrap();
        assert!(reply.contains("home goods"));
    }

    #[tokio::test]
    async fn fixed_reply_adapter_ignores_the_prompt() {
        let adapter = DeterministicLlmAdapter::with_reply("canned answer");
        assert_eq!(adapter.complete("anything").await.unwrap(), "canned answer");
    }
}
