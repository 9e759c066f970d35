//! The opaque reasoning capability.
//!
//! The core never interprets model output; it routes text in, text out.
//! Production providers live outside this repository and implement
//! [`LanguageModel`]; tests use [`ScriptedModel`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::SessionTurn;
use crate::AgentResult;

/// A completion request handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// System prompt of the requesting agent.
    pub system_prompt: String,
    /// Prior conversational turns, oldest first.
    pub history: Vec<SessionTurn>,
    /// The new input to reason about.
    pub input: String,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
}

/// A completion produced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub content: String,
    /// Token usage, if the provider reports it.
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Opaque `think(prompt, context) -> text` capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produce a completion for the request.
    async fn complete(&self, request: CompletionRequest) -> AgentResult<CompletionResponse>;
}

/// Deterministic model double for tests.
///
/// Responses are served from a FIFO queue; once the queue is empty every
/// input is answered with an `ok:`-prefixed echo.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct ScriptedModel {
    responses: tokio::sync::Mutex<std::collections::VecDeque<String>>,
    requests: tokio::sync::Mutex<Vec<CompletionRequest>>,
}

#[cfg(any(test, feature = "testing"))]
impl ScriptedModel {
    /// Create a model with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next scripted response.
    pub async fn push(&self, response: impl Into<String>) {
        self.responses.lock().await.push_back(response.into());
    }

    /// Requests observed so far, oldest first.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> AgentResult<CompletionResponse> {
        self.requests.lock().await.push(request.clone());
        let content = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| format!("ok: {}", request.input));
        Ok(CompletionResponse {
            content,
            usage: TokenUsage::default(),
        })
    }
}
