#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-agent-runtime** – Per-agent execution loop.
//!
//! Each agent is a cooperative unit with an injected capability set: an
//! opaque [`LanguageModel`] for reasoning, a [`ToolRegistry`] for external
//! actions, the message bus for communication and a [`SessionStore`] for
//! durable conversational memory.
//!
//! An agent processes one message at a time; multiple agents run in
//! parallel as independent tasks. Restart durability comes from the
//! session, not from re-reading message history: a reply is recorded in
//! the session *before* its first publish, so a crash between processing
//! and publishing resolves to an idempotent republish under the original
//! message id.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use squad_bus_core::BusError;
use squad_types::Classify;

mod llm;
mod session;
mod tools;
mod worker;

pub use llm::{CompletionRequest, CompletionResponse, LanguageModel, TokenUsage};
#[cfg(any(test, feature = "testing"))]
pub use llm::ScriptedModel;
pub use session::{MemorySessionStore, Session, SessionStore, SessionTurn, TurnRole};
pub use tools::{Tool, ToolRegistry};
pub use worker::{AgentSubscriptions, AgentWorker};

/// Default deadline for a single `process_message` call.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(300);

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Backoff policy applied to transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries per operation.
    pub max_retries: u32,
    /// Base delay between retries.
    #[serde(with = "squad_types::time::serde_secs")]
    pub base_delay: Duration,
    /// Upper bound on the delay.
    #[serde(with = "squad_types::time::serde_secs")]
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.base_delay.mul_f64(factor.max(1.0));
        delay.min(self.max_delay)
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by agent execution.
#[derive(Debug, thiserror::Error)]
pub enum AgentRuntimeError {
    /// The language model could not be reached.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),
    /// The language model rejected the request for rate reasons.
    #[error("LLM rate limited: {0}")]
    LlmRateLimited(String),
    /// A tool call failed.
    #[error("tool '{tool}' failed: {reason}")]
    ToolFailure {
        /// Tool that failed.
        tool: String,
        /// Failure description.
        reason: String,
    },
    /// The requested tool is not registered.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    /// The stored session blob could not be decoded.
    #[error("session corrupted: {0}")]
    SessionCorrupted(String),
    /// The session store failed.
    #[error("session store error: {0}")]
    SessionStorage(String),
    /// Processing exceeded its deadline; nothing was persisted.
    #[error("processing deadline exceeded")]
    DeadlineExceeded,
    /// Bus interaction failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl squad_types::Classify for AgentRuntimeError {
    fn class(&self) -> squad_types::ErrorClass {
        use squad_types::ErrorClass;
        match self {
            AgentRuntimeError::LlmUnavailable(_)
            | AgentRuntimeError::LlmRateLimited(_)
            | AgentRuntimeError::SessionStorage(_)
            | AgentRuntimeError::DeadlineExceeded => ErrorClass::Transient,
            AgentRuntimeError::SessionCorrupted(_) | AgentRuntimeError::UnknownTool(_) => {
                ErrorClass::Permanent
            }
            AgentRuntimeError::ToolFailure { .. } => ErrorClass::External,
            AgentRuntimeError::Bus(e) => e.class(),
        }
    }
}

/// Result type for agent runtime operations.
pub type AgentResult<T> = Result<T, AgentRuntimeError>;
