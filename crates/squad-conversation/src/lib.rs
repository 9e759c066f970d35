#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-conversation** – Per-question lifecycle tracking.
//!
//! Every `question` published on the bus is wrapped in a [`Conversation`]
//! that drives acknowledgement deadlines, synthetic follow-ups and
//! escalation up the role hierarchy, ending in a `human_intervention_required`
//! message when the ladder is exhausted. Each transition is written to the
//! append-only [`ConversationEvent`](squad_types::ConversationEvent) log and
//! applied to the conversation row in one atomic, version-checked update,
//! then fanned out on the `conv.{execution_id}.{conversation_id}` subject.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use squad_types::{AgentId, ConversationId, MessageId};

pub mod store;
mod tracker;

pub use squad_types::Roster;
pub use store::{ConversationStore, MemoryConversationStore};
pub use tracker::ConversationTracker;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning knobs of the conversation tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// How long the responder has to acknowledge a question.
    #[serde(with = "squad_types::time::serde_secs")]
    pub ack_timeout: Duration,
    /// How long an acknowledged question may stay unanswered.
    #[serde(with = "squad_types::time::serde_secs")]
    pub answer_timeout: Duration,
    /// Escalation level at which a human is pulled in instead of another
    /// agent.
    pub max_escalation: u32,
    /// Synthetic follow-ups sent before escalating. Zero escalates straight
    /// from the first timeout.
    pub max_follow_ups: u32,
    /// Deadline sweep resolution.
    #[serde(with = "squad_types::time::serde_secs")]
    pub tick_interval: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            answer_timeout: Duration::from_secs(600),
            max_escalation: 2,
            max_follow_ups: 1,
            tick_interval: Duration::from_secs(1),
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by conversation tracking.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// No conversation with the given id exists.
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    /// A conversation for this initial message already exists.
    #[error("conversation for initial message {0} already exists")]
    DuplicateInitialMessage(MessageId),
    /// The optimistic version check failed; the caller should re-read and
    /// retry.
    #[error("version conflict on conversation {conversation_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Conversation that was concurrently modified.
        conversation_id: ConversationId,
        /// Version the writer expected.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },
    /// Only the asker may cancel a conversation.
    #[error("agent {agent_id} is not the asker of conversation {conversation_id}")]
    NotAsker {
        /// Conversation targeted by the cancel.
        conversation_id: ConversationId,
        /// Agent that attempted the cancel.
        agent_id: AgentId,
    },
    /// The conversation is already terminal.
    #[error("conversation {0} is closed")]
    AlreadyClosed(ConversationId),
    /// The backing store failed.
    #[error("conversation store error: {0}")]
    Storage(String),
}

impl squad_types::Classify for ConversationError {
    fn class(&self) -> squad_types::ErrorClass {
        match self {
            ConversationError::VersionConflict { .. } | ConversationError::Storage(_) => {
                squad_types::ErrorClass::Transient
            }
            _ => squad_types::ErrorClass::Permanent,
        }
    }
}

/// Convenience alias for conversation results.
pub type ConversationResult<T> = Result<T, ConversationError>;
