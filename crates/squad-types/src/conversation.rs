//! Conversation lifecycle records.
//!
//! A conversation wraps a single `question` message with timeout and
//! escalation tracking. Its audit log (`ConversationEvent`) is append-only
//! and written before the state change becomes externally visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AgentId, ConversationId, EventId, ExecutionId, MessageId};
use crate::time::now_ms;

/// State of a tracked conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Question published, waiting for the responder to acknowledge.
    Initiated,
    /// Responder acknowledged; waiting for the answer.
    Waiting,
    /// A deadline elapsed without the expected reaction.
    Timeout,
    /// A synthetic follow-up was sent; waiting again.
    FollowUp,
    /// Escalation target is being selected.
    Escalating,
    /// Question re-delivered to a more senior responder.
    Escalated,
    /// Answered; terminal.
    Answered,
    /// Cancelled by the asker; terminal.
    Cancelled,
}

impl ConversationState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationState::Answered | ConversationState::Cancelled)
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConversationState::Initiated => "initiated",
            ConversationState::Waiting => "waiting",
            ConversationState::Timeout => "timeout",
            ConversationState::FollowUp => "follow_up",
            ConversationState::Escalating => "escalating",
            ConversationState::Escalated => "escalated",
            ConversationState::Answered => "answered",
            ConversationState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Per-question lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Execution the conversation belongs to.
    pub execution_id: ExecutionId,
    /// The question message that opened the conversation.
    pub initial_message_id: MessageId,
    /// Current lifecycle state.
    pub state: ConversationState,
    /// Agent that asked the question.
    pub asker_id: AgentId,
    /// Agent currently expected to answer; rewritten on escalation.
    pub current_responder_id: AgentId,
    /// Number of escalations performed so far; non-decreasing.
    pub escalation_level: u32,
    /// Deadline driving the next timeout transition.
    pub deadline_at: DateTime<Utc>,
    /// When the responder acknowledged, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set exactly when the conversation reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Synthetic follow-ups sent so far.
    pub follow_ups_sent: u32,
    /// Optimistic concurrency version; bumped on every transition.
    pub version: u64,
}

impl Conversation {
    /// Open a conversation for a question, with the given ack deadline.
    pub fn open(
        execution_id: ExecutionId,
        initial_message_id: MessageId,
        asker_id: AgentId,
        responder_id: AgentId,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConversationId::new(),
            execution_id,
            initial_message_id,
            state: ConversationState::Initiated,
            asker_id,
            current_responder_id: responder_id,
            escalation_level: 0,
            deadline_at,
            acked_at: None,
            created_at: now_ms(),
            closed_at: None,
            follow_ups_sent: 0,
            version: 0,
        }
    }

    /// Check the record invariants: `closed_at` is set iff the state is
    /// terminal.
    pub fn validate(&self) -> Result<(), String> {
        if self.state.is_terminal() != self.closed_at.is_some() {
            return Err(format!(
                "closed_at must be set exactly in terminal states (state={}, closed_at={:?})",
                self.state, self.closed_at
            ));
        }
        Ok(())
    }
}

/// Kind of conversation audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventKind {
    /// Conversation created for a question.
    Created,
    /// Responder acknowledged the question.
    Acknowledged,
    /// A deadline elapsed.
    TimedOut,
    /// Synthetic follow-up sent.
    FollowUpSent,
    /// Escalation target selection started.
    EscalationStarted,
    /// Question re-delivered to the escalation target.
    Escalated,
    /// Terminal escalation: human intervention requested.
    HumanInterventionRequested,
    /// Answer received.
    Answered,
    /// Asker cancelled.
    Cancelled,
}

/// Append-only audit record of a conversation transition.
///
/// Durable before the state change it describes is externally visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    /// Event identifier.
    pub id: EventId,
    /// Conversation the event belongs to.
    pub conversation_id: ConversationId,
    /// Kind of transition.
    pub event_type: ConversationEventKind,
    /// State before the transition; `None` for `Created`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<ConversationState>,
    /// State after the transition.
    pub to_state: ConversationState,
    /// Message that triggered the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Agent that triggered the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_agent_id: Option<AgentId>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl ConversationEvent {
    /// Record a transition event.
    pub fn record(
        conversation_id: ConversationId,
        event_type: ConversationEventKind,
        from_state: Option<ConversationState>,
        to_state: ConversationState,
    ) -> Self {
        Self {
            id: EventId::new(),
            conversation_id,
            event_type,
            from_state,
            to_state,
            message_id: None,
            triggered_by_agent_id: None,
            created_at: now_ms(),
        }
    }

    /// Attach the triggering message, builder-style.
    pub fn with_message(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Attach the triggering agent, builder-style.
    pub fn by_agent(mut self, agent_id: AgentId) -> Self {
        self.triggered_by_agent_id = Some(agent_id);
        self
    }
}

/// Lifecycle notice fanned out on the `conv.{execution_id}.{conversation_id}`
/// subject after a transition commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationNotice {
    /// Execution the conversation belongs to.
    pub execution_id: ExecutionId,
    /// Conversation that transitioned.
    pub conversation_id: ConversationId,
    /// State after the transition.
    pub state: ConversationState,
    /// Escalation level after the transition.
    pub escalation_level: u32,
    /// Agent currently expected to answer.
    pub current_responder_id: AgentId,
    /// When the transition committed.
    pub at: DateTime<Utc>,
}
