#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-stream** – Multiplexed event fanout to external observers.
//!
//! UIs and dashboards attach one long-lived subscription per
//! `(scope, id)` pair and receive framed events: normalized agent messages,
//! workflow transitions, conversation notices, progress refreshes and
//! heartbeats. Delivery is best-effort and in-order per subscriber; a
//! subscriber that falls behind its bounded buffer is cut off with a
//! `lagged` error frame and must backfill from the history store. A
//! per-scope replay ring serves `since_id` reconnects that are still inside
//! the buffer window.
//!
//! End-user subscriptions see only public messages from the project manager
//! and tech lead; internal agent-to-agent traffic never leaves the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use squad_types::{
    AgentId, AgentMessage, ConversationId, ConversationState, ExecutionId, SquadId,
    SubscriberId, WorkflowState,
};

mod broadcaster;

pub use broadcaster::{StreamBroadcaster, StreamSubscription};

//─────────────────────────────
//  Scopes and audiences
//─────────────────────────────

/// What a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum StreamScope {
    /// Every event of one task execution.
    Execution(ExecutionId),
    /// Every event of every execution run by one squad.
    Squad(SquadId),
}

/// Trust level of a subscriber, driving the visibility filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Operators and internal tooling; sees everything in scope.
    Operator,
    /// End users; sees only public traffic from the squad leadership.
    EndUser,
}

//─────────────────────────────
//  Events and frames
//─────────────────────────────

/// Event payload delivered to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First frame of every subscription.
    Connected {
        /// Identity assigned to the subscriber.
        subscriber_id: SubscriberId,
        /// Scope subscribed to.
        scope: StreamScope,
        /// Resume cursor the subscriber presented, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },
    /// A normalized agent message (visibility-filtered).
    Message(AgentMessage),
    /// A workflow transition.
    StateChanged {
        /// Execution that transitioned.
        execution_id: ExecutionId,
        /// State before.
        from: WorkflowState,
        /// State after.
        to: WorkflowState,
        /// Progress after the transition.
        progress_pct: u8,
        /// Agent that triggered the transition.
        actor_id: AgentId,
    },
    /// A conversation lifecycle change.
    Conversation {
        /// Conversation that changed.
        conversation_id: ConversationId,
        /// New state.
        state: ConversationState,
        /// Escalation level after the change.
        escalation_level: u32,
    },
    /// Periodic progress refresh.
    Progress {
        /// Execution the progress belongs to.
        execution_id: ExecutionId,
        /// Current progress percentage.
        progress_pct: u8,
    },
    /// Free-form structured log entry from an agent.
    Log(serde_json::Value),
    /// Terminal outcome of an execution.
    Completed {
        /// Execution that finished.
        execution_id: ExecutionId,
        /// `completed` or `failed`.
        outcome: String,
        /// When it finished.
        completed_at: DateTime<Utc>,
    },
    /// Stream-level error; `lagged` precedes a forced close.
    Error {
        /// Machine-readable error code.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// Liveness signal, sent every heartbeat interval.
    Heartbeat,
}

/// A framed event as sent over the wire.
///
/// Frame ids increase monotonically per scope. Heartbeat and error frames
/// repeat the latest assigned id instead of consuming a new one, so a
/// client can always resume with the id of the last frame it saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Per-scope sequence number.
    pub id: u64,
    /// The event.
    pub event: StreamEvent,
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning knobs of the broadcast stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Interval between heartbeat frames.
    #[serde(with = "squad_types::time::serde_secs")]
    pub heartbeat_interval: std::time::Duration,
    /// Per-subscriber buffer and replay-ring size.
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: std::time::Duration::from_secs(15),
            buffer_size: 256,
        }
    }
}
