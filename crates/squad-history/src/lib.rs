#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-history** – Durable append-only journal of orchestration traffic.
//!
//! Every agent message and every workflow transition is journalled here
//! before it becomes observable on the bus, so anything a subscriber has
//! ever seen can be re-fetched in order. Retrieval is ordered by the
//! `(created_at, id)` tuple; `created_at` comes from a monotonic server
//! clock so ties cannot occur within one process and the id breaks ties
//! across processes.
//!
//! The store never rewrites entries; retention, when configured, is by
//! deletion only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use squad_types::{
    AgentId, AgentMessage, ConversationId, EventId, ExecutionId, StateChanged,
};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryHistory;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHistory;

//─────────────────────────────
//  Journal entries
//─────────────────────────────

/// Payload of a journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryPayload {
    /// An inter-agent message.
    Message(AgentMessage),
    /// A workflow transition.
    StateChange(StateChanged),
}

/// One journalled record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Entry identifier; for messages this equals the message id so that
    /// journal retries deduplicate.
    pub id: EventId,
    /// Execution the entry belongs to.
    pub execution_id: ExecutionId,
    /// Journal timestamp from the monotonic clock; the primary sort key.
    pub created_at: DateTime<Utc>,
    /// The journalled payload.
    pub payload: HistoryPayload,
}

impl HistoryEntry {
    /// Journal entry for an agent message.
    pub fn message(message: AgentMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId(message.id.0),
            execution_id: message.execution_id,
            created_at,
            payload: HistoryPayload::Message(message),
        }
    }

    /// Journal entry for a workflow transition.
    pub fn state_change(change: StateChanged, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            execution_id: change.execution_id,
            created_at,
            payload: HistoryPayload::StateChange(change),
        }
    }

    /// The message inside, if this is a message entry.
    pub fn as_message(&self) -> Option<&AgentMessage> {
        match &self.payload {
            HistoryPayload::Message(msg) => Some(msg),
            _ => None,
        }
    }

    /// Sort key of the entry.
    pub fn sort_key(&self) -> (DateTime<Utc>, EventId) {
        (self.created_at, self.id)
    }
}

//─────────────────────────────
//  Queries
//─────────────────────────────

/// Cursor pointing just after a previously seen entry.
pub type HistoryCursor = (DateTime<Utc>, EventId);

/// Filtered, ordered retrieval request.
///
/// Filters combine conjunctively. The `since` cursor is exclusive, so the
/// entry it names is not returned again.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Only entries of this execution.
    pub execution_id: Option<ExecutionId>,
    /// Only messages sent by or addressed to this agent.
    pub agent_id: Option<AgentId>,
    /// Only messages of this conversation.
    pub conversation_id: Option<ConversationId>,
    /// Only entries strictly after this cursor.
    pub since: Option<HistoryCursor>,
    /// At most this many entries.
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Query every entry of one execution.
    pub fn execution(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Self::default()
        }
    }

    /// Query messages touching one agent.
    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }

    /// Query messages of one conversation.
    pub fn conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::default()
        }
    }

    /// Restrict to entries after the cursor, builder-style.
    pub fn since(mut self, cursor: HistoryCursor) -> Self {
        self.since = Some(cursor);
        self
    }

    /// Cap the result size, builder-style.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the entry passes the query's filters (cursor and limit not
    /// included).
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(execution_id) = self.execution_id {
            if entry.execution_id != execution_id {
                return false;
            }
        }
        if let Some(agent_id) = self.agent_id {
            match entry.as_message() {
                Some(msg) => {
                    if msg.sender_id != agent_id && msg.recipient_id != Some(agent_id) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(conversation_id) = self.conversation_id {
            match entry.as_message() {
                Some(msg) => {
                    if msg.conversation_id != Some(conversation_id) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by history operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The backing store did not answer within its deadline.
    #[error("history I/O timeout: {0}")]
    IoTimeout(String),
    /// The backing store failed.
    #[error("history storage error: {0}")]
    Storage(String),
    /// A stored entry could not be decoded.
    #[error("corrupt history entry: {0}")]
    Corrupt(String),
}

impl squad_types::Classify for HistoryError {
    fn class(&self) -> squad_types::ErrorClass {
        match self {
            HistoryError::IoTimeout(_) | HistoryError::Storage(_) => {
                squad_types::ErrorClass::Transient
            }
            HistoryError::Corrupt(_) => squad_types::ErrorClass::Permanent,
        }
    }
}

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Append-only, ordered journal.
///
/// The journal never rewrites entries; the only mutation besides `append`
/// is retention by deletion, driven by an operator-configured
/// per-execution TTL.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append an entry. Appending an entry whose id already exists is a
    /// no-op, which makes journal retries safe.
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError>;

    /// Retrieve entries matching the query, ordered by `(created_at, id)`.
    async fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, HistoryError>;

    /// Delete entries of one execution journalled before `cutoff`.
    /// Returns the number of deleted entries.
    async fn prune(
        &self,
        execution_id: ExecutionId,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, HistoryError>;
}

//─────────────────────────────
//  Monotonic clock
//─────────────────────────────

/// Strictly increasing wall-clock source for journal timestamps.
///
/// If the operating-system clock stalls or steps backwards, consecutive
/// reads still advance by at least one millisecond.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    /// Create a clock with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next journal timestamp.
    pub async fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().await;
        let mut now = squad_types::time::now_ms();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::milliseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now().await;
        for _ in 0..100 {
            let next = clock.now().await;
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn query_filters_compose() {
        let exec = ExecutionId::new();
        let sender = AgentId::new();
        let recipient = AgentId::new();
        let msg = AgentMessage::direct(
            exec,
            sender,
            recipient,
            squad_types::MessageType::Question,
            "what port?",
        );
        let entry = HistoryEntry::message(msg, squad_types::time::now_ms());

        assert!(HistoryQuery::execution(exec).matches(&entry));
        assert!(!HistoryQuery::execution(ExecutionId::new()).matches(&entry));
        assert!(HistoryQuery::agent(sender).matches(&entry));
        assert!(HistoryQuery::agent(recipient).matches(&entry));
        assert!(!HistoryQuery::agent(AgentId::new()).matches(&entry));
        assert!(!HistoryQuery::conversation(ConversationId::new()).matches(&entry));
    }
}
