//! Durable per-agent conversational memory.
//!
//! A session is the unit of restart durability: it holds the ordered turn
//! list the model sees plus the idempotency ledger (which inbox messages
//! were processed and which replies are still awaiting publication).
//! Sessions are lazily created on first use, survive process restarts, and
//! are never deleted by the core.
//!
//! The blob format is MessagePack; a blob that fails to decode surfaces as
//! `SessionCorrupted` rather than silently starting fresh.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use squad_types::{AgentId, AgentMessage, MessageId, SessionId};

use crate::{AgentResult, AgentRuntimeError};

/// Author of a session turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// Input handed to the agent.
    User,
    /// Output produced by the agent.
    Assistant,
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTurn {
    /// Who authored the turn.
    pub role: TurnRole,
    /// Turn text.
    pub content: String,
    /// When the turn was recorded.
    pub at: DateTime<Utc>,
}

impl SessionTurn {
    /// A user-authored turn stamped now.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            at: squad_types::time::now_ms(),
        }
    }

    /// An assistant-authored turn stamped now.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            at: squad_types::time::now_ms(),
        }
    }
}

/// Persistent per-agent conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub session_id: SessionId,
    /// Agent that owns the session.
    pub agent_id: AgentId,
    /// Ordered conversational turns.
    pub turns: Vec<SessionTurn>,
    /// Inbox messages already processed, mapped to the reply produced for
    /// each (the idempotency ledger).
    pub processed: BTreeMap<MessageId, Option<MessageId>>,
    /// Replies recorded but not yet confirmed published.
    pub outbox: Vec<AgentMessage>,
}

impl Session {
    /// Create an empty session for an agent.
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            session_id: SessionId::new(),
            agent_id,
            turns: Vec::new(),
            processed: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    /// Encode the session to its blob format.
    pub fn encode(&self) -> AgentResult<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| AgentRuntimeError::SessionStorage(e.to_string()))
    }

    /// Decode a session blob.
    pub fn decode(blob: &[u8]) -> AgentResult<Self> {
        rmp_serde::from_slice(blob).map_err(|e| AgentRuntimeError::SessionCorrupted(e.to_string()))
    }

    /// Whether an inbox message was already processed.
    pub fn already_processed(&self, message_id: MessageId) -> bool {
        self.processed.contains_key(&message_id)
    }

    /// The still-unpublished reply recorded for an inbox message, if any.
    pub fn pending_reply(&self, message_id: MessageId) -> Option<&AgentMessage> {
        let reply_id = self.processed.get(&message_id).copied().flatten()?;
        self.outbox.iter().find(|m| m.id == reply_id)
    }

    /// Drop a reply from the outbox once its publication is confirmed.
    pub fn confirm_published(&mut self, reply_id: MessageId) {
        self.outbox.retain(|m| m.id != reply_id);
    }
}

//─────────────────────────────
//  Store
//─────────────────────────────

/// Durable session storage keyed by session id.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session, if it exists.
    async fn load(&self, session_id: SessionId) -> AgentResult<Option<Session>>;

    /// Persist a session.
    async fn save(&self, session: &Session) -> AgentResult<()>;
}

/// In-memory session store holding encoded blobs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    blobs: DashMap<SessionId, Vec<u8>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: SessionId) -> AgentResult<Option<Session>> {
        match self.blobs.get(&session_id) {
            Some(blob) => Ok(Some(Session::decode(&blob)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> AgentResult<()> {
        self.blobs.insert(session.session_id, session.encode()?);
        Ok(())
    }
}
