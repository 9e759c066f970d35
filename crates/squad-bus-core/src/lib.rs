#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-bus-core** – Core message bus abstraction for the Squad core.
//!
//! This crate provides the bus trait and types every component communicates
//! through: hierarchical subjects with wildcard subscriptions, an
//! at-least-once delivery contract with per-subscription acknowledgement
//! deadlines, publish-side deduplication by message id, and retention by
//! count and age. It ships the in-memory implementation used in tests and
//! single-process deployments; the durable, journal-backed implementation
//! lives in `squad-bus-durable` behind the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use squad_types::{AgentMessage, ConversationNotice, StateChanged};

pub mod guard;
pub mod memory;
pub mod subject;

pub use guard::{GuardVerdict, PublishGuard};
pub use memory::InMemoryBus;
pub use subject::{Subject, SubjectPattern};

//─────────────────────────────
//  Wire envelope
//─────────────────────────────

/// Payload carried by a bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusPayload {
    /// An inter-agent message.
    Agent(AgentMessage),
    /// A conversation lifecycle notice.
    Conversation(ConversationNotice),
    /// A workflow transition notice.
    State(StateChanged),
}

/// A message travelling over the bus.
///
/// `id` is the deduplication key: publishing the same id twice is an
/// acknowledged no-op. For agent messages the id equals the message's own
/// id so publisher retries collapse into one observable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Deduplication key.
    pub id: Uuid,
    /// Subject the message is published on.
    pub subject: Subject,
    /// The payload.
    pub payload: BusPayload,
    /// When the publisher created the envelope.
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    /// Envelope for an inter-agent message, addressed by its routing
    /// fields (inbox subject for point-to-point, broadcast subject
    /// otherwise).
    pub fn agent(message: AgentMessage, subject: Subject) -> Self {
        Self {
            id: message.id.0,
            subject,
            payload: BusPayload::Agent(message),
            published_at: squad_types::time::now_ms(),
        }
    }

    /// Envelope for a conversation lifecycle notice.
    pub fn conversation(notice: ConversationNotice) -> Self {
        let subject = subject::conversation(notice.execution_id, notice.conversation_id);
        Self {
            id: Uuid::new_v4(),
            subject,
            payload: BusPayload::Conversation(notice),
            published_at: squad_types::time::now_ms(),
        }
    }

    /// Envelope for a workflow transition notice.
    pub fn state(change: StateChanged) -> Self {
        let subject = subject::state(change.execution_id);
        Self {
            id: Uuid::new_v4(),
            subject,
            payload: BusPayload::State(change),
            published_at: squad_types::time::now_ms(),
        }
    }

    /// The agent message inside, if this is an agent payload.
    pub fn as_agent(&self) -> Option<&AgentMessage> {
        match &self.payload {
            BusPayload::Agent(msg) => Some(msg),
            _ => None,
        }
    }

    /// Approximate wire size, used for retention accounting.
    pub fn wire_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

//─────────────────────────────
//  Delivery and subscription
//─────────────────────────────

/// Acknowledgement of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Whether the message id had been published before (no-op publish).
    pub duplicate: bool,
}

/// A single delivery handed to a subscriber.
///
/// The subscriber must [`ack`](Delivery::ack) once processing is complete;
/// un-acked deliveries are redelivered after the subscription's ack-wait
/// deadline with an incremented attempt counter.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered message.
    pub message: BusMessage,
    /// 1-based delivery attempt.
    pub attempt: u32,
    acker: Acker,
}

impl Delivery {
    /// Construct a delivery backed by the given acker.
    pub fn new(message: BusMessage, attempt: u32, acker: Acker) -> Self {
        Self {
            message,
            attempt,
            acker,
        }
    }

    /// Acknowledge the delivery, removing it from the redelivery window.
    pub fn ack(self) {
        self.acker.ack();
    }
}

/// Callback removing a delivery from its subscription's pending set.
pub struct Acker(Box<dyn FnOnce() + Send>);

impl Acker {
    /// Wrap an acknowledgement callback.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    fn ack(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Acker")
    }
}

/// A pull-based subscription stream.
pub struct Subscription {
    durable_name: String,
    rx: tokio::sync::mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Construct a subscription from its receiving half.
    pub fn new(durable_name: String, rx: tokio::sync::mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { durable_name, rx }
    }

    /// Durable name this subscription is registered under.
    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    /// Wait for the next delivery. Returns `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a delivery.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

//─────────────────────────────
//  Configuration and stats
//─────────────────────────────

/// Retention and delivery tuning for a bus instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Stream name reported in [`BusStats`].
    pub stream_name: String,
    /// Retain at most this many messages.
    pub retention_messages: usize,
    /// Retain messages at most this long.
    #[serde(with = "squad_types::time::serde_secs")]
    pub retention_age: Duration,
    /// Redeliver un-acked deliveries after this long.
    #[serde(with = "squad_types::time::serde_secs")]
    pub ack_wait: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream_name: "agent-messages".to_string(),
            retention_messages: 1_000_000,
            retention_age: Duration::from_secs(7 * 24 * 3600),
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Observability counters exposed by a bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages currently retained.
    pub messages_stored: usize,
    /// Approximate bytes currently retained.
    pub bytes_stored: usize,
    /// Live subscriptions.
    pub subscribers: usize,
    /// Streams backing the bus.
    pub stream_count: usize,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Persistence could not be confirmed within the ack timeout; the
    /// caller must retry with the same message id.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// A registered publish guard suppressed the message.
    #[error("message rejected by publish guard: {reason}")]
    Rejected {
        /// Machine-readable rejection reason.
        reason: String,
    },
    /// The message failed structural validation.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The subscription pattern or durable name is invalid.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
}

impl squad_types::Classify for BusError {
    fn class(&self) -> squad_types::ErrorClass {
        match self {
            BusError::Unavailable(_) => squad_types::ErrorClass::Transient,
            BusError::Rejected { .. } | BusError::Malformed(_) | BusError::InvalidSubscription(_) => {
                squad_types::ErrorClass::Permanent
            }
        }
    }
}

//─────────────────────────────
//  The bus trait
//─────────────────────────────

/// Persistent pub/sub of orchestration traffic.
///
/// Delivery is at-least-once: messages are durably stored before the
/// publish acknowledgement, subscribers must ack each delivery, and
/// deduplication happens on the publish side by message id (and again in
/// idempotent consumers). Ordering is per-subject FIFO; no global order is
/// guaranteed.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message. Returns once the message is durably stored (or
    /// recognized as a duplicate).
    async fn publish(&self, message: BusMessage) -> Result<PublishAck, BusError>;

    /// Subscribe with a wildcard pattern under a durable name.
    ///
    /// Re-subscribing with the same durable name reattaches to the
    /// subscription's pending (un-acked) deliveries.
    async fn subscribe(
        &self,
        pattern: SubjectPattern,
        durable_name: &str,
    ) -> Result<Subscription, BusError>;

    /// Register a guard consulted before any message is stored.
    fn register_guard(&self, guard: Arc<dyn PublishGuard>);

    /// Current observability counters.
    async fn stats(&self) -> BusStats;
}
