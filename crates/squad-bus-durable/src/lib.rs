#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-bus-durable** – Write-ahead journaled bus.
//!
//! Wraps any [`MessageBus`] so that every agent message and workflow
//! transition is appended to the [`HistoryStore`] *before* the publish is
//! acknowledged. Anything observable via the bus is therefore retrievable
//! from history, which is the contract the broadcast stream's backfill
//! path relies on.
//!
//! Conversation lifecycle notices pass through without journaling; their
//! audit trail is the conversation event log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use squad_bus_core::{
    BusError, BusMessage, BusPayload, BusStats, MessageBus, PublishAck, PublishGuard,
    SubjectPattern, Subscription,
};
use squad_history::{HistoryEntry, HistoryPayload, HistoryStore, MonotonicClock};
use squad_types::EventId;

/// Default deadline for confirming the journal write.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A bus decorator that journals before acknowledging.
///
/// Publish guards are applied here, before the journal write: a message a
/// guard suppresses is neither journalled nor delivered.
pub struct JournaledBus {
    inner: Arc<dyn MessageBus>,
    history: Arc<dyn HistoryStore>,
    clock: MonotonicClock,
    publish_timeout: Duration,
    guards: std::sync::RwLock<Vec<Arc<dyn PublishGuard>>>,
}

impl JournaledBus {
    /// Wrap `inner`, journaling to `history`.
    pub fn new(inner: Arc<dyn MessageBus>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            history,
            clock: MonotonicClock::new(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            guards: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// Override the journal confirmation deadline.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn journal_entry(&self, message: &BusMessage) -> Option<HistoryEntry> {
        let payload = match &message.payload {
            BusPayload::Agent(msg) => HistoryPayload::Message(msg.clone()),
            BusPayload::State(change) => HistoryPayload::StateChange(change.clone()),
            BusPayload::Conversation(_) => return None,
        };
        let execution_id = match &payload {
            HistoryPayload::Message(msg) => msg.execution_id,
            HistoryPayload::StateChange(change) => change.execution_id,
        };
        Some(HistoryEntry {
            // Entry id mirrors the bus dedup key so publisher retries
            // journal exactly once.
            id: EventId(message.id),
            execution_id,
            created_at: message.published_at,
            payload,
        })
    }
}

#[async_trait]
impl MessageBus for JournaledBus {
    #[instrument(skip_all, fields(subject = %message.subject, message_id = %message.id))]
    async fn publish(&self, mut message: BusMessage) -> Result<PublishAck, BusError> {
        {
            let guards = self
                .guards
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for guard in guards.iter() {
                if let squad_bus_core::GuardVerdict::Reject { reason } = guard.review(&message) {
                    return Err(BusError::Rejected { reason });
                }
            }
        }
        if let Some(mut entry) = self.journal_entry(&message) {
            entry.created_at = self.clock.now().await;
            message.published_at = entry.created_at;
            tokio::time::timeout(self.publish_timeout, self.history.append(entry))
                .await
                .map_err(|_| {
                    BusError::Unavailable("journal write timed out".to_string())
                })?
                .map_err(|e| BusError::Unavailable(format!("journal write failed: {e}")))?;
        }
        self.inner.publish(message).await
    }

    async fn subscribe(
        &self,
        pattern: SubjectPattern,
        durable_name: &str,
    ) -> Result<Subscription, BusError> {
        self.inner.subscribe(pattern, durable_name).await
    }

    fn register_guard(&self, guard: Arc<dyn PublishGuard>) {
        self.guards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(guard);
    }

    async fn stats(&self) -> BusStats {
        self.inner.stats().await
    }
}
