//! In-memory bus implementation.
//!
//! Suitable for tests and single-process deployments. Messages are retained
//! in a bounded ring, deduplicated by id over the retention window, and
//! redelivered to subscribers that miss their ack-wait deadline. The
//! durable, journal-backed variant in `squad-bus-durable` wraps this one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    Acker, BusConfig, BusError, BusMessage, BusStats, Delivery, GuardVerdict, MessageBus,
    PublishAck, PublishGuard, Subscription, SubjectPattern,
};
use async_trait::async_trait;

//─────────────────────────────
//  Internal state
//─────────────────────────────

struct StoredMessage {
    message: BusMessage,
    size: usize,
}

#[derive(Default)]
struct Store {
    ring: VecDeque<StoredMessage>,
    bytes: usize,
}

struct PendingDelivery {
    message: BusMessage,
    delivered_at: Instant,
    attempt: u32,
}

struct SubState {
    pattern: SubjectPattern,
    tx: Mutex<mpsc::UnboundedSender<Delivery>>,
    pending: Arc<DashMap<Uuid, PendingDelivery>>,
}

impl SubState {
    fn deliver(&self, tx: &mpsc::UnboundedSender<Delivery>, message: BusMessage, attempt: u32) {
        let pending = Arc::clone(&self.pending);
        let id = message.id;
        pending.insert(
            id,
            PendingDelivery {
                message: message.clone(),
                delivered_at: Instant::now(),
                attempt,
            },
        );
        let acker = Acker::new(move || {
            pending.remove(&id);
        });
        if tx.send(Delivery::new(message, attempt, acker)).is_err() {
            // Receiver is gone; the pending entry survives for reattach.
            trace!(message_id = %id, "subscriber detached, delivery parked");
        }
    }
}

struct Inner {
    config: BusConfig,
    store: Mutex<Store>,
    seen: DashMap<Uuid, ()>,
    subs: DashMap<String, Arc<SubState>>,
    guards: std::sync::RwLock<Vec<Arc<dyn PublishGuard>>>,
    sweeper_started: AtomicBool,
}

//─────────────────────────────
//  The bus
//─────────────────────────────

/// In-memory, single-process message bus.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Create a bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store: Mutex::new(Store::default()),
                seen: DashMap::new(),
                subs: DashMap::new(),
                guards: std::sync::RwLock::new(Vec::new()),
                sweeper_started: AtomicBool::new(false),
            }),
        }
    }

    /// Create a bus with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Start the redelivery sweeper once a runtime is available.
    fn ensure_sweeper(&self) {
        if self
            .inner
            .sweeper_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let ack_wait = self.inner.config.ack_wait;
        let sweep_every = (ack_wait / 4).max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                // Snapshot the subscriptions so no map guard is held
                // across the awaits below.
                let subs: Vec<(String, Arc<SubState>)> = inner
                    .subs
                    .iter()
                    .map(|e| (e.key().clone(), Arc::clone(e.value())))
                    .collect();
                for (durable, sub) in subs {
                    let expired: Vec<Uuid> = sub
                        .pending
                        .iter()
                        .filter(|p| p.delivered_at.elapsed() >= ack_wait)
                        .map(|p| *p.key())
                        .collect();
                    if expired.is_empty() {
                        continue;
                    }
                    let tx = sub.tx.lock().await.clone();
                    for id in expired {
                        if let Some(mut pending) = sub.pending.get_mut(&id) {
                            pending.attempt += 1;
                            pending.delivered_at = Instant::now();
                            let message = pending.message.clone();
                            let attempt = pending.attempt;
                            drop(pending);
                            debug!(message_id = %id, attempt, durable = %durable, "redelivering un-acked message");
                            // Re-send without creating a second pending entry.
                            let acker = {
                                let pending_map = Arc::clone(&sub.pending);
                                Acker::new(move || {
                                    pending_map.remove(&id);
                                })
                            };
                            let _ = tx.send(Delivery::new(message, attempt, acker));
                        }
                    }
                }
            }
        });
    }

    fn apply_retention(&self, store: &mut Store) {
        let config = &self.inner.config;
        let oldest_allowed = squad_types::time::now_ms()
            - chrono::Duration::from_std(config.retention_age).unwrap_or(chrono::Duration::zero());
        while store.ring.len() > config.retention_messages
            || store
                .ring
                .front()
                .map(|m| m.message.published_at < oldest_allowed)
                .unwrap_or(false)
        {
            if let Some(evicted) = store.ring.pop_front() {
                store.bytes = store.bytes.saturating_sub(evicted.size);
                self.inner.seen.remove(&evicted.message.id);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<PublishAck, BusError> {
        if let Some(agent_msg) = message.as_agent() {
            agent_msg.validate().map_err(BusError::Malformed)?;
        }

        {
            let guards = self
                .inner
                .guards
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for guard in guards.iter() {
                if let GuardVerdict::Reject { reason } = guard.review(&message) {
                    warn!(subject = %message.subject, %reason, "publish suppressed by guard");
                    return Err(BusError::Rejected { reason });
                }
            }
        }

        // The store mutex serializes storage and fanout, which is what
        // gives per-subject FIFO to every subscriber.
        let mut store = self.inner.store.lock().await;

        if self.inner.seen.insert(message.id, ()).is_some() {
            trace!(message_id = %message.id, "duplicate publish ignored");
            return Ok(PublishAck { duplicate: true });
        }

        let size = message.wire_size();
        store.ring.push_back(StoredMessage {
            message: message.clone(),
            size,
        });
        store.bytes += size;
        self.apply_retention(&mut store);

        let matching: Vec<Arc<SubState>> = self
            .inner
            .subs
            .iter()
            .filter(|e| e.value().pattern.matches(&message.subject))
            .map(|e| Arc::clone(e.value()))
            .collect();
        for sub in matching {
            let tx = sub.tx.lock().await.clone();
            sub.deliver(&tx, message.clone(), 1);
        }

        Ok(PublishAck { duplicate: false })
    }

    async fn subscribe(
        &self,
        pattern: SubjectPattern,
        durable_name: &str,
    ) -> Result<Subscription, BusError> {
        if durable_name.is_empty() {
            return Err(BusError::InvalidSubscription(
                "durable name cannot be empty".to_string(),
            ));
        }
        self.ensure_sweeper();

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(existing) = self.inner.subs.get(durable_name) {
            // Reattach: swap the channel and flush pending deliveries.
            let sub = Arc::clone(existing.value());
            drop(existing);
            *sub.tx.lock().await = tx.clone();
            let mut parked: Vec<(Uuid, BusMessage, u32)> = sub
                .pending
                .iter()
                .map(|p| (*p.key(), p.message.clone(), p.attempt))
                .collect();
            parked.sort_by_key(|(_, m, _)| m.published_at);
            for (id, message, attempt) in parked {
                if let Some(mut pending) = sub.pending.get_mut(&id) {
                    pending.attempt = attempt + 1;
                    pending.delivered_at = Instant::now();
                }
                let pending_map = Arc::clone(&sub.pending);
                let acker = Acker::new(move || {
                    pending_map.remove(&id);
                });
                let _ = tx.send(Delivery::new(message, attempt + 1, acker));
            }
            debug!(durable = durable_name, "subscription reattached");
            return Ok(Subscription::new(durable_name.to_string(), rx));
        }

        let sub = Arc::new(SubState {
            pattern,
            tx: Mutex::new(tx),
            pending: Arc::new(DashMap::new()),
        });
        self.inner.subs.insert(durable_name.to_string(), sub);
        debug!(durable = durable_name, "subscription created");
        Ok(Subscription::new(durable_name.to_string(), rx))
    }

    fn register_guard(&self, guard: Arc<dyn PublishGuard>) {
        self.inner
            .guards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(guard);
    }

    async fn stats(&self) -> BusStats {
        let store = self.inner.store.lock().await;
        BusStats {
            messages_stored: store.ring.len(),
            bytes_stored: store.bytes,
            subscribers: self.inner.subs.len(),
            stream_count: 1,
        }
    }
}
