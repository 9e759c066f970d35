//! In-memory history driver.
//!
//! Fast, non-persistent backend for tests and development. All entries are
//! kept in an ordered vector guarded by an async lock; the id index makes
//! repeated appends of the same entry a no-op.

use std::collections::HashSet;

use tokio::sync::RwLock;

use squad_types::EventId;

use crate::{HistoryEntry, HistoryError, HistoryQuery, HistoryStore};

/// An in-memory, non-persistent history store.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    // Kept sorted by (created_at, id).
    entries: Vec<HistoryEntry>,
    ids: HashSet<EventId>,
}

impl MemoryHistory {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of journalled entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Whether the journal is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut inner = self.inner.write().await;
        if !inner.ids.insert(entry.id) {
            return Ok(());
        }
        // Entries arrive nearly sorted; search from the back.
        let key = entry.sort_key();
        let pos = inner
            .entries
            .iter()
            .rposition(|e| e.sort_key() <= key)
            .map(|p| p + 1)
            .unwrap_or(0);
        inner.entries.insert(pos, entry);
        Ok(())
    }

    async fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, HistoryError> {
        let inner = self.inner.read().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for entry in inner.entries.iter() {
            if let Some(since) = query.since {
                if entry.sort_key() <= since {
                    continue;
                }
            }
            if !query.matches(entry) {
                continue;
            }
            out.push(entry.clone());
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn prune(
        &self,
        execution_id: squad_types::ExecutionId,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize, HistoryError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let before = inner.entries.len();
        let mut kept = Vec::with_capacity(before);
        for entry in inner.entries.drain(..) {
            if entry.execution_id == execution_id && entry.created_at < cutoff {
                inner.ids.remove(&entry.id);
            } else {
                kept.push(entry);
            }
        }
        inner.entries = kept;
        Ok(before - inner.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squad_types::{AgentId, AgentMessage, ExecutionId, MessageType};

    async fn seeded_store(exec: ExecutionId, n: usize) -> (MemoryHistory, Vec<HistoryEntry>) {
        let store = MemoryHistory::new();
        let clock = crate::MonotonicClock::new();
        let mut entries = Vec::new();
        for i in 0..n {
            let msg = AgentMessage::direct(
                exec,
                AgentId::new(),
                AgentId::new(),
                MessageType::StatusUpdate,
                format!("update {i}"),
            );
            let entry = HistoryEntry::message(msg, clock.now().await);
            store.append(entry.clone()).await.unwrap();
            entries.push(entry);
        }
        (store, entries)
    }

    #[tokio::test]
    async fn query_returns_entries_in_order() {
        let exec = ExecutionId::new();
        let (store, entries) = seeded_store(exec, 20).await;

        let result = store.query(HistoryQuery::execution(exec)).await.unwrap();
        assert_eq!(result, entries);
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let exec = ExecutionId::new();
        let (store, entries) = seeded_store(exec, 3).await;

        store.append(entries[1].clone()).await.unwrap();
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn since_cursor_is_exclusive() {
        let exec = ExecutionId::new();
        let (store, entries) = seeded_store(exec, 10).await;

        let cursor = entries[4].sort_key();
        let result = store
            .query(HistoryQuery::execution(exec).since(cursor))
            .await
            .unwrap();
        assert_eq!(result, entries[5..].to_vec());
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let exec = ExecutionId::new();
        let (store, entries) = seeded_store(exec, 10).await;

        let result = store
            .query(HistoryQuery::execution(exec).limit(3))
            .await
            .unwrap();
        assert_eq!(result, entries[..3].to_vec());
    }

    #[tokio::test]
    async fn prune_deletes_only_the_targeted_window() {
        let exec = ExecutionId::new();
        let (store, entries) = seeded_store(exec, 6).await;

        let cutoff = entries[3].created_at;
        let deleted = store.prune(exec, cutoff).await.unwrap();
        assert_eq!(deleted, 3);

        let remaining = store.query(HistoryQuery::execution(exec)).await.unwrap();
        assert_eq!(remaining, entries[3..].to_vec());

        // Pruned ids may be journalled again.
        store.append(entries[0].clone()).await.unwrap();
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn out_of_order_appends_are_sorted() {
        let exec = ExecutionId::new();
        let store = MemoryHistory::new();
        let clock = crate::MonotonicClock::new();

        let t1 = clock.now().await;
        let t2 = clock.now().await;

        let late = HistoryEntry::message(
            AgentMessage::direct(exec, AgentId::new(), AgentId::new(), MessageType::Answer, "b"),
            t2,
        );
        let early = HistoryEntry::message(
            AgentMessage::direct(exec, AgentId::new(), AgentId::new(), MessageType::Question, "a"),
            t1,
        );
        store.append(late.clone()).await.unwrap();
        store.append(early.clone()).await.unwrap();

        let result = store.query(HistoryQuery::execution(exec)).await.unwrap();
        assert_eq!(result, vec![early, late]);
    }
}
