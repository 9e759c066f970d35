//! Conversation row and audit-event storage.
//!
//! Transitions are guarded by an optimistic version check and the audit
//! event is appended in the same atomic update as the row change, so an
//! external observer can never see a state without its event.

use std::collections::HashMap;

use tokio::sync::Mutex;

use squad_types::{
    Conversation, ConversationEvent, ConversationId, ExecutionId, MessageId,
};

use crate::ConversationError;

/// Storage of conversations and their append-only event log.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert a freshly opened conversation together with its `Created`
    /// event.
    async fn insert(
        &self,
        conversation: Conversation,
        event: ConversationEvent,
    ) -> Result<(), ConversationError>;

    /// Load a conversation by id.
    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ConversationError>;

    /// Load a conversation by its initial question message.
    async fn find_by_initial_message(
        &self,
        execution_id: ExecutionId,
        message_id: MessageId,
    ) -> Result<Option<Conversation>, ConversationError>;

    /// Apply a transition: append `event` and replace the row, iff the
    /// stored version still equals `expected_version`. The stored version
    /// is bumped by one.
    async fn transition(
        &self,
        updated: Conversation,
        expected_version: u64,
        event: ConversationEvent,
    ) -> Result<(), ConversationError>;

    /// All non-terminal conversations, for the deadline sweeper.
    async fn open_conversations(&self) -> Result<Vec<Conversation>, ConversationError>;

    /// Ordered audit events of one conversation.
    async fn events(
        &self,
        id: ConversationId,
    ) -> Result<Vec<ConversationEvent>, ConversationError>;
}

#[derive(Default)]
struct Inner {
    rows: HashMap<ConversationId, Conversation>,
    by_initial: HashMap<(ExecutionId, MessageId), ConversationId>,
    events: Vec<ConversationEvent>,
}

/// In-memory conversation store.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<Inner>,
}

impl MemoryConversationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn insert(
        &self,
        conversation: Conversation,
        event: ConversationEvent,
    ) -> Result<(), ConversationError> {
        let mut inner = self.inner.lock().await;
        let key = (conversation.execution_id, conversation.initial_message_id);
        if inner.by_initial.contains_key(&key) {
            return Err(ConversationError::DuplicateInitialMessage(
                conversation.initial_message_id,
            ));
        }
        inner.by_initial.insert(key, conversation.id);
        inner.events.push(event);
        inner.rows.insert(conversation.id, conversation);
        Ok(())
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ConversationError> {
        Ok(self.inner.lock().await.rows.get(&id).cloned())
    }

    async fn find_by_initial_message(
        &self,
        execution_id: ExecutionId,
        message_id: MessageId,
    ) -> Result<Option<Conversation>, ConversationError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_initial
            .get(&(execution_id, message_id))
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        mut updated: Conversation,
        expected_version: u64,
        event: ConversationEvent,
    ) -> Result<(), ConversationError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .rows
            .get(&updated.id)
            .ok_or(ConversationError::UnknownConversation(updated.id))?;
        if current.version != expected_version {
            return Err(ConversationError::VersionConflict {
                conversation_id: updated.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        updated.version = expected_version + 1;
        inner.events.push(event);
        inner.rows.insert(updated.id, updated);
        Ok(())
    }

    async fn open_conversations(&self) -> Result<Vec<Conversation>, ConversationError> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .values()
            .filter(|c| !c.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn events(
        &self,
        id: ConversationId,
    ) -> Result<Vec<ConversationEvent>, ConversationError> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.conversation_id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squad_types::{AgentId, ConversationEventKind, ConversationState};

    fn open_conversation() -> Conversation {
        Conversation::open(
            ExecutionId::new(),
            MessageId::new(),
            AgentId::new(),
            AgentId::new(),
            squad_types::time::now_ms(),
        )
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryConversationStore::new();
        let conversation = open_conversation();
        let created = ConversationEvent::record(
            conversation.id,
            ConversationEventKind::Created,
            None,
            ConversationState::Initiated,
        );
        store.insert(conversation.clone(), created).await.unwrap();

        let mut updated = conversation.clone();
        updated.state = ConversationState::Waiting;
        let event = ConversationEvent::record(
            conversation.id,
            ConversationEventKind::Acknowledged,
            Some(ConversationState::Initiated),
            ConversationState::Waiting,
        );
        store.transition(updated.clone(), 0, event.clone()).await.unwrap();

        // A second writer working from the same snapshot loses.
        let err = store.transition(updated, 0, event).await.unwrap_err();
        assert!(matches!(err, ConversationError::VersionConflict { .. }));

        let stored = store.get(conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state, ConversationState::Waiting);
    }

    #[tokio::test]
    async fn one_conversation_per_initial_message() {
        let store = MemoryConversationStore::new();
        let conversation = open_conversation();
        let created = ConversationEvent::record(
            conversation.id,
            ConversationEventKind::Created,
            None,
            ConversationState::Initiated,
        );
        store.insert(conversation.clone(), created.clone()).await.unwrap();

        let mut duplicate = open_conversation();
        duplicate.execution_id = conversation.execution_id;
        duplicate.initial_message_id = conversation.initial_message_id;
        let err = store.insert(duplicate, created).await.unwrap_err();
        assert!(matches!(err, ConversationError::DuplicateInitialMessage(_)));
    }

    #[tokio::test]
    async fn events_are_recorded_in_order() {
        let store = MemoryConversationStore::new();
        let conversation = open_conversation();
        store
            .insert(
                conversation.clone(),
                ConversationEvent::record(
                    conversation.id,
                    ConversationEventKind::Created,
                    None,
                    ConversationState::Initiated,
                ),
            )
            .await
            .unwrap();

        let mut updated = conversation.clone();
        updated.state = ConversationState::Timeout;
        store
            .transition(
                updated,
                0,
                ConversationEvent::record(
                    conversation.id,
                    ConversationEventKind::TimedOut,
                    Some(ConversationState::Initiated),
                    ConversationState::Timeout,
                ),
            )
            .await
            .unwrap();

        let events = store.events(conversation.id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![ConversationEventKind::Created, ConversationEventKind::TimedOut]
        );
    }
}
