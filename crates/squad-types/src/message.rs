//! The immutable agent message record and its wire envelope.
//!
//! Messages are append-only: once written they are never edited, and
//! corrections are new messages pointing back via `parent_message_id`.
//! Exactly one of `recipient_id` / `broadcast_scope` is set; the
//! constructors below make the invalid combination unrepresentable at call
//! sites and `validate` re-checks records arriving off the wire.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AgentId, ConversationId, ExecutionId, MessageId};
use crate::role::AgentRole;
use crate::time::now_ms;
use crate::MAX_MESSAGE_CONTENT_LEN;

//─────────────────────────────
//  Message classification
//─────────────────────────────

/// Type of an agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work handed from a senior role to a junior (or equal) one.
    TaskAssignment,
    /// A question opening a tracked conversation.
    Question,
    /// An answer closing a tracked conversation.
    Answer,
    /// Progress or blocker report.
    StatusUpdate,
    /// Request for review of produced code.
    CodeReviewRequest,
    /// Review verdict for a prior request.
    CodeReviewResponse,
    /// Completion claim for the overall task.
    TaskCompletion,
    /// Periodic squad-wide status broadcast.
    Standup,
    /// Terminal escalation: a human must step in.
    HumanInterventionRequired,
}

/// Recipient set of a non-point-to-point message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastScope {
    /// Every member of the squad.
    Squad,
    /// Every agent participating in the execution.
    Execution,
    /// Every member holding the given role.
    Role(AgentRole),
}

impl BroadcastScope {
    /// Wire token used in bus subjects: `squad`, `execution` or
    /// `role:<role>`.
    pub fn as_token(&self) -> String {
        match self {
            BroadcastScope::Squad => "squad".to_string(),
            BroadcastScope::Execution => "execution".to_string(),
            BroadcastScope::Role(role) => format!("role:{role}"),
        }
    }

    /// Parse the wire token produced by [`BroadcastScope::as_token`].
    pub fn parse(token: &str) -> Option<BroadcastScope> {
        match token {
            "squad" => Some(BroadcastScope::Squad),
            "execution" => Some(BroadcastScope::Execution),
            _ => token
                .strip_prefix("role:")
                .and_then(AgentRole::parse)
                .map(BroadcastScope::Role),
        }
    }
}

impl std::fmt::Display for BroadcastScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_token())
    }
}

impl Serialize for BroadcastScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_token())
    }
}

impl<'de> Deserialize<'de> for BroadcastScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        BroadcastScope::parse(&token)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown broadcast scope: {token}")))
    }
}

//─────────────────────────────
//  Metadata and flags
//─────────────────────────────

/// Who may observe a message on an end-user-scoped stream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Observable by end-user subscribers (subject to role filtering).
    Public,
    /// Internal agent-to-agent traffic, never streamed externally.
    #[default]
    Internal,
}

/// Structured metadata carried by every message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// External visibility of the message.
    #[serde(default)]
    pub visibility: Visibility,
    /// Set on a `status_update` that raises a blocker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    /// Free-text reason accompanying blockers and rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Anything else the sender attached.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MessageMetadata {
    /// Metadata marking a message publicly visible.
    pub fn public() -> Self {
        Self {
            visibility: Visibility::Public,
            ..Self::default()
        }
    }

    /// Metadata raising a blocker with the given reason.
    pub fn blocker(reason: impl Into<String>) -> Self {
        Self {
            blocked: Some(true),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Whether this metadata raises a blocker.
    pub fn is_blocked(&self) -> bool {
        self.blocked == Some(true)
    }
}

/// Delivery flags on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageFlags {
    /// The message acknowledges receipt of a question.
    #[serde(rename = "ack", default)]
    pub acknowledgment: bool,
    /// Synthetic follow-up sent by the conversation tracker.
    #[serde(default)]
    pub follow_up: bool,
    /// Re-delivery of a question to an escalation target.
    #[serde(default)]
    pub escalation: bool,
}

//─────────────────────────────
//  The message record
//─────────────────────────────

/// An immutable message exchanged between agents during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message identifier; the deduplication key for delivery.
    pub id: MessageId,
    /// Execution this message belongs to.
    pub execution_id: ExecutionId,
    /// Sending agent.
    pub sender_id: AgentId,
    /// Point-to-point recipient; mutually exclusive with `broadcast_scope`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<AgentId>,
    /// Fanout scope; mutually exclusive with `recipient_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_scope: Option<BroadcastScope>,
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Free-text body.
    pub content: String,
    /// Structured metadata.
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// Conversation this message participates in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Message this one corrects, answers or follows up on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    /// Delivery flags.
    #[serde(default)]
    pub flags: MessageFlags,
    /// Creation timestamp (UTC, millisecond precision).
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    /// Build a point-to-point message.
    pub fn direct(
        execution_id: ExecutionId,
        sender_id: AgentId,
        recipient_id: AgentId,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            execution_id,
            sender_id,
            recipient_id: Some(recipient_id),
            broadcast_scope: None,
            message_type,
            content: content.into(),
            metadata: MessageMetadata::default(),
            conversation_id: None,
            parent_message_id: None,
            flags: MessageFlags::default(),
            created_at: now_ms(),
        }
    }

    /// Build a fanout message for the given scope.
    pub fn broadcast(
        execution_id: ExecutionId,
        sender_id: AgentId,
        scope: BroadcastScope,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            execution_id,
            sender_id,
            recipient_id: None,
            broadcast_scope: Some(scope),
            message_type,
            content: content.into(),
            metadata: MessageMetadata::default(),
            conversation_id: None,
            parent_message_id: None,
            flags: MessageFlags::default(),
            created_at: now_ms(),
        }
    }

    /// Attach metadata, builder-style.
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a conversation id, builder-style.
    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Attach a parent message id, builder-style.
    pub fn replying_to(mut self, parent: MessageId) -> Self {
        self.parent_message_id = Some(parent);
        self
    }

    /// Attach flags, builder-style.
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check the structural invariants of the record.
    ///
    /// Exactly one of `recipient_id` / `broadcast_scope` must be set and
    /// the content must fit the size limit.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.recipient_id, &self.broadcast_scope) {
            (Some(_), Some(_)) => {
                return Err("message has both recipient_id and broadcast_scope".to_string());
            }
            (None, None) => {
                return Err("message has neither recipient_id nor broadcast_scope".to_string());
            }
            _ => {}
        }
        if self.content.len() > MAX_MESSAGE_CONTENT_LEN {
            return Err(format!(
                "message content too long: {} > {}",
                self.content.len(),
                MAX_MESSAGE_CONTENT_LEN
            ));
        }
        Ok(())
    }

    /// Whether the message opens a tracked conversation.
    pub fn is_question(&self) -> bool {
        self.message_type == MessageType::Question
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_message_validates() {
        let msg = AgentMessage::direct(
            ExecutionId::new(),
            AgentId::new(),
            AgentId::new(),
            MessageType::Question,
            "where is the staging database?",
        );
        assert!(msg.validate().is_ok());
        assert!(msg.is_question());
    }

    #[test]
    fn both_addresses_rejected() {
        let mut msg = AgentMessage::direct(
            ExecutionId::new(),
            AgentId::new(),
            AgentId::new(),
            MessageType::StatusUpdate,
            "going fine",
        );
        msg.broadcast_scope = Some(BroadcastScope::Squad);
        assert!(msg.validate().is_err());

        msg.recipient_id = None;
        msg.broadcast_scope = None;
        assert!(msg.validate().is_err());
    }

    #[test]
    fn oversized_content_rejected() {
        let mut msg = AgentMessage::direct(
            ExecutionId::new(),
            AgentId::new(),
            AgentId::new(),
            MessageType::StatusUpdate,
            "x",
        );
        msg.content = "x".repeat(MAX_MESSAGE_CONTENT_LEN + 1);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn wire_round_trip_is_exact() {
        let msg = AgentMessage::broadcast(
            ExecutionId::new(),
            AgentId::new(),
            BroadcastScope::Role(AgentRole::QaTester),
            MessageType::TaskCompletion,
            "all acceptance tests pass",
        )
        .with_metadata(MessageMetadata::public())
        .replying_to(MessageId::new());

        let wire = serde_json::to_string(&msg).unwrap();
        let parsed: AgentMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed, msg);

        // Re-serializing the parsed record produces identical bytes.
        assert_eq!(serde_json::to_string(&parsed).unwrap(), wire);
    }

    #[test]
    fn scope_tokens_round_trip() {
        for scope in [
            BroadcastScope::Squad,
            BroadcastScope::Execution,
            BroadcastScope::Role(AgentRole::DevopsEngineer),
        ] {
            assert_eq!(BroadcastScope::parse(&scope.as_token()), Some(scope));
        }
        assert_eq!(BroadcastScope::parse("role:intern"), None);
        assert_eq!(BroadcastScope::parse("everyone"), None);
    }

    #[test]
    fn type_field_uses_wire_name() {
        let msg = AgentMessage::direct(
            ExecutionId::new(),
            AgentId::new(),
            AgentId::new(),
            MessageType::CodeReviewRequest,
            "please review",
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "code_review_request");
        assert_eq!(value["flags"]["ack"], false);
    }
}
