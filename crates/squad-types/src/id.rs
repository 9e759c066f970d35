//! Opaque 128-bit identifiers for every persisted entity.
//!
//! Each table gets its own newtype so an `ExecutionId` can never be passed
//! where a `ConversationId` is expected. All identifiers serialize
//! transparently as their underlying UUID.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The underlying UUID.
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

entity_id! {
    /// Identifier of an organisation owning squads.
    OrgId
}
entity_id! {
    /// Identifier of a human user (squad owner, operator).
    UserId
}
entity_id! {
    /// Identifier of a persistent squad (team configuration).
    SquadId
}
entity_id! {
    /// Identifier of a squad member, i.e. a single role-specialized agent.
    AgentId
}
entity_id! {
    /// Identifier of a project grouping tasks.
    ProjectId
}
entity_id! {
    /// Identifier of a unit of work carried out by a squad.
    TaskId
}
entity_id! {
    /// Identifier of one attempt at a task.
    ExecutionId
}
entity_id! {
    /// Identifier of an immutable agent message.
    MessageId
}
entity_id! {
    /// Identifier of a tracked question/answer conversation.
    ConversationId
}
entity_id! {
    /// Identifier of an audit or journal event.
    EventId
}
entity_id! {
    /// Identifier of a persistent per-agent session (conversational memory).
    SessionId
}
entity_id! {
    /// Identifier of an external stream subscriber connection.
    SubscriberId
}
