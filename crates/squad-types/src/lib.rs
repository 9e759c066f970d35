#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-types** – Shared primitive data structures for the Squad core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It carries the persisted data model (squads, tasks, executions, messages,
//! conversations), the role partial order that governs delegation, and the
//! error classification shared by the whole workspace. It intentionally makes
//! no assumptions about I/O, transport, or storage.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum allowed size for message content to prevent memory exhaustion.
pub const MAX_MESSAGE_CONTENT_LEN: usize = 1_048_576; // 1MB

/// Maximum allowed size for task titles.
pub const MAX_TASK_TITLE_LEN: usize = 512;

/// Maximum allowed size for task descriptions.
pub const MAX_TASK_DESCRIPTION_LEN: usize = 65_536;

pub mod error;
pub mod id;
pub mod message;
pub mod role;
pub mod squad;
pub mod task;
pub mod time;
pub mod traits;

mod conversation;

pub use conversation::{
    Conversation, ConversationEvent, ConversationEventKind, ConversationNotice,
    ConversationState,
};
pub use error::{Classify, ErrorClass};
pub use id::{
    AgentId, ConversationId, EventId, ExecutionId, MessageId, OrgId, ProjectId, SessionId,
    SquadId, SubscriberId, TaskId, UserId,
};
pub use message::{
    AgentMessage, BroadcastScope, MessageFlags, MessageMetadata, MessageType, Visibility,
};
pub use role::{can_delegate, AgentRole};
pub use squad::{Squad, SquadMember, SquadStatus};
pub use task::{StateChanged, Task, TaskExecution, TaskPriority, TaskStatus, WorkflowState};
pub use traits::Roster;
