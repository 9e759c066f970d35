//! Delegation enforcement at the publish boundary.
//!
//! The orchestrator installs one guard per execution. A `task_assignment`
//! whose sender does not outrank (or equal) its recipient in the role
//! hierarchy is suppressed before storage, so the recipient's inbox never
//! sees it. The rejection is handed to the orchestrator out-of-band, which
//! answers the sender and emits an `invalid_delegation` log event.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use squad_bus_core::{BusMessage, GuardVerdict, PublishGuard};
use squad_types::{
    can_delegate, AgentId, AgentMessage, AgentRole, BroadcastScope, ExecutionId, MessageType,
};

/// Reason attached to suppressed assignments.
pub const ROLE_HIERARCHY_VIOLATION: &str = "role_hierarchy_violation";

/// A suppressed `task_assignment`, handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct RejectedDelegation {
    /// The message that was suppressed.
    pub message: AgentMessage,
    /// Machine-readable reason.
    pub reason: String,
}

/// Publish guard enforcing the delegation partial order for one execution.
pub struct DelegationGuard {
    execution_id: ExecutionId,
    roles: Arc<DashMap<AgentId, AgentRole>>,
    system_senders: Arc<DashMap<AgentId, ()>>,
    rejections: mpsc::UnboundedSender<RejectedDelegation>,
}

impl DelegationGuard {
    /// Build a guard and the receiving half of its rejection channel.
    pub fn new(
        execution_id: ExecutionId,
        roles: Arc<DashMap<AgentId, AgentRole>>,
        system_senders: Arc<DashMap<AgentId, ()>>,
    ) -> (Self, mpsc::UnboundedReceiver<RejectedDelegation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                execution_id,
                roles,
                system_senders,
                rejections: tx,
            },
            rx,
        )
    }

    fn verdict_for(&self, message: &AgentMessage) -> Option<String> {
        let sender_role = match self.roles.get(&message.sender_id) {
            Some(role) => *role,
            None if self.system_senders.contains_key(&message.sender_id) => return None,
            None => return Some("unknown_sender".to_string()),
        };
        let allowed = match (&message.recipient_id, &message.broadcast_scope) {
            (Some(recipient), _) => match self.roles.get(recipient) {
                Some(recipient_role) => can_delegate(sender_role, *recipient_role),
                // Unknown recipients resolve at delivery; nothing to enforce.
                None => true,
            },
            (None, Some(BroadcastScope::Role(role))) => can_delegate(sender_role, *role),
            // Squad- and execution-wide assignments reach seniors too.
            (None, Some(_)) => can_delegate(sender_role, AgentRole::TechLead),
            (None, None) => true,
        };
        (!allowed).then(|| ROLE_HIERARCHY_VIOLATION.to_string())
    }
}

impl PublishGuard for DelegationGuard {
    fn review(&self, message: &BusMessage) -> GuardVerdict {
        let Some(agent_message) = message.as_agent() else {
            return GuardVerdict::Allow;
        };
        if agent_message.execution_id != self.execution_id
            || agent_message.message_type != MessageType::TaskAssignment
        {
            return GuardVerdict::Allow;
        }
        match self.verdict_for(agent_message) {
            None => GuardVerdict::Allow,
            Some(reason) => {
                let _ = self.rejections.send(RejectedDelegation {
                    message: agent_message.clone(),
                    reason: reason.clone(),
                });
                GuardVerdict::reject(reason)
            }
        }
    }
}
