//! Squad and squad-member records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AgentId, OrgId, SquadId, UserId};
use crate::role::AgentRole;
use crate::time::now_ms;

/// Lifecycle status of a squad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquadStatus {
    /// Squad accepts and executes tasks.
    Active,
    /// Squad exists but does not take new executions.
    Paused,
    /// Squad is retired; kept for history only.
    Archived,
}

/// A persistent team of role-specialized agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Squad {
    /// Squad identifier.
    pub id: SquadId,
    /// Owning organisation.
    pub org_id: OrgId,
    /// Human owner of the squad.
    pub owner_id: UserId,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: SquadStatus,
    /// Free-form squad configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Squad {
    /// Create an active squad with empty configuration.
    pub fn new(org_id: OrgId, owner_id: UserId, name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: SquadId::new(),
            org_id,
            owner_id,
            name: name.into(),
            status: SquadStatus::Active,
            config: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single role-specialized agent belonging to a squad.
///
/// The member record is pure configuration; the live runtime worker built
/// from it is owned by the agent registry. An agent's identity is the
/// `(squad, role, id)` tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquadMember {
    /// Agent identifier.
    pub id: AgentId,
    /// Squad the member belongs to.
    pub squad_id: SquadId,
    /// Role played inside the squad.
    pub role: AgentRole,
    /// Optional narrower specialization, e.g. "payments".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
    /// LLM provider slug, e.g. "anthropic".
    pub llm_provider: String,
    /// LLM model slug.
    pub llm_model: String,
    /// System prompt the agent reasons under.
    pub system_prompt: String,
    /// Free-form member configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SquadMember {
    /// Create a member with the given role and empty configuration.
    pub fn new(
        squad_id: SquadId,
        role: AgentRole,
        llm_provider: impl Into<String>,
        llm_model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: AgentId::new(),
            squad_id,
            role,
            specialization: None,
            llm_provider: llm_provider.into(),
            llm_model: llm_model.into(),
            system_prompt: system_prompt.into(),
            config: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_round_trips() {
        let member = SquadMember::new(
            SquadId::new(),
            AgentRole::TechLead,
            "anthropic",
            "claude-sonnet",
            "You coordinate the squad's technical work.",
        );
        let json = serde_json::to_string(&member).unwrap();
        let back: SquadMember = serde_json::from_str(&json).unwrap();
        assert_eq!(back, member);
    }
}
