//! Agent roles and the delegation partial order.
//!
//! The role hierarchy is a small static partial order: the project manager
//! outranks the tech lead, who outranks the worker tier. Delegation rights
//! and escalation targets are pure functions of role so no component ever
//! needs to inspect a live agent to make a routing decision.

use serde::{Deserialize, Serialize};

/// Role a squad member plays inside a squad.
///
/// Two members of the same squad may share a role; an agent's identity is
/// the `(squad, role, id)` tuple, not the role alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Owns the task end-to-end, delegates to everyone else.
    ProjectManager,
    /// Technical coordination, delegates to the worker tier.
    TechLead,
    /// Backend implementation work.
    BackendDeveloper,
    /// Frontend implementation work.
    FrontendDeveloper,
    /// Quality assurance and test execution.
    QaTester,
    /// System and architecture design.
    SolutionArchitect,
    /// Infrastructure and deployment work.
    DevopsEngineer,
    /// Machine-learning and model integration work.
    AiEngineer,
    /// Interface and interaction design.
    Designer,
}

impl AgentRole {
    /// All roles recognized by the system, in hierarchy order.
    pub const ALL: [AgentRole; 9] = [
        AgentRole::ProjectManager,
        AgentRole::TechLead,
        AgentRole::BackendDeveloper,
        AgentRole::FrontendDeveloper,
        AgentRole::QaTester,
        AgentRole::SolutionArchitect,
        AgentRole::DevopsEngineer,
        AgentRole::AiEngineer,
        AgentRole::Designer,
    ];

    /// Position of the role in the delegation hierarchy.
    ///
    /// Higher values outrank lower ones; every worker-tier role shares the
    /// same rank.
    pub fn seniority(&self) -> u8 {
        match self {
            AgentRole::ProjectManager => 3,
            AgentRole::TechLead => 2,
            _ => 1,
        }
    }

    /// Whether this role sits in the worker tier (below the tech lead).
    pub fn is_worker_tier(&self) -> bool {
        self.seniority() == 1
    }

    /// The role an unanswered question escalates to, or `None` when the
    /// next step is human intervention.
    pub fn escalation_target(&self) -> Option<AgentRole> {
        match self {
            AgentRole::ProjectManager => None,
            AgentRole::TechLead => Some(AgentRole::ProjectManager),
            _ => Some(AgentRole::TechLead),
        }
    }

    /// Wire token used in bus subjects, e.g. `backend_developer`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::ProjectManager => "project_manager",
            AgentRole::TechLead => "tech_lead",
            AgentRole::BackendDeveloper => "backend_developer",
            AgentRole::FrontendDeveloper => "frontend_developer",
            AgentRole::QaTester => "qa_tester",
            AgentRole::SolutionArchitect => "solution_architect",
            AgentRole::DevopsEngineer => "devops_engineer",
            AgentRole::AiEngineer => "ai_engineer",
            AgentRole::Designer => "designer",
        }
    }

    /// Parse the wire token produced by [`AgentRole::as_str`].
    pub fn parse(token: &str) -> Option<AgentRole> {
        AgentRole::ALL.iter().copied().find(|r| r.as_str() == token)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `sender` may address a `task_assignment` to `recipient`.
///
/// Delegation flows down (or sideways within) the hierarchy
/// `project_manager > tech_lead > worker tier`.
pub fn can_delegate(sender: AgentRole, recipient: AgentRole) -> bool {
    sender.seniority() >= recipient.seniority()
}
