//! Behaviour traits shared across crates.

use crate::id::{AgentId, SquadId};
use crate::role::AgentRole;
use crate::squad::SquadMember;

/// Read-only membership view over squads.
///
/// Implemented by the agent registry. Components that need to route by role
/// (escalation target selection, visibility filtering) hold this capability
/// instead of live agent references.
#[async_trait::async_trait]
pub trait Roster: Send + Sync {
    /// Look up a member by agent id.
    async fn member(&self, agent_id: AgentId) -> Option<SquadMember>;

    /// First member of a squad holding the given role, if any.
    async fn first_with_role(&self, squad_id: SquadId, role: AgentRole) -> Option<SquadMember>;
}
