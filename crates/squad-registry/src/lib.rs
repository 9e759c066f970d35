#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-registry** – Agent factory and process-local registry.
//!
//! The factory constructs [`AgentWorker`]s from squad member records and
//! role definitions, and caches the live instances per process. Removal
//! only evicts the runtime; sessions stay in the session store, which is
//! what makes cross-process resumption possible. The registry also serves
//! as the read-only [`Roster`] other components use for role routing.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use squad_agent_runtime::{AgentWorker, LanguageModel, SessionStore, ToolRegistry};
use squad_bus_core::MessageBus;
use squad_types::{AgentId, AgentRole, ExecutionId, Roster, SessionId, SquadId, SquadMember};

//─────────────────────────────
//  Role definitions
//─────────────────────────────

/// Durable, per-role defaults applied when constructing an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Role the definition applies to.
    pub role: AgentRole,
    /// Default system prompt for the role.
    pub system_prompt: String,
    /// Default LLM provider slug.
    pub llm_provider: String,
    /// Default LLM model slug.
    pub llm_model: String,
}

/// Immutable set of role definitions loaded at startup.
///
/// Reloading replaces the whole set; running agents keep the definition
/// they were built with and changes take effect on the next `create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinitions {
    definitions: HashMap<AgentRole, RoleDefinition>,
}

impl RoleDefinitions {
    /// Definitions covering every built-in role with a generic prompt.
    pub fn builtin() -> Self {
        let definitions = AgentRole::ALL
            .into_iter()
            .map(|role| {
                (
                    role,
                    RoleDefinition {
                        role,
                        system_prompt: builtin_prompt(role).to_string(),
                        llm_provider: "anthropic".to_string(),
                        llm_model: "claude-sonnet".to_string(),
                    },
                )
            })
            .collect();
        Self { definitions }
    }

    /// Build a set from explicit definitions.
    pub fn from_definitions(definitions: Vec<RoleDefinition>) -> Self {
        Self {
            definitions: definitions.into_iter().map(|d| (d.role, d)).collect(),
        }
    }

    /// Definition for a role, if loaded.
    pub fn get(&self, role: AgentRole) -> Option<&RoleDefinition> {
        self.definitions.get(&role)
    }
}

fn builtin_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::ProjectManager => {
            "You are the project manager. Analyze the task, produce a plan and \
             delegate work to your squad. Report completion when every \
             deliverable is verified."
        }
        AgentRole::TechLead => {
            "You are the tech lead. Break delegated work into technical steps, \
             coordinate the developers and review their output."
        }
        AgentRole::BackendDeveloper => {
            "You are a backend developer. Implement the assigned work and \
             report progress and blockers promptly."
        }
        AgentRole::FrontendDeveloper => {
            "You are a frontend developer. Implement the assigned interface \
             work and report progress and blockers promptly."
        }
        AgentRole::QaTester => {
            "You are the QA tester. Exercise delivered work against its \
             acceptance criteria and report defects."
        }
        AgentRole::SolutionArchitect => {
            "You are the solution architect. Evaluate designs for soundness \
             and consistency with the existing system."
        }
        AgentRole::DevopsEngineer => {
            "You are the devops engineer. Handle build, deployment and \
             infrastructure work."
        }
        AgentRole::AiEngineer => {
            "You are the AI engineer. Handle model integration and data \
             pipeline work."
        }
        AgentRole::Designer => {
            "You are the designer. Produce interface and interaction designs \
             for the assigned work."
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The role has no loaded definition (or the token is not a role).
    #[error("unsupported role: {0}")]
    UnsupportedRole(String),
    /// No member with the given id is registered.
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),
}

impl squad_types::Classify for RegistryError {
    fn class(&self) -> squad_types::ErrorClass {
        squad_types::ErrorClass::Permanent
    }
}

//─────────────────────────────
//  The factory
//─────────────────────────────

/// Constructs agents from member records and caches live instances.
pub struct AgentFactory {
    definitions: RwLock<RoleDefinitions>,
    bus: Arc<dyn MessageBus>,
    sessions: Arc<dyn SessionStore>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    members: Arc<DashMap<AgentId, SquadMember>>,
    live: DashMap<AgentId, Arc<AgentWorker>>,
}

impl AgentFactory {
    /// Create a factory over the shared capability set.
    pub fn new(
        definitions: RoleDefinitions,
        bus: Arc<dyn MessageBus>,
        sessions: Arc<dyn SessionStore>,
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            definitions: RwLock::new(definitions),
            bus,
            sessions,
            model,
            tools,
            members: Arc::new(DashMap::new()),
            live: DashMap::new(),
        }
    }

    /// Replace the role definitions; takes effect on the next `create`.
    pub async fn reload_definitions(&self, definitions: RoleDefinitions) {
        *self.definitions.write().await = definitions;
        info!("role definitions reloaded");
    }

    /// Register a member record without constructing its runtime.
    pub fn register_member(&self, member: SquadMember) {
        self.members.insert(member.id, member);
    }

    /// Resolve a wire token to a role.
    pub fn resolve_role(token: &str) -> Result<AgentRole, RegistryError> {
        AgentRole::parse(token).ok_or_else(|| RegistryError::UnsupportedRole(token.to_string()))
    }

    /// Construct (or resume) an agent for one execution.
    ///
    /// With `session_id` the returned agent continues that prior
    /// conversation on first `process_message`; without it a new session
    /// starts on demand.
    pub async fn create(
        &self,
        member: SquadMember,
        execution_id: ExecutionId,
        session_id: Option<SessionId>,
    ) -> Result<Arc<AgentWorker>, RegistryError> {
        let definitions = self.definitions.read().await;
        let definition = definitions
            .get(member.role)
            .ok_or_else(|| RegistryError::UnsupportedRole(member.role.to_string()))?;

        let mut effective = member.clone();
        if effective.system_prompt.trim().is_empty() {
            effective.system_prompt = definition.system_prompt.clone();
        }
        drop(definitions);

        let worker = Arc::new(AgentWorker::new(
            effective,
            execution_id,
            Arc::clone(&self.bus),
            self.roster_handle(),
            Arc::clone(&self.sessions),
            Arc::clone(&self.model),
            Arc::clone(&self.tools),
            session_id,
        ));
        self.members.insert(member.id, member.clone());
        self.live.insert(member.id, Arc::clone(&worker));
        debug!(agent = %member.id, role = %member.role, "agent constructed");
        Ok(worker)
    }

    /// Look up a live agent.
    pub fn get(&self, agent_id: AgentId) -> Option<Arc<AgentWorker>> {
        self.live.get(&agent_id).map(|w| Arc::clone(w.value()))
    }

    /// Evict a live agent. The member record and its session persist.
    pub fn remove(&self, agent_id: AgentId) {
        if self.live.remove(&agent_id).is_some() {
            debug!(agent = %agent_id, "agent evicted from registry");
        }
    }

    /// Number of live agents.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn roster_handle(&self) -> Arc<dyn Roster> {
        Arc::new(MemberRoster {
            members: Arc::clone(&self.members),
        })
    }

    /// A read-only roster view sharing the factory's member table.
    pub fn roster(&self) -> Arc<dyn Roster> {
        self.roster_handle()
    }
}

/// Roster view backed by the factory's member table.
struct MemberRoster {
    members: Arc<DashMap<AgentId, SquadMember>>,
}

#[async_trait::async_trait]
impl Roster for MemberRoster {
    async fn member(&self, agent_id: AgentId) -> Option<SquadMember> {
        self.members.get(&agent_id).map(|m| m.clone())
    }

    async fn first_with_role(&self, squad_id: SquadId, role: AgentRole) -> Option<SquadMember> {
        let mut candidates: Vec<SquadMember> = self
            .members
            .iter()
            .filter(|m| m.squad_id == squad_id && m.role == role)
            .map(|m| m.clone())
            .collect();
        candidates.sort_by_key(|m| (m.created_at, m.id));
        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squad_agent_runtime::{MemorySessionStore, ScriptedModel};
    use squad_bus_core::InMemoryBus;

    fn factory() -> (AgentFactory, Arc<MemorySessionStore>) {
        let sessions = Arc::new(MemorySessionStore::new());
        let factory = AgentFactory::new(
            RoleDefinitions::builtin(),
            Arc::new(InMemoryBus::with_defaults()),
            sessions.clone(),
            Arc::new(ScriptedModel::new()),
            Arc::new(ToolRegistry::new()),
        );
        (factory, sessions)
    }

    fn member(role: AgentRole) -> SquadMember {
        SquadMember::new(SquadId::new(), role, "anthropic", "claude-sonnet", "")
    }

    #[tokio::test]
    async fn create_caches_live_instance() {
        let (factory, _) = factory();
        let member = member(AgentRole::TechLead);
        let worker = factory
            .create(member.clone(), ExecutionId::new(), None)
            .await
            .unwrap();
        assert_eq!(worker.agent_id(), member.id);
        assert!(factory.get(member.id).is_some());
        assert_eq!(factory.live_count(), 1);
    }

    #[tokio::test]
    async fn empty_member_prompt_falls_back_to_role_definition() {
        let (factory, _) = factory();
        let worker = factory
            .create(member(AgentRole::QaTester), ExecutionId::new(), None)
            .await
            .unwrap();
        assert!(worker.member().system_prompt.contains("QA tester"));
    }

    #[tokio::test]
    async fn unsupported_role_is_rejected() {
        let (factory, _) = factory();
        factory
            .reload_definitions(RoleDefinitions::from_definitions(vec![]))
            .await;
        let err = factory
            .create(member(AgentRole::Designer), ExecutionId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedRole(_)));

        assert!(matches!(
            AgentFactory::resolve_role("intern"),
            Err(RegistryError::UnsupportedRole(_))
        ));
        assert_eq!(
            AgentFactory::resolve_role("tech_lead").unwrap(),
            AgentRole::TechLead
        );
    }

    #[tokio::test]
    async fn removal_evicts_runtime_but_keeps_session() {
        let (factory, sessions) = factory();
        let member = member(AgentRole::BackendDeveloper);
        let worker = factory
            .create(member.clone(), ExecutionId::new(), None)
            .await
            .unwrap();
        worker.process_message("hello", None, None).await.unwrap();
        let session_id = worker.session_id().await.unwrap();

        factory.remove(member.id);
        assert!(factory.get(member.id).is_none());
        assert!(sessions.load(session_id).await.unwrap().is_some());

        // The roster still knows the member.
        assert!(factory.roster().member(member.id).await.is_some());
    }

    #[tokio::test]
    async fn definition_reload_takes_effect_on_next_create() {
        let (factory, _) = factory();
        let custom = RoleDefinition {
            role: AgentRole::Designer,
            system_prompt: "You sketch wireframes.".to_string(),
            llm_provider: "anthropic".to_string(),
            llm_model: "claude-sonnet".to_string(),
        };
        factory
            .reload_definitions(RoleDefinitions::from_definitions(vec![custom]))
            .await;

        let worker = factory
            .create(member(AgentRole::Designer), ExecutionId::new(), None)
            .await
            .unwrap();
        assert_eq!(worker.member().system_prompt, "You sketch wireframes.");
    }

    #[tokio::test]
    async fn roster_picks_deterministic_escalation_target() {
        let (factory, _) = factory();
        let squad_id = SquadId::new();
        let mut first = SquadMember::new(squad_id, AgentRole::TechLead, "anthropic", "m", "p");
        let mut second = SquadMember::new(squad_id, AgentRole::TechLead, "anthropic", "m", "p");
        // Force a stable ordering regardless of construction timing.
        first.created_at = squad_types::time::now_ms() - chrono::Duration::seconds(10);
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        factory.register_member(first.clone());
        factory.register_member(second);

        let picked = factory
            .roster()
            .first_with_role(squad_id, AgentRole::TechLead)
            .await
            .unwrap();
        assert_eq!(picked.id, first.id);
    }
}
