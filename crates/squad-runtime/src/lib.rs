#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-runtime** – Configuration and assembly of the orchestration core.
//!
//! This crate wires the leaves into a running system: it selects the bus
//! implementation and history driver from configuration, starts the
//! conversation tracker and broadcast stream as background tasks, and
//! exposes the handful of operations an embedding process needs: execute a
//! task, resume a blocked execution, subscribe an observer, query history.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use squad_agent_runtime::{LanguageModel, MemorySessionStore, SessionStore, ToolRegistry};
use squad_bus_core::{BusConfig, BusStats, InMemoryBus, MessageBus};
use squad_bus_durable::JournaledBus;
use squad_conversation::{
    ConversationConfig, ConversationStore, ConversationTracker, MemoryConversationStore,
};
use squad_history::{HistoryEntry, HistoryQuery, HistoryStore, MemoryHistory};
use squad_orchestration::{
    ExecutionHandle, LockRegistry, Orchestrator, OrchestratorConfig, OrchestratorError,
};
use squad_registry::{AgentFactory, RoleDefinitions};
use squad_stream::{Audience, StreamBroadcaster, StreamConfig, StreamScope, StreamSubscription};
use squad_types::{ExecutionId, SquadId, SquadMember, Task, TaskExecution};
use squad_workflow::{MemoryExecutionStore, WorkflowEngine};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Which bus implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusImplementation {
    /// In-memory bus; suitable for tests and single-process deployments.
    Memory,
    /// In-memory transport with write-ahead journaling to the history
    /// store.
    #[default]
    Durable,
}

/// Bus section of the core configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusSettings {
    /// Selected implementation.
    #[serde(default)]
    pub implementation: BusImplementation,
    /// External broker URL; reserved for networked deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Stream and delivery tuning.
    #[serde(flatten)]
    pub tuning: BusConfig,
}

/// Which storage driver backs history and relational state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDriver {
    /// In-memory stores; state is lost on process exit.
    #[default]
    Memory,
    /// SQLite-backed stores (requires the `sqlite` feature).
    Sqlite,
}

/// Storage section of the core configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Selected driver.
    #[serde(default)]
    pub driver: StorageDriver,
    /// Journal database path for the SQLite driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_path: Option<String>,
    /// Relational-state database path for the SQLite driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<String>,
}

/// Workflow section of the core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Overall deadline for one execution.
    #[serde(with = "squad_types::time::serde_secs")]
    pub execution_deadline: std::time::Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            execution_deadline: std::time::Duration::from_secs(24 * 3600),
        }
    }
}

/// Orchestrator section of the core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// TTL of the execution ownership lease.
    #[serde(with = "squad_types::time::serde_secs")]
    pub lock_ttl: std::time::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lock_ttl: std::time::Duration::from_secs(30),
        }
    }
}

/// Complete configuration of the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Message bus settings.
    #[serde(default)]
    pub bus: BusSettings,
    /// Storage settings for the journal and relational state.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Conversation tracker settings.
    #[serde(default)]
    pub conversation: ConversationConfig,
    /// Workflow settings.
    #[serde(default)]
    pub workflow: WorkflowSettings,
    /// Broadcast stream settings.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

//─────────────────────────────
//  Store selection
//─────────────────────────────

struct Stores {
    history: Arc<dyn HistoryStore>,
    executions: Arc<dyn squad_workflow::ExecutionStore>,
    conversations: Arc<dyn ConversationStore>,
    sessions: Arc<dyn SessionStore>,
}

impl Stores {
    async fn build(settings: &StorageSettings) -> Result<Self> {
        match settings.driver {
            StorageDriver::Memory => Ok(Self {
                history: Arc::new(MemoryHistory::new()),
                executions: Arc::new(MemoryExecutionStore::new()),
                conversations: Arc::new(MemoryConversationStore::new()),
                sessions: Arc::new(MemorySessionStore::new()),
            }),
            #[cfg(feature = "sqlite")]
            StorageDriver::Sqlite => {
                use anyhow::Context as _;
                let history_path = settings
                    .history_path
                    .as_deref()
                    .context("storage.history_path is required for the sqlite driver")?;
                let state_path = settings
                    .state_path
                    .as_deref()
                    .context("storage.state_path is required for the sqlite driver")?;
                let history = squad_history::SqliteHistory::open(history_path)
                    .await
                    .context("opening sqlite history")?;
                let state = Arc::new(
                    squad_store_sqlite::SqliteStore::open(state_path)
                        .await
                        .context("opening sqlite state store")?,
                );
                Ok(Self {
                    history: Arc::new(history),
                    executions: Arc::clone(&state) as Arc<dyn squad_workflow::ExecutionStore>,
                    conversations: Arc::clone(&state) as Arc<dyn ConversationStore>,
                    sessions: state as Arc<dyn SessionStore>,
                })
            }
            #[cfg(not(feature = "sqlite"))]
            StorageDriver::Sqlite => {
                anyhow::bail!("sqlite storage driver requested but the feature is not enabled")
            }
        }
    }
}

//─────────────────────────────
//  The assembled core
//─────────────────────────────

/// A running orchestration core.
pub struct SquadCore {
    bus: Arc<dyn MessageBus>,
    history: Arc<dyn HistoryStore>,
    sessions: Arc<dyn SessionStore>,
    workflow: Arc<WorkflowEngine>,
    factory: Arc<AgentFactory>,
    tracker: Arc<ConversationTracker>,
    conversations: Arc<dyn ConversationStore>,
    broadcaster: Arc<StreamBroadcaster>,
    orchestrator: Orchestrator,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl SquadCore {
    /// Assemble and start the core.
    ///
    /// The language model and tool set are the externally provided
    /// capabilities; everything else is constructed from configuration.
    pub async fn start(
        config: CoreConfig,
        definitions: RoleDefinitions,
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Self> {
        let stores = Stores::build(&config.storage).await?;

        let transport = Arc::new(InMemoryBus::new(config.bus.tuning.clone()));
        let bus: Arc<dyn MessageBus> = match config.bus.implementation {
            BusImplementation::Memory => transport,
            BusImplementation::Durable => {
                Arc::new(JournaledBus::new(transport, Arc::clone(&stores.history)))
            }
        };
        info!(implementation = ?config.bus.implementation, "message bus ready");

        let history = stores.history;
        let sessions = stores.sessions;
        let conversations = stores.conversations;
        let workflow = Arc::new(WorkflowEngine::new(
            stores.executions,
            Arc::clone(&history),
            Arc::clone(&bus),
        ));
        let factory = Arc::new(AgentFactory::new(
            definitions,
            Arc::clone(&bus),
            Arc::clone(&sessions),
            model,
            tools,
        ));

        let tracker = Arc::new(ConversationTracker::new(
            Arc::clone(&conversations),
            Arc::clone(&bus),
            factory.roster(),
            config.conversation.clone(),
        ));
        let broadcaster = Arc::new(StreamBroadcaster::new(
            config.stream.clone(),
            factory.roster(),
        ));

        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                lock_ttl: config.orchestrator.lock_ttl,
                execution_deadline: config.workflow.execution_deadline,
            },
            Arc::clone(&bus),
            Arc::clone(&workflow),
            Arc::clone(&factory),
            Arc::clone(&broadcaster),
            Arc::new(LockRegistry::new()),
        );

        let background = vec![
            Arc::clone(&tracker).spawn().await?,
            Arc::clone(&broadcaster).spawn(Arc::clone(&bus)).await?,
        ];
        info!("orchestration core started");

        Ok(Self {
            bus,
            history,
            sessions,
            workflow,
            factory,
            tracker,
            conversations,
            broadcaster,
            orchestrator,
            background,
        })
    }

    //───────────────────── operations ─────────────────────

    /// Execute a task with the given squad.
    pub async fn execute_task(
        &self,
        task: &Task,
        squad_id: SquadId,
        members: Vec<SquadMember>,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        self.orchestrator.launch(task, squad_id, members).await
    }

    /// Resolve a blocked execution.
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        resolution: impl Into<String>,
    ) -> Result<u8, OrchestratorError> {
        self.orchestrator.resume(execution_id, resolution).await
    }

    /// Current state of an execution.
    pub async fn execution(&self, execution_id: ExecutionId) -> Result<TaskExecution> {
        Ok(self.workflow.get(execution_id).await?)
    }

    /// Attach an external observer to an execution or squad.
    pub async fn subscribe_stream(
        &self,
        scope: StreamScope,
        audience: Audience,
        since_id: Option<u64>,
    ) -> StreamSubscription {
        self.broadcaster.subscribe(scope, audience, since_id).await
    }

    /// Ordered history retrieval.
    pub async fn query_history(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>> {
        Ok(self.history.query(query).await?)
    }

    /// Bus observability counters.
    pub async fn bus_stats(&self) -> BusStats {
        self.bus.stats().await
    }

    /// The agent factory.
    pub fn factory(&self) -> &Arc<AgentFactory> {
        &self.factory
    }

    /// The conversation tracker.
    pub fn tracker(&self) -> &Arc<ConversationTracker> {
        &self.tracker
    }

    /// The conversation store.
    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    /// The session store.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// The message bus.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Stop background tasks. Already-persisted state is unaffected.
    pub fn shutdown(&mut self) {
        for handle in self.background.drain(..) {
            handle.abort();
        }
        info!("orchestration core stopped");
    }
}

impl Drop for SquadCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.bus.implementation, BusImplementation::Durable);
        assert_eq!(config.bus.tuning.retention_messages, 1_000_000);
        assert_eq!(
            config.bus.tuning.retention_age,
            std::time::Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(
            config.conversation.ack_timeout,
            std::time::Duration::from_secs(60)
        );
        assert_eq!(
            config.conversation.answer_timeout,
            std::time::Duration::from_secs(600)
        );
        assert_eq!(config.conversation.max_escalation, 2);
        assert_eq!(config.stream.buffer_size, 256);
        assert_eq!(
            config.stream.heartbeat_interval,
            std::time::Duration::from_secs(15)
        );
        assert_eq!(
            config.orchestrator.lock_ttl,
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            config.workflow.execution_deadline,
            std::time::Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bus.implementation, config.bus.implementation);
        assert_eq!(back.conversation.ack_timeout, config.conversation.ack_timeout);
        assert_eq!(back.stream.buffer_size, config.stream.buffer_size);
    }
}
