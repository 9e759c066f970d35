//! Orchestrator behavior against a live in-process rig.

use std::sync::Arc;
use std::time::Duration;

use squad_agent_runtime::{MemorySessionStore, ScriptedModel, ToolRegistry};
use squad_bus_core::{subject, BusError, InMemoryBus, MessageBus};
use squad_history::MemoryHistory;
use squad_orchestration::{
    LockRegistry, Orchestrator, OrchestratorConfig, OrchestratorError, ROLE_HIERARCHY_VIOLATION,
};
use squad_registry::{AgentFactory, RoleDefinitions};
use squad_stream::{StreamBroadcaster, StreamConfig};
use squad_types::{
    AgentRole, ExecutionId, MessageMetadata, MessageType, ProjectId, SquadId, SquadMember, Task,
    WorkflowState,
};
use squad_workflow::{MemoryExecutionStore, WorkflowEngine};

struct Rig {
    bus: Arc<InMemoryBus>,
    orchestrator: Orchestrator,
    squad_id: SquadId,
    pm: SquadMember,
    tl: SquadMember,
    dev: SquadMember,
    task: Task,
}

fn member(squad_id: SquadId, role: AgentRole) -> SquadMember {
    SquadMember::new(squad_id, role, "anthropic", "claude-sonnet", "")
}

fn rig_with_config(config: OrchestratorConfig) -> Rig {
    let bus = Arc::new(InMemoryBus::with_defaults());
    let history = Arc::new(MemoryHistory::new());
    let workflow = Arc::new(WorkflowEngine::new(
        Arc::new(MemoryExecutionStore::new()),
        history,
        bus.clone(),
    ));
    let factory = Arc::new(AgentFactory::new(
        RoleDefinitions::builtin(),
        bus.clone(),
        Arc::new(MemorySessionStore::new()),
        Arc::new(ScriptedModel::new()),
        Arc::new(ToolRegistry::new()),
    ));
    let broadcaster = Arc::new(StreamBroadcaster::new(
        StreamConfig::default(),
        factory.roster(),
    ));
    let orchestrator = Orchestrator::new(
        config,
        bus.clone(),
        workflow,
        factory,
        broadcaster,
        Arc::new(LockRegistry::new()),
    );

    let squad_id = SquadId::new();
    let task = Task::new(
        ProjectId::new(),
        "Add /health endpoint",
        "Expose a liveness endpoint returning 200.",
    )
    .unwrap();
    Rig {
        bus,
        orchestrator,
        squad_id,
        pm: member(squad_id, AgentRole::ProjectManager),
        tl: member(squad_id, AgentRole::TechLead),
        dev: member(squad_id, AgentRole::BackendDeveloper),
        task,
    }
}

fn rig() -> Rig {
    rig_with_config(OrchestratorConfig::default())
}

async fn wait_for_state(
    orchestrator: &Orchestrator,
    execution_id: ExecutionId,
    expected: WorkflowState,
) {
    for _ in 0..300 {
        let execution = orchestrator.workflow().get(execution_id).await.unwrap();
        if execution.workflow_state == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let execution = orchestrator.workflow().get(execution_id).await.unwrap();
    panic!(
        "execution never reached {expected}; stuck in {}",
        execution.workflow_state
    );
}

#[tokio::test]
async fn launch_dispatches_to_pm_and_progresses_past_analysis() {
    let rig = rig();
    let handle = rig
        .orchestrator
        .launch(
            &rig.task,
            rig.squad_id,
            vec![rig.pm.clone(), rig.tl.clone(), rig.dev.clone()],
        )
        .await
        .unwrap();

    // PM auto-acknowledges the kickoff, which ends analysis.
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Planning).await;

    // The PM session is now recorded on the execution row.
    let execution = rig
        .orchestrator
        .workflow()
        .get(handle.execution_id)
        .await
        .unwrap();
    assert!(execution.pm_session_id.is_some());
    handle.abort();
}

#[tokio::test]
async fn pm_delegation_and_worker_ack_drive_the_workflow() {
    let rig = rig();
    let handle = rig
        .orchestrator
        .launch(
            &rig.task,
            rig.squad_id,
            vec![rig.pm.clone(), rig.tl.clone(), rig.dev.clone()],
        )
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Planning).await;

    // PM reasoning (external to the core) decides to delegate.
    let pm_worker = rig.orchestrator_factory_get(rig.pm.id);
    pm_worker
        .send_message(
            rig.dev.id,
            "implement the endpoint",
            MessageType::TaskAssignment,
            None,
        )
        .await
        .unwrap();

    // Delegation moves the plan out the door; the dev's automatic
    // acknowledgment starts the work.
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::InProgress).await;
    handle.abort();
}

#[tokio::test]
async fn invalid_delegation_is_dropped_and_answered() {
    let rig = rig();
    let handle = rig
        .orchestrator
        .launch(
            &rig.task,
            rig.squad_id,
            vec![rig.pm.clone(), rig.tl.clone(), rig.dev.clone()],
        )
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Planning).await;

    // Independent observers on both inboxes.
    let mut tl_inbox = rig
        .bus
        .subscribe(
            subject::inbox_pattern(handle.execution_id, rig.tl.id),
            "test-tl-observer",
        )
        .await
        .unwrap();
    let mut dev_inbox = rig
        .bus
        .subscribe(
            subject::inbox_pattern(handle.execution_id, rig.dev.id),
            "test-dev-observer",
        )
        .await
        .unwrap();

    // A developer tries to assign work to the tech lead.
    let dev_worker = rig.orchestrator_factory_get(rig.dev.id);
    let err = dev_worker
        .send_message(rig.tl.id, "you do it", MessageType::TaskAssignment, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        squad_agent_runtime::AgentRuntimeError::Bus(BusError::Rejected { .. })
    ));

    // The sender gets a system answer naming the violation.
    let mut saw_answer = false;
    for _ in 0..100 {
        if let Some(delivery) = dev_inbox.try_next() {
            let message = delivery.message.as_agent().unwrap().clone();
            delivery.ack();
            if message.message_type == MessageType::Answer
                && message.metadata.reason.as_deref() == Some(ROLE_HIERARCHY_VIOLATION)
            {
                saw_answer = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_answer, "system answer never arrived");

    // The tech lead's inbox never saw the assignment.
    while let Some(delivery) = tl_inbox.try_next() {
        let message = delivery.message.as_agent().unwrap().clone();
        delivery.ack();
        assert_ne!(message.message_type, MessageType::TaskAssignment);
    }
    handle.abort();
}

#[tokio::test]
async fn blocker_parks_and_resume_restores_the_execution() {
    let rig = rig();
    let handle = rig
        .orchestrator
        .launch(
            &rig.task,
            rig.squad_id,
            vec![rig.pm.clone(), rig.tl.clone(), rig.dev.clone()],
        )
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Planning).await;

    let pm_worker = rig.orchestrator_factory_get(rig.pm.id);
    pm_worker
        .send_message(rig.dev.id, "implement it", MessageType::TaskAssignment, None)
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::InProgress).await;

    // The developer hits a wall.
    let dev_worker = rig.orchestrator_factory_get(rig.dev.id);
    dev_worker
        .send_message(
            rig.pm.id,
            "cannot reach the database",
            MessageType::StatusUpdate,
            Some(MessageMetadata::blocker("missing DB credentials")),
        )
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Blocked).await;

    let blocked = rig
        .orchestrator
        .workflow()
        .get(handle.execution_id)
        .await
        .unwrap();
    assert_eq!(blocked.progress_pct, 62);
    assert_eq!(blocked.resumed_from, Some(WorkflowState::InProgress));

    // Resuming a non-blocked execution is refused.
    let progress = rig
        .orchestrator
        .resume(handle.execution_id, "creds provided")
        .await
        .unwrap();
    assert_eq!(progress, 62);
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::InProgress).await;

    let err = rig
        .orchestrator
        .resume(handle.execution_id, "again?")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotBlocked(_)));
    handle.abort();
}

#[tokio::test]
async fn completion_without_qa_finishes_the_execution() {
    let rig = rig();
    let handle = rig
        .orchestrator
        .launch(
            &rig.task,
            rig.squad_id,
            vec![rig.pm.clone(), rig.tl.clone(), rig.dev.clone()],
        )
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Planning).await;

    let pm_worker = rig.orchestrator_factory_get(rig.pm.id);
    pm_worker
        .send_message(rig.dev.id, "implement it", MessageType::TaskAssignment, None)
        .await
        .unwrap();
    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::InProgress).await;

    pm_worker
        .broadcast_message(
            squad_types::BroadcastScope::Execution,
            "all deliverables verified",
            MessageType::TaskCompletion,
            Some(MessageMetadata::public()),
        )
        .await
        .unwrap();

    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Completed).await;
    let execution = rig
        .orchestrator
        .workflow()
        .get(handle.execution_id)
        .await
        .unwrap();
    assert_eq!(execution.progress_pct, 100);
    assert!(execution.completed_at.is_some());
    handle.join().await;
}

#[tokio::test]
async fn execution_deadline_fails_the_run() {
    let config = OrchestratorConfig {
        execution_deadline: Duration::from_millis(200),
        ..OrchestratorConfig::default()
    };
    let rig = rig_with_config(config);
    let handle = rig
        .orchestrator
        .launch(
            &rig.task,
            rig.squad_id,
            vec![rig.pm.clone(), rig.tl.clone(), rig.dev.clone()],
        )
        .await
        .unwrap();

    wait_for_state(&rig.orchestrator, handle.execution_id, WorkflowState::Failed).await;
    let execution = rig
        .orchestrator
        .workflow()
        .get(handle.execution_id)
        .await
        .unwrap();
    assert_eq!(execution.error.as_deref(), Some("deadline_exceeded"));
    handle.join().await;
}

impl Rig {
    /// Workers are created by launch(); tests drive their outward behavior
    /// directly, standing in for the opaque LLM reasoning.
    fn orchestrator_factory_get(
        &self,
        agent_id: squad_types::AgentId,
    ) -> Arc<squad_agent_runtime::AgentWorker> {
        self.orchestrator
            .factory()
            .get(agent_id)
            .expect("worker not created")
    }
}
