//! The per-execution orchestrator.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use squad_bus_core::{subject, BusMessage, BusPayload, MessageBus};
use squad_registry::AgentFactory;
use squad_stream::StreamBroadcaster;
use squad_types::{
    AgentId, AgentMessage, AgentRole, MessageMetadata, MessageType, Roster, SquadId, SquadMember,
    Task, TaskExecution, WorkflowState,
};
use squad_workflow::{WorkflowEngine, WorkflowError};

use crate::guard::{DelegationGuard, RejectedDelegation};
use crate::lock::{LockGuard, LockRegistry};
use crate::{OrchestratorConfig, OrchestratorError, DEADLINE_EXCEEDED};

/// Drives task executions for one process.
///
/// Cheap to clone; all state is shared behind `Arc`s.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    actor_id: AgentId,
    bus: Arc<dyn MessageBus>,
    workflow: Arc<WorkflowEngine>,
    factory: Arc<AgentFactory>,
    broadcaster: Arc<StreamBroadcaster>,
    locks: Arc<LockRegistry>,
}

struct DriveState {
    pm: SquadMember,
    qa_present: bool,
    pm_responded: bool,
    awaiting_qa: bool,
    blocked_by: Option<AgentId>,
}

struct DriveSubscriptions {
    messages: squad_bus_core::Subscription,
    states: squad_bus_core::Subscription,
}

impl Orchestrator {
    /// Create an orchestrator over the shared components.
    pub fn new(
        config: OrchestratorConfig,
        bus: Arc<dyn MessageBus>,
        workflow: Arc<WorkflowEngine>,
        factory: Arc<AgentFactory>,
        broadcaster: Arc<StreamBroadcaster>,
        locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            config,
            actor_id: AgentId::new(),
            bus,
            workflow,
            factory,
            broadcaster,
            locks,
        }
    }

    /// System identity this orchestrator acts under.
    pub fn actor_id(&self) -> AgentId {
        self.actor_id
    }

    /// The workflow engine driving this orchestrator's executions.
    pub fn workflow(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }

    /// The agent factory this orchestrator spawns squads from.
    pub fn factory(&self) -> &Arc<AgentFactory> {
        &self.factory
    }

    /// Create an execution for `task`, spawn the squad and dispatch the
    /// task to the project manager. Returns once the execution is running.
    #[instrument(skip_all, fields(task = %task.id, squad = %squad_id))]
    pub async fn launch(
        &self,
        task: &Task,
        squad_id: SquadId,
        members: Vec<SquadMember>,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        let pm = members
            .iter()
            .find(|m| m.role == AgentRole::ProjectManager)
            .cloned()
            .ok_or(OrchestratorError::NoProjectManager)?;

        let execution = self.workflow.create_execution(task.id, squad_id).await?;
        self.broadcaster.register_execution(execution.id, squad_id);

        let lock = self.locks.acquire(
            execution.id,
            format!("orchestrator-{}", self.actor_id),
            self.config.lock_ttl,
        )?;

        let rejections = self.install_guard(&execution, &members);
        let subscriptions = self.attach(execution.id).await?;
        let worker_handles = self.spawn_squad(&execution, &members, None).await?;

        self.workflow
            .transition(execution.id, WorkflowState::Analyzing, self.actor_id, None)
            .await?;
        self.dispatch_task(&execution, &pm, task).await?;

        let qa_present = members.iter().any(|m| m.role == AgentRole::QaTester);
        let state = DriveState {
            pm,
            qa_present,
            pm_responded: false,
            awaiting_qa: false,
            blocked_by: None,
        };
        let driver = tokio::spawn(self.clone().drive(
            execution.id,
            lock,
            subscriptions,
            rejections,
            state,
            worker_handles,
        ));
        info!(execution_id = %execution.id, "execution launched");
        Ok(ExecutionHandle {
            execution_id: execution.id,
            driver,
        })
    }

    /// Take ownership of an existing execution after the previous
    /// orchestrator died. The project manager resumes its recorded
    /// session.
    pub async fn adopt(
        &self,
        execution_id: squad_types::ExecutionId,
        members: Vec<SquadMember>,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        let execution = self.workflow.get(execution_id).await?;
        let pm = members
            .iter()
            .find(|m| m.role == AgentRole::ProjectManager)
            .cloned()
            .ok_or(OrchestratorError::NoProjectManager)?;

        self.broadcaster.register_execution(execution.id, execution.squad_id);
        let lock = self.locks.acquire(
            execution.id,
            format!("orchestrator-{}", self.actor_id),
            self.config.lock_ttl,
        )?;
        let rejections = self.install_guard(&execution, &members);
        let subscriptions = self.attach(execution.id).await?;
        let worker_handles = self
            .spawn_squad(&execution, &members, execution.pm_session_id)
            .await?;

        let qa_present = members.iter().any(|m| m.role == AgentRole::QaTester);
        let state = DriveState {
            pm,
            qa_present,
            pm_responded: execution.pm_session_id.is_some(),
            awaiting_qa: false,
            blocked_by: None,
        };
        let driver = tokio::spawn(self.clone().drive(
            execution.id,
            lock,
            subscriptions,
            rejections,
            state,
            worker_handles,
        ));
        info!(execution_id = %execution.id, "execution adopted");
        Ok(ExecutionHandle {
            execution_id: execution.id,
            driver,
        })
    }

    /// Resolve a blocked execution with an external decision.
    pub async fn resume(
        &self,
        execution_id: squad_types::ExecutionId,
        resolution: impl Into<String>,
    ) -> Result<u8, OrchestratorError> {
        let execution = self.workflow.get(execution_id).await?;
        if execution.workflow_state != WorkflowState::Blocked {
            return Err(OrchestratorError::NotBlocked(execution_id));
        }
        let target = execution
            .resumed_from
            .ok_or(WorkflowError::NoResumeState(execution_id))?;
        let progress = self
            .workflow
            .transition(execution_id, target, self.actor_id, Some(resolution.into()))
            .await?;
        info!(execution_id = %execution_id, state = %target, "execution resumed");
        Ok(progress)
    }

    //───────────────────── launch plumbing ─────────────────────

    fn install_guard(
        &self,
        execution: &TaskExecution,
        members: &[SquadMember],
    ) -> mpsc::UnboundedReceiver<RejectedDelegation> {
        let roles = Arc::new(DashMap::new());
        for member in members {
            roles.insert(member.id, member.role);
        }
        let system_senders = Arc::new(DashMap::new());
        system_senders.insert(self.actor_id, ());
        let (guard, rejections) = DelegationGuard::new(execution.id, roles, system_senders);
        self.bus.register_guard(Arc::new(guard));
        rejections
    }

    async fn spawn_squad(
        &self,
        execution: &TaskExecution,
        members: &[SquadMember],
        pm_session: Option<squad_types::SessionId>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, OrchestratorError> {
        let mut handles = Vec::with_capacity(members.len());
        for member in members {
            let session = (member.role == AgentRole::ProjectManager)
                .then_some(pm_session)
                .flatten();
            let worker = self
                .factory
                .create(member.clone(), execution.id, session)
                .await?;
            // Subscriptions must exist before the kickoff is dispatched,
            // otherwise an early message is lost.
            let subscriptions = worker.attach().await?;
            handles.push(worker.receive_loop(subscriptions));
        }
        Ok(handles)
    }

    async fn dispatch_task(
        &self,
        execution: &TaskExecution,
        pm: &SquadMember,
        task: &Task,
    ) -> Result<(), OrchestratorError> {
        let assignment = AgentMessage::direct(
            execution.id,
            self.actor_id,
            pm.id,
            MessageType::TaskAssignment,
            format!("{}\n\n{}", task.title, task.description),
        );
        let subject = subject::agent_inbox(execution.id, pm.role, pm.id);
        self.bus
            .publish(BusMessage::agent(assignment, subject))
            .await?;
        Ok(())
    }

    //───────────────────── the drive loop ─────────────────────

    async fn attach(
        &self,
        execution_id: squad_types::ExecutionId,
    ) -> Result<DriveSubscriptions, OrchestratorError> {
        Ok(DriveSubscriptions {
            messages: self
                .bus
                .subscribe(
                    subject::execution_messages(execution_id),
                    &format!("orchestrator-{execution_id}-messages"),
                )
                .await?,
            states: self
                .bus
                .subscribe(
                    subject::execution_state_changes(execution_id),
                    &format!("orchestrator-{execution_id}-states"),
                )
                .await?,
        })
    }

    async fn drive(
        self,
        execution_id: squad_types::ExecutionId,
        lock: LockGuard,
        subscriptions: DriveSubscriptions,
        mut rejections: mpsc::UnboundedReceiver<RejectedDelegation>,
        mut state: DriveState,
        worker_handles: Vec<tokio::task::JoinHandle<()>>,
    ) {
        let DriveSubscriptions {
            mut messages,
            mut states,
        } = subscriptions;

        let renew_every = (self.config.lock_ttl / 3).max(std::time::Duration::from_millis(100));
        let mut renew = tokio::time::interval(renew_every);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(self.config.execution_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                delivery = messages.next() => {
                    let Some(delivery) = delivery else { break };
                    if let BusPayload::Agent(message) = &delivery.message.payload {
                        self.observe_message(execution_id, message, &mut state).await;
                    }
                    delivery.ack();
                }
                delivery = states.next() => {
                    let Some(delivery) = delivery else { break };
                    let terminal = matches!(
                        &delivery.message.payload,
                        BusPayload::State(change) if change.to.is_terminal()
                    );
                    delivery.ack();
                    if terminal {
                        info!(execution_id = %execution_id, "execution reached a terminal state");
                        break;
                    }
                }
                rejection = rejections.recv() => {
                    if let Some(rejection) = rejection {
                        self.answer_rejection(execution_id, rejection).await;
                    }
                }
                _ = renew.tick() => {
                    if !lock.renew() {
                        warn!(execution_id = %execution_id, "ownership lost; aborting orchestration");
                        break;
                    }
                }
                _ = &mut deadline => {
                    warn!(execution_id = %execution_id, "execution deadline exceeded");
                    self.fail_execution(execution_id).await;
                    break;
                }
            }
        }

        for handle in worker_handles {
            handle.abort();
        }
        drop(lock);
    }

    async fn observe_message(
        &self,
        execution_id: squad_types::ExecutionId,
        message: &AgentMessage,
        state: &mut DriveState,
    ) {
        if message.sender_id == self.actor_id {
            return;
        }
        let sender_role = self
            .factory
            .roster()
            .member(message.sender_id)
            .await
            .map(|m| m.role);

        // The PM's first reaction marks the end of analysis.
        if message.sender_id == state.pm.id && !state.pm_responded {
            state.pm_responded = true;
            self.record_pm_session(execution_id, state).await;
            self.try_transition(execution_id, WorkflowState::Planning, message.sender_id, None)
                .await;
        }

        match message.message_type {
            MessageType::TaskAssignment => {
                // PM (or TL) handing out work: the plan is now delegated.
                self.try_transition(
                    execution_id,
                    WorkflowState::Delegated,
                    message.sender_id,
                    None,
                )
                .await;
            }
            MessageType::StatusUpdate if message.metadata.is_blocked() => {
                self.block_execution(execution_id, message, state).await;
            }
            MessageType::StatusUpdate if message.flags.acknowledgment => {
                if sender_role.map(|r| r.is_worker_tier()).unwrap_or(false) {
                    self.try_transition(
                        execution_id,
                        WorkflowState::InProgress,
                        message.sender_id,
                        None,
                    )
                    .await;
                }
                if state.awaiting_qa && sender_role == Some(AgentRole::QaTester) {
                    self.try_transition(
                        execution_id,
                        WorkflowState::Completed,
                        message.sender_id,
                        None,
                    )
                    .await;
                }
            }
            MessageType::CodeReviewRequest => {
                self.try_transition(
                    execution_id,
                    WorkflowState::Reviewing,
                    message.sender_id,
                    None,
                )
                .await;
            }
            MessageType::CodeReviewResponse => {
                self.try_transition(execution_id, WorkflowState::Testing, message.sender_id, None)
                    .await;
            }
            MessageType::HumanInterventionRequired => {
                self.block_execution(execution_id, message, state).await;
            }
            MessageType::TaskCompletion if message.sender_id == state.pm.id => {
                self.handle_completion_claim(execution_id, message, state).await;
            }
            MessageType::Answer => {
                if state.blocked_by.is_some() && message.recipient_id == state.blocked_by {
                    if let Ok(progress) = self.resume(execution_id, "blocker answered").await {
                        debug!(execution_id = %execution_id, progress, "blocker resolved by answer");
                        state.blocked_by = None;
                    }
                }
            }
            _ => {}
        }

        if state.awaiting_qa
            && sender_role == Some(AgentRole::QaTester)
            && (message.metadata.is_blocked() || message.metadata.reason.is_some())
        {
            self.try_transition(
                execution_id,
                WorkflowState::Failed,
                message.sender_id,
                Some("qa_rejected".to_string()),
            )
            .await;
        }
    }

    async fn handle_completion_claim(
        &self,
        execution_id: squad_types::ExecutionId,
        message: &AgentMessage,
        state: &mut DriveState,
    ) {
        // Best-effort drive to TESTING; each edge is validated by the
        // engine and already-passed stages are simply skipped.
        self.try_transition(execution_id, WorkflowState::Reviewing, message.sender_id, None)
            .await;
        self.try_transition(execution_id, WorkflowState::Testing, message.sender_id, None)
            .await;
        if state.qa_present {
            state.awaiting_qa = true;
            debug!(execution_id = %execution_id, "completion claimed, awaiting QA acknowledgment");
        } else {
            self.try_transition(
                execution_id,
                WorkflowState::Completed,
                message.sender_id,
                None,
            )
            .await;
        }
    }

    async fn block_execution(
        &self,
        execution_id: squad_types::ExecutionId,
        message: &AgentMessage,
        state: &mut DriveState,
    ) {
        let reason = message
            .metadata
            .reason
            .clone()
            .unwrap_or_else(|| message.content.clone());
        let blocked = self
            .try_transition(
                execution_id,
                WorkflowState::Blocked,
                message.sender_id,
                Some(reason),
            )
            .await;
        if blocked {
            state.blocked_by = Some(message.sender_id);
        }
    }

    async fn record_pm_session(
        &self,
        execution_id: squad_types::ExecutionId,
        state: &DriveState,
    ) {
        let Some(worker) = self.factory.get(state.pm.id) else {
            return;
        };
        if let Some(session_id) = worker.session_id().await {
            if let Err(e) = self.workflow.record_pm_session(execution_id, session_id).await {
                warn!(execution_id = %execution_id, error = %e, "could not record PM session");
            }
        }
    }

    async fn answer_rejection(
        &self,
        execution_id: squad_types::ExecutionId,
        rejection: RejectedDelegation,
    ) {
        warn!(
            execution_id = %execution_id,
            sender = %rejection.message.sender_id,
            reason = %rejection.reason,
            "invalid delegation dropped"
        );
        self.broadcaster
            .publish_log(
                execution_id,
                json!({
                    "event": "invalid_delegation",
                    "message_id": rejection.message.id,
                    "sender_id": rejection.message.sender_id,
                    "reason": rejection.reason,
                }),
            )
            .await;

        let sender_role = self
            .factory
            .roster()
            .member(rejection.message.sender_id)
            .await
            .map(|m| m.role)
            .unwrap_or(AgentRole::ProjectManager);
        let answer = AgentMessage::direct(
            execution_id,
            self.actor_id,
            rejection.message.sender_id,
            MessageType::Answer,
            format!(
                "Your task_assignment was rejected: {}. Delegation flows down the role hierarchy.",
                rejection.reason
            ),
        )
        .replying_to(rejection.message.id)
        .with_metadata(MessageMetadata {
            reason: Some(rejection.reason),
            ..MessageMetadata::default()
        });
        let subject =
            subject::agent_inbox(execution_id, sender_role, rejection.message.sender_id);
        if let Err(e) = self.bus.publish(BusMessage::agent(answer, subject)).await {
            warn!(execution_id = %execution_id, error = %e, "rejection answer could not be published");
        }
    }

    async fn fail_execution(&self, execution_id: squad_types::ExecutionId) {
        let failed = self
            .try_transition(
                execution_id,
                WorkflowState::Failed,
                self.actor_id,
                Some(DEADLINE_EXCEEDED.to_string()),
            )
            .await;
        if !failed {
            // States without a direct Failed edge go through Blocked.
            self.try_transition(
                execution_id,
                WorkflowState::Blocked,
                self.actor_id,
                Some(DEADLINE_EXCEEDED.to_string()),
            )
            .await;
            self.try_transition(
                execution_id,
                WorkflowState::Failed,
                self.actor_id,
                Some(DEADLINE_EXCEEDED.to_string()),
            )
            .await;
        }
    }

    async fn try_transition(
        &self,
        execution_id: squad_types::ExecutionId,
        to: WorkflowState,
        actor_id: AgentId,
        reason: Option<String>,
    ) -> bool {
        match self.workflow.transition(execution_id, to, actor_id, reason).await {
            Ok(_) => true,
            Err(WorkflowError::IllegalTransition { from, .. }) => {
                debug!(execution_id = %execution_id, %from, %to, "transition not applicable");
                false
            }
            Err(e) => {
                warn!(execution_id = %execution_id, %to, error = %e, "transition failed");
                false
            }
        }
    }
}

/// Handle to a launched execution.
pub struct ExecutionHandle {
    /// The execution being driven.
    pub execution_id: squad_types::ExecutionId,
    driver: tokio::task::JoinHandle<()>,
}

impl ExecutionHandle {
    /// Wait for the orchestration loop to finish (terminal state, lost
    /// lock or deadline).
    pub async fn join(self) {
        let _ = self.driver.await;
    }

    /// Abort the orchestration loop without waiting.
    pub fn abort(&self) {
        self.driver.abort();
    }
}
