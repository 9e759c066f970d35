#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-workflow** – Finite state machine over task executions.
//!
//! The engine is the sole writer of `TaskExecution` rows. A transition is a
//! single operation that validates the edge, journals the workflow event to
//! history, updates the row, and publishes a `state_changed` notice on the
//! `state.{execution_id}` subject. The steps run under a per-execution
//! lock, so external observers see either all of them or none.
//!
//! Progress percentages are a deterministic function of state. Entering
//! `Blocked` preserves progress and persists the pre-block state on the
//! row; resuming restores that state. `Failed` freezes progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use squad_bus_core::{BusMessage, MessageBus};
use squad_history::{HistoryEntry, HistoryPayload, HistoryStore, MonotonicClock};
use squad_types::{
    AgentId, EventId, ExecutionId, SessionId, SquadId, StateChanged, TaskExecution, TaskId,
    WorkflowState,
};

pub mod store;
pub mod transitions;

pub use store::{ExecutionStore, MemoryExecutionStore};
pub use transitions::{is_valid, successors};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The requested edge is not part of the state machine.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: WorkflowState,
        /// Requested state.
        to: WorkflowState,
    },
    /// No execution with the given id exists.
    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),
    /// A resume was requested but no pre-block state is recorded.
    #[error("execution {0} has no recorded pre-block state")]
    NoResumeState(ExecutionId),
    /// The execution store failed.
    #[error("execution store error: {0}")]
    Store(String),
    /// Journaling or event publication failed.
    #[error("workflow event emission failed: {0}")]
    Emission(String),
}

impl squad_types::Classify for WorkflowError {
    fn class(&self) -> squad_types::ErrorClass {
        match self {
            WorkflowError::IllegalTransition { .. } | WorkflowError::NoResumeState(_) => {
                squad_types::ErrorClass::Permanent
            }
            WorkflowError::UnknownExecution(_) => squad_types::ErrorClass::Permanent,
            WorkflowError::Store(_) | WorkflowError::Emission(_) => {
                squad_types::ErrorClass::Transient
            }
        }
    }
}

//─────────────────────────────
//  Time-in-state accounting
//─────────────────────────────

/// Accumulated wall-clock timing of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTiming {
    /// Time spent in non-blocked states.
    pub working: chrono::Duration,
    /// Time spent in `Blocked`.
    pub blocked: chrono::Duration,
}

impl Default for ExecutionTiming {
    fn default() -> Self {
        Self {
            working: chrono::Duration::zero(),
            blocked: chrono::Duration::zero(),
        }
    }
}

#[derive(Debug)]
struct TimingSlot {
    state: WorkflowState,
    entered_at: DateTime<Utc>,
    totals: ExecutionTiming,
}

//─────────────────────────────
//  The engine
//─────────────────────────────

/// Task-execution state machine.
pub struct WorkflowEngine {
    executions: Arc<dyn ExecutionStore>,
    history: Arc<dyn HistoryStore>,
    bus: Arc<dyn MessageBus>,
    clock: MonotonicClock,
    // Serializes the transition pipeline per execution.
    gates: DashMap<ExecutionId, Arc<Mutex<()>>>,
    timings: DashMap<ExecutionId, TimingSlot>,
}

impl WorkflowEngine {
    /// Create an engine over the given stores and bus.
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        history: Arc<dyn HistoryStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            executions,
            history,
            bus,
            clock: MonotonicClock::new(),
            gates: DashMap::new(),
            timings: DashMap::new(),
        }
    }

    /// Create a fresh execution in `Pending`.
    pub async fn create_execution(
        &self,
        task_id: TaskId,
        squad_id: SquadId,
    ) -> Result<TaskExecution, WorkflowError> {
        let execution = TaskExecution::new(task_id, squad_id);
        self.executions.insert(execution.clone()).await?;
        self.timings.insert(
            execution.id,
            TimingSlot {
                state: WorkflowState::Pending,
                entered_at: squad_types::time::now_ms(),
                totals: ExecutionTiming::default(),
            },
        );
        info!(execution_id = %execution.id, task_id = %task_id, "execution created");
        Ok(execution)
    }

    /// Load an execution row.
    pub async fn get(&self, id: ExecutionId) -> Result<TaskExecution, WorkflowError> {
        self.executions
            .get(id)
            .await?
            .ok_or(WorkflowError::UnknownExecution(id))
    }

    /// Record the project manager's session on the execution row.
    pub async fn record_pm_session(
        &self,
        id: ExecutionId,
        session_id: SessionId,
    ) -> Result<(), WorkflowError> {
        let gate = self.gate(id);
        let _held = gate.lock().await;
        let mut execution = self.get(id).await?;
        execution.pm_session_id = Some(session_id);
        self.executions.update(execution).await
    }

    /// Accumulated working/blocked time of an execution.
    pub fn timing(&self, id: ExecutionId) -> Option<ExecutionTiming> {
        self.timings.get(&id).map(|slot| slot.totals)
    }

    /// Perform a state transition.
    ///
    /// Returns the progress percentage after the transition.
    #[instrument(skip(self), fields(execution_id = %execution_id, to = %to))]
    pub async fn transition(
        &self,
        execution_id: ExecutionId,
        to: WorkflowState,
        actor_id: AgentId,
        reason: Option<String>,
    ) -> Result<u8, WorkflowError> {
        let gate = self.gate(execution_id);
        let _held = gate.lock().await;

        let mut execution = self.get(execution_id).await?;
        let from = execution.workflow_state;

        self.validate_edge(&execution, to)?;

        // Progress: deterministic per state; Blocked/Failed leave it
        // untouched, resume resets to the restored state's value.
        execution.progress_pct = match to.progress_target() {
            Some(target) if from == WorkflowState::Blocked => target,
            Some(target) => execution.progress_pct.max(target),
            None => execution.progress_pct,
        };

        match to {
            WorkflowState::Blocked => {
                execution.resumed_from = Some(from);
            }
            WorkflowState::Failed => {
                execution.error = reason.clone();
            }
            _ if from == WorkflowState::Blocked => {
                execution.resumed_from = None;
            }
            _ => {}
        }
        execution.workflow_state = to;

        let at = self.clock.now().await;
        if to.is_terminal() {
            execution.completed_at = Some(at);
        }

        let change = StateChanged {
            execution_id,
            from,
            to,
            progress_pct: execution.progress_pct,
            actor_id,
            reason,
            at,
        };
        let envelope = BusMessage::state(change.clone());

        // Journal first; the entry id mirrors the envelope id so a
        // journaling bus downstream no-ops instead of duplicating.
        self.history
            .append(HistoryEntry {
                id: EventId(envelope.id),
                execution_id,
                created_at: at,
                payload: HistoryPayload::StateChange(change),
            })
            .await
            .map_err(|e| WorkflowError::Emission(e.to_string()))?;

        self.executions.update(execution.clone()).await?;
        self.track_timing(&execution, at);

        if let Err(e) = self.bus.publish(envelope).await {
            warn!(execution_id = %execution_id, error = %e, "state_changed publication failed");
            return Err(WorkflowError::Emission(e.to_string()));
        }

        info!(
            execution_id = %execution_id,
            %from,
            %to,
            progress = execution.progress_pct,
            "workflow transition committed"
        );
        Ok(execution.progress_pct)
    }

    fn validate_edge(
        &self,
        execution: &TaskExecution,
        to: WorkflowState,
    ) -> Result<(), WorkflowError> {
        let from = execution.workflow_state;
        if from == WorkflowState::Blocked {
            if to == WorkflowState::Failed {
                return Ok(());
            }
            return match execution.resumed_from {
                Some(previous) if previous == to => Ok(()),
                Some(_) => Err(WorkflowError::IllegalTransition { from, to }),
                None => Err(WorkflowError::NoResumeState(execution.id)),
            };
        }
        if transitions::is_valid(from, to) {
            Ok(())
        } else {
            Err(WorkflowError::IllegalTransition { from, to })
        }
    }

    fn track_timing(&self, execution: &TaskExecution, at: DateTime<Utc>) {
        let mut slot = self
            .timings
            .entry(execution.id)
            .or_insert_with(|| TimingSlot {
                state: execution.workflow_state,
                entered_at: at,
                totals: ExecutionTiming::default(),
            });
        let elapsed = at - slot.entered_at;
        if slot.state == WorkflowState::Blocked {
            slot.totals.blocked = slot.totals.blocked + elapsed;
        } else {
            slot.totals.working = slot.totals.working + elapsed;
        }
        slot.state = execution.workflow_state;
        slot.entered_at = at;
    }

    fn gate(&self, id: ExecutionId) -> Arc<Mutex<()>> {
        self.gates
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
