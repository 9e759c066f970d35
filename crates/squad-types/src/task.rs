//! Tasks, task executions and the workflow state space.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AgentId, ExecutionId, ProjectId, SessionId, SquadId, TaskId};
use crate::time::now_ms;
use crate::{MAX_TASK_DESCRIPTION_LEN, MAX_TASK_TITLE_LEN};

//─────────────────────────────
//  Task record
//─────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet picked up by any execution.
    Pending,
    /// An execution is under way.
    InProgress,
    /// The current execution is blocked on an external dependency.
    Blocked,
    /// An execution finished successfully.
    Completed,
    /// The last execution failed terminally.
    Failed,
}

/// Scheduling priority of a task. Ordering is by urgency, so
/// `Urgent > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Lowest urgency.
    Low,
    /// Default urgency.
    Medium,
    /// Above-default urgency.
    High,
    /// Drop-everything urgency.
    Urgent,
}

/// A unit of work to be carried out by a squad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Project the task belongs to.
    pub project_id: ProjectId,
    /// Identifier in an external tracker, if imported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Short title.
    pub title: String,
    /// Full description handed to the project manager.
    pub description: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Agent the task is currently assigned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending, medium-priority task with validation.
    pub fn new(
        project_id: ProjectId,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, String> {
        let title = title.into();
        let description = description.into();
        if title.trim().is_empty() {
            return Err("task title cannot be empty".to_string());
        }
        if title.len() > MAX_TASK_TITLE_LEN {
            return Err(format!(
                "task title too long: {} > {}",
                title.len(),
                MAX_TASK_TITLE_LEN
            ));
        }
        if description.len() > MAX_TASK_DESCRIPTION_LEN {
            return Err(format!(
                "task description too long: {} > {}",
                description.len(),
                MAX_TASK_DESCRIPTION_LEN
            ));
        }
        Ok(Self {
            id: TaskId::new(),
            project_id,
            external_id: None,
            title,
            description,
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            assigned_to: None,
            created_at: now_ms(),
        })
    }
}

//─────────────────────────────
//  Workflow state space
//─────────────────────────────

/// State of a task execution inside the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Execution created, nothing dispatched yet.
    Pending,
    /// Project manager is analyzing the task.
    Analyzing,
    /// Project manager is producing a delegation plan.
    Planning,
    /// Work has been handed to the implementing agents.
    Delegated,
    /// Implementing agents are working.
    InProgress,
    /// Produced work is under review.
    Reviewing,
    /// QA is exercising the produced work.
    Testing,
    /// Execution finished successfully.
    Completed,
    /// Execution is parked on a blocker; pre-block state is preserved.
    Blocked,
    /// Execution failed terminally.
    Failed,
}

impl WorkflowState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    /// Deterministic progress percentage reached by entering this state.
    ///
    /// `Blocked` and `Failed` return `None`: entering them never alters the
    /// recorded progress.
    pub fn progress_target(&self) -> Option<u8> {
        match self {
            WorkflowState::Pending => Some(0),
            WorkflowState::Analyzing => Some(12),
            WorkflowState::Planning => Some(25),
            WorkflowState::Delegated => Some(37),
            WorkflowState::InProgress => Some(62),
            WorkflowState::Reviewing => Some(75),
            WorkflowState::Testing => Some(87),
            WorkflowState::Completed => Some(100),
            WorkflowState::Blocked | WorkflowState::Failed => None,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowState::Pending => "PENDING",
            WorkflowState::Analyzing => "ANALYZING",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::Delegated => "DELEGATED",
            WorkflowState::InProgress => "IN_PROGRESS",
            WorkflowState::Reviewing => "REVIEWING",
            WorkflowState::Testing => "TESTING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Blocked => "BLOCKED",
            WorkflowState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

//─────────────────────────────
//  Task execution record
//─────────────────────────────

/// One attempt at a task; owns all messages and conversations produced
/// while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Execution identifier.
    pub id: ExecutionId,
    /// Task being attempted.
    pub task_id: TaskId,
    /// Squad performing the attempt.
    pub squad_id: SquadId,
    /// Current workflow state.
    pub workflow_state: WorkflowState,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Set exactly when the execution reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal error description, if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Progress percentage in `[0, 100]`; monotonic outside block/resume.
    pub progress_pct: u8,
    /// State to restore on resume; persisted on entry to `Blocked`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<WorkflowState>,
    /// Session of the project manager driving this execution, once known.
    ///
    /// Stored on the execution so a replacement orchestrator can resume the
    /// PM exactly where the previous instance left off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_session_id: Option<SessionId>,
}

impl TaskExecution {
    /// Create a fresh execution in `Pending` at 0% progress.
    pub fn new(task_id: TaskId, squad_id: SquadId) -> Self {
        Self {
            id: ExecutionId::new(),
            task_id,
            squad_id,
            workflow_state: WorkflowState::Pending,
            started_at: now_ms(),
            completed_at: None,
            error: None,
            progress_pct: 0,
            resumed_from: None,
            pm_session_id: None,
        }
    }

    /// Check the record invariants: `completed_at` is set iff the state is
    /// terminal, and progress stays within `[0, 100]`.
    pub fn validate(&self) -> Result<(), String> {
        if self.workflow_state.is_terminal() != self.completed_at.is_some() {
            return Err(format!(
                "completed_at must be set exactly in terminal states (state={}, completed_at={:?})",
                self.workflow_state, self.completed_at
            ));
        }
        if self.progress_pct > 100 {
            return Err(format!("progress_pct out of range: {}", self.progress_pct));
        }
        Ok(())
    }
}

//─────────────────────────────
//  State change event
//─────────────────────────────

/// Notification of a workflow transition, journalled to history and fanned
/// out on the `state.{execution_id}` subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    /// Execution that transitioned.
    pub execution_id: ExecutionId,
    /// State before the transition.
    pub from: WorkflowState,
    /// State after the transition.
    pub to: WorkflowState,
    /// Progress after the transition.
    pub progress_pct: u8,
    /// Agent (or orchestrator identity) that triggered the transition.
    pub actor_id: AgentId,
    /// Free-text cause, e.g. a blocker reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the transition committed.
    pub at: DateTime<Utc>,
}
