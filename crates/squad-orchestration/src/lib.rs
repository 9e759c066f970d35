#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-orchestration** – Drives one task execution end-to-end.
//!
//! The orchestrator creates the execution, spawns the squad's agents via
//! the registry, dispatches the task to the project manager and then
//! observes the bus: PM-driven delegation advances the workflow engine,
//! blockers and terminal escalations park the execution in `Blocked`, and
//! a completion claim (QA-acknowledged where a QA member exists) finishes
//! it.
//!
//! Ownership of an execution is exclusive: a short-lived lease keyed by
//! execution id, renewed by heartbeat. Delegation rules are enforced
//! independently of PM reasoning by a publish guard installed on the bus,
//! so an invalid `task_assignment` never reaches its recipient's inbox.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use squad_types::ExecutionId;

mod guard;
mod lock;
mod orchestrator;

pub use guard::{DelegationGuard, RejectedDelegation, ROLE_HIERARCHY_VIOLATION};
pub use lock::{LockGuard, LockRegistry};
pub use orchestrator::{ExecutionHandle, Orchestrator};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning knobs of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// TTL of the execution ownership lease.
    #[serde(with = "squad_types::time::serde_secs")]
    pub lock_ttl: Duration,
    /// Overall deadline for one execution.
    #[serde(with = "squad_types::time::serde_secs")]
    pub execution_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            execution_deadline: Duration::from_secs(24 * 3600),
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by orchestration.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Another orchestrator owns the execution.
    #[error("execution {0} is owned by another orchestrator")]
    LockContention(ExecutionId),
    /// The squad has no project manager to dispatch to.
    #[error("squad has no project manager")]
    NoProjectManager,
    /// The execution is not blocked, so there is nothing to resume.
    #[error("execution {0} is not blocked")]
    NotBlocked(ExecutionId),
    /// Workflow engine failure.
    #[error(transparent)]
    Workflow(#[from] squad_workflow::WorkflowError),
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] squad_registry::RegistryError),
    /// Bus failure.
    #[error(transparent)]
    Bus(#[from] squad_bus_core::BusError),
    /// Agent runtime failure while dispatching.
    #[error(transparent)]
    Agent(#[from] squad_agent_runtime::AgentRuntimeError),
}

impl squad_types::Classify for OrchestratorError {
    fn class(&self) -> squad_types::ErrorClass {
        use squad_types::{Classify, ErrorClass};
        match self {
            OrchestratorError::LockContention(_) => ErrorClass::Transient,
            OrchestratorError::NoProjectManager | OrchestratorError::NotBlocked(_) => {
                ErrorClass::Permanent
            }
            OrchestratorError::Workflow(e) => e.class(),
            OrchestratorError::Registry(e) => e.class(),
            OrchestratorError::Bus(e) => e.class(),
            OrchestratorError::Agent(e) => e.class(),
        }
    }
}

/// Reason recorded when the execution deadline expires.
pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
