//! Execution row storage.
//!
//! The execution row is mutated exclusively through the workflow engine;
//! the store trait only exists so the engine can be backed by memory in
//! tests and by a relational store in production.

use dashmap::DashMap;

use squad_types::{ExecutionId, TaskExecution};

use crate::WorkflowError;

/// Storage of `TaskExecution` rows.
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a freshly created execution.
    async fn insert(&self, execution: TaskExecution) -> Result<(), WorkflowError>;

    /// Load an execution by id.
    async fn get(&self, id: ExecutionId) -> Result<Option<TaskExecution>, WorkflowError>;

    /// Replace an execution row. Callers other than the workflow engine
    /// are a bug.
    async fn update(&self, execution: TaskExecution) -> Result<(), WorkflowError>;
}

/// In-memory execution store.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    rows: DashMap<ExecutionId, TaskExecution>,
}

impl MemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, execution: TaskExecution) -> Result<(), WorkflowError> {
        self.rows.insert(execution.id, execution);
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<TaskExecution>, WorkflowError> {
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    async fn update(&self, execution: TaskExecution) -> Result<(), WorkflowError> {
        match self.rows.get_mut(&execution.id) {
            Some(mut row) => {
                *row = execution;
                Ok(())
            }
            None => Err(WorkflowError::UnknownExecution(execution.id)),
        }
    }
}
