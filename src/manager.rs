//! The pluggable execution backend boundary.
//!
//! The core hands a dispatch to a `TaskManager` and never waits on it; the
//! backend eventually reports through the ordinary attempt status-update
//! operations. Concrete backends (local process, cluster scheduler, cloud
//! VM) live outside this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ids::{TaskAttemptId, TaskId};
use crate::task::{Task, TaskAttempt};

/// Everything a backend needs to execute one attempt.
#[derive(Debug, Clone)]
pub struct TaskDispatch {
    pub task: Task,
    pub attempt: TaskAttempt,
}

/// Raised when a backend cannot accept a dispatch. Recorded on the attempt
/// as an execution failure; the core does not retry.
#[derive(Debug, thiserror::Error)]
#[error("task manager rejected dispatch: {0}")]
pub struct DispatchError(pub String);

/// Pluggable execution backend.
#[async_trait]
pub trait TaskManager: Send + Sync + 'static {
    /// Schedule an attempt. Must not block on execution; the backend calls
    /// back into the attempt status-update operations when it has news.
    async fn run(&self, dispatch: TaskDispatch) -> Result<(), DispatchError>;

    /// Best-effort cleanup of worker-side resources after completion.
    async fn delete_worker_resources(&self, attempt: TaskAttemptId);
}

/// Test backend that records dispatches; tests drive attempt completion by
/// hand through the engine's status-update operations.
#[derive(Default)]
pub struct RecordingManager {
    dispatches: Mutex<Vec<TaskDispatch>>,
    cleanups: Mutex<Vec<TaskAttemptId>>,
}

impl RecordingManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dispatches(&self) -> Vec<TaskDispatch> {
        self.dispatches.lock().expect("dispatches poisoned").clone()
    }

    pub fn dispatched_task_ids(&self) -> Vec<TaskId> {
        self.dispatches()
            .into_iter()
            .map(|dispatch| dispatch.task.id)
            .collect()
    }

    pub fn cleanups(&self) -> Vec<TaskAttemptId> {
        self.cleanups.lock().expect("cleanups poisoned").clone()
    }
}

#[async_trait]
impl TaskManager for RecordingManager {
    async fn run(&self, dispatch: TaskDispatch) -> Result<(), DispatchError> {
        self.dispatches
            .lock()
            .expect("dispatches poisoned")
            .push(dispatch);
        Ok(())
    }

    async fn delete_worker_resources(&self, attempt: TaskAttemptId) {
        self.cleanups.lock().expect("cleanups poisoned").push(attempt);
    }
}
