//! Task and TaskAttempt: the executable units handed to a backend.
//!
//! A task is an immutable snapshot of one step run's command plus one
//! fully-ready input combination. Attempts are individual executions of
//! that snapshot; exactly one attempt is active at a time, and terminal
//! attempt statuses are one-way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::path::DataPath;
use crate::data::DataType;
use crate::ids::{DataNodeId, DataObjectId, RunId, TaskAttemptId, TaskId};
use crate::store::Entity;
use crate::template::{OutputSource, ResourceRequest};

/// Shared status vocabulary for tasks and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Killed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
        };
        write!(f, "{name}")
    }
}

/// One input channel's snapshot inside a task: a private flattened clone,
/// never the live tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub channel: String,
    pub data_type: DataType,
    pub tree: DataNodeId,
}

/// One output channel a task is expected to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub channel: String,
    pub data_type: DataType,
    pub source: OutputSource,
}

/// Immutable execution snapshot for one ready input combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub step_run: RunId,
    pub name: String,
    pub command: String,
    pub interpreter: String,
    pub environment: String,
    pub resources: ResourceRequest,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,
    /// Ready paths (one per input, input order) this task consumed.
    pub input_signature: Vec<DataPath>,
    /// Where this task's outputs land in the step run's output trees:
    /// the scatter path of its input combination.
    pub scatter_path: DataPath,
    pub attempts: Vec<TaskAttemptId>,
    pub active_attempt: Option<TaskAttemptId>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Terminal statuses are one-way; returns whether anything changed.
    pub fn transition(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        true
    }
}

impl Entity for Task {
    type Id = TaskId;
    const KIND: &'static str = "task";

    fn id(&self) -> TaskId {
        self.id
    }
}

/// Reference to a log file shipped by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFileRef {
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Timestamped event reported by the worker during an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timepoint {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub detail: Option<String>,
    pub is_error: bool,
}

/// Terminal failure details recorded on an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub message: String,
    pub detail: Option<String>,
}

/// Data objects produced for one output channel. One object for
/// filename/stream sources, many for glob sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOutput {
    pub channel: String,
    pub objects: Vec<DataObjectId>,
}

/// One execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: TaskAttemptId,
    pub task: TaskId,
    pub status: TaskStatus,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub log_files: Vec<LogFileRef>,
    pub timepoints: Vec<Timepoint>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub outputs: Vec<AttemptOutput>,
    pub failure: Option<AttemptFailure>,
    pub created_at: DateTime<Utc>,
}

impl TaskAttempt {
    pub fn new(task: TaskId) -> Self {
        Self {
            id: TaskAttemptId::new(),
            task,
            status: TaskStatus::Pending,
            container_id: None,
            image_id: None,
            log_files: Vec::new(),
            timepoints: Vec::new(),
            last_heartbeat: None,
            outputs: Vec::new(),
            failure: None,
            created_at: Utc::now(),
        }
    }

    /// Terminal statuses are one-way; returns whether anything changed.
    pub fn transition(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    pub fn add_timepoint(
        &mut self,
        message: impl Into<String>,
        detail: Option<String>,
        is_error: bool,
    ) {
        self.timepoints.push(Timepoint {
            timestamp: Utc::now(),
            message: message.into(),
            detail,
            is_error,
        });
    }
}

impl Entity for TaskAttempt {
    type Id = TaskAttemptId;
    const KIND: &'static str = "task attempt";

    fn id(&self) -> TaskAttemptId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_terminal_transitions_are_no_ops() {
        let mut attempt = TaskAttempt::new(TaskId::new());
        assert!(attempt.transition(TaskStatus::Running));
        assert!(attempt.transition(TaskStatus::Finished));
        assert!(!attempt.transition(TaskStatus::Failed));
        assert_eq!(attempt.status, TaskStatus::Finished);
    }
}
