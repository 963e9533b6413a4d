//! Run tree entities: mutable execution instances mirroring template shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::path::DataPath;
use crate::ids::{IoNodeId, RunId, TaskId, TemplateId};
use crate::store::Entity;

/// Shape discriminant shared by templates and runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Step,
    Workflow,
}

/// Lifecycle states of a run. Terminal states are entered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed | RunStatus::Killed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Waiting => "waiting",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
        };
        write!(f, "{name}")
    }
}

/// Idempotency phases for post-creation wiring. Two callers racing to
/// postprocess the same run do nothing twice: the claim from `Waiting`
/// to `InProgress` goes through the guarded save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostprocessingStatus {
    Waiting,
    InProgress,
    Done,
    Error,
}

/// Timestamped entry in a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub detail: Option<String>,
    pub is_error: bool,
}

impl RunEvent {
    pub fn new(message: impl Into<String>, detail: Option<String>, is_error: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            detail,
            is_error,
        }
    }
}

/// One claimed input combination of a step run, with the task that owns it.
/// Claims live on the run so the guarded save makes task creation
/// at-most-once per distinct combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSetClaim {
    pub signature: Vec<DataPath>,
    pub task: TaskId,
}

/// Mutable execution instance of one template node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub template: TemplateId,
    pub name: String,
    pub kind: RunKind,
    pub parent: Option<RunId>,
    /// Ordered child runs; non-empty only for workflow runs after
    /// postprocessing.
    pub children: Vec<RunId>,
    pub status: RunStatus,
    pub postprocessing_status: PostprocessingStatus,
    pub events: Vec<RunEvent>,
    /// Channel endpoints owned by this run.
    pub inputs: Vec<IoNodeId>,
    pub outputs: Vec<IoNodeId>,
    /// Internal connectors; workflow runs only.
    pub connectors: Vec<IoNodeId>,
    /// Step runs only: claimed input combinations and their tasks.
    pub input_set_claims: Vec<InputSetClaim>,
    /// Policy: a failed descendant kills unfinished sibling work.
    pub hard_stop_on_fail: bool,
    /// Policy: cancellation kills all descendant work immediately.
    pub hard_stop_on_cancel: bool,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        template: TemplateId,
        name: impl Into<String>,
        kind: RunKind,
        parent: Option<RunId>,
    ) -> Self {
        Self {
            id: RunId::new(),
            template,
            name: name.into(),
            kind,
            parent,
            children: Vec::new(),
            status: RunStatus::Waiting,
            postprocessing_status: PostprocessingStatus::Waiting,
            events: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            connectors: Vec::new(),
            input_set_claims: Vec::new(),
            hard_stop_on_fail: true,
            hard_stop_on_cancel: true,
            created_at: Utc::now(),
        }
    }

    pub fn add_event(&mut self, message: impl Into<String>, detail: Option<String>, is_error: bool) {
        self.events.push(RunEvent::new(message, detail, is_error));
    }

    /// Move to `status` unless already terminal. Returns whether the state
    /// actually changed; terminal states are one-way.
    pub fn transition(&mut self, status: RunStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    pub fn claim_for(&self, signature: &[DataPath]) -> Option<TaskId> {
        self.input_set_claims
            .iter()
            .find(|claim| claim.signature == signature)
            .map(|claim| claim.task)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.input_set_claims.iter().map(|claim| claim.task).collect()
    }
}

impl Entity for Run {
    type Id = RunId;
    const KIND: &'static str = "run";

    fn id(&self) -> RunId {
        self.id
    }
}
