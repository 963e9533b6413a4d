//! Error taxonomies for the orchestration core.
//!
//! Split by how callers are expected to react:
//! - `DataError` / `ValidationError`: structural violations, never retried,
//!   surfaced to the immediate caller.
//! - `StoreError::ConcurrentModification`: retried locally by the guard,
//!   escalating to `SaveError::RetriesExceeded`.
//! - Execution failures are not errors at this level: a failed attempt is
//!   recorded as run/task state and propagated through the status cascade.

use crate::data::path::DataPath;
use crate::ids::{DataNodeId, IoNodeId, RunId, TaskAttemptId, TaskId, TemplateId};

/// Structural errors raised by the data tree / data object layer.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("degree mismatch at {node}: expected {expected}, path declares {declared}")]
    DegreeMismatch {
        node: DataNodeId,
        expected: u32,
        declared: u32,
    },

    #[error("index {index} out of range for degree {degree}")]
    IndexOutOfRange { index: u32, degree: u32 },

    #[error("degree of node {node} is not yet known")]
    UnknownDegree { node: DataNodeId },

    #[error("data already exists at {path} (leaves are write-once)")]
    DataAlreadyExists { path: DataPath },

    #[error("missing branch at {path}")]
    MissingBranch { path: DataPath },

    #[error("nested array given where a scalar of type {expected} was declared")]
    NestedArraysError { expected: crate::data::DataType },

    #[error("type mismatch: declared {declared}, value is {found}")]
    TypeMismatch { declared: crate::data::DataType, found: String },
}

/// Errors raised by a store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entity's version moved between read and write.
    #[error("concurrent modification detected")]
    ConcurrentModification,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the guarded save path.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("optimistic save gave up after {attempts} attempts")]
    RetriesExceeded { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The mutation itself rejected the current state; never retried.
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("{0}")]
    Rejected(String),
}

/// Template graph validation errors, raised at import time.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("channel {channel} in workflow {workflow} has no producer")]
    MissingProducer { workflow: TemplateId, channel: String },

    #[error("channel {channel} in workflow {workflow} has more than one producer")]
    DuplicateProducer { workflow: TemplateId, channel: String },

    #[error("endpoint {endpoint} already has a sender")]
    SenderAlreadySet { endpoint: IoNodeId },

    #[error("workflow template {template} has no children")]
    EmptyWorkflow { template: TemplateId },

    #[error("workflow {workflow} references unknown child template {child}")]
    UnknownChildTemplate { workflow: TemplateId, child: TemplateId },

    #[error("run request names unknown input channel {channel}")]
    UnknownInputChannel { channel: String },

    #[error("no value supplied for input channel {channel} and no default declared")]
    MissingInput { channel: String },
}

/// Umbrella error for engine boundary operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    // From<SaveError> is implemented manually so data/store causes unwrap
    // to their own variants.
    #[error(transparent)]
    Save(SaveError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {0} is terminal")]
    RunTerminal(RunId),

    #[error("task {0} is terminal")]
    TaskTerminal(TaskId),

    #[error("attempt {0} is not the active attempt of its task")]
    StaleAttempt(TaskAttemptId),
}

impl From<SaveError> for EngineError {
    fn from(err: SaveError) -> Self {
        match err {
            SaveError::Data(data) => EngineError::Data(data),
            SaveError::Store(store) => EngineError::Store(store),
            other => EngineError::Save(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
