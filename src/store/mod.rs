//! Storage interfaces for the orchestration core.
//!
//! Every mutable entity is versioned; writes go through `compare_and_swap`
//! so concurrent writers from request handlers and attempt callbacks cannot
//! silently lose updates. Any transactional store with row-level optimistic
//! versioning can implement this surface; `MemoryStore` is the bundled one.

mod memory;

pub use memory::MemoryStore;

use std::fmt::Display;
use std::hash::Hash;

use async_trait::async_trait;

use crate::channel::IoNode;
use crate::data::object::{DataObject, Resource};
use crate::data::tree::DataNode;
use crate::error::StoreResult;
use crate::ids::{IoNodeId, RunId, TaskId};
use crate::run::Run;
use crate::task::{Task, TaskAttempt};
use crate::template::Template;

/// A record plus the version observed when it was read.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub record: T,
    pub version: u64,
}

/// A storable entity with a typed identifier.
pub trait Entity: Clone + Send + Sync + 'static {
    type Id: Copy + Eq + Hash + Display + Send + Sync + 'static;

    /// Entity kind label used in errors and logs.
    const KIND: &'static str;

    fn id(&self) -> Self::Id;
}

/// Versioned read/write operations for one entity type.
#[async_trait]
pub trait EntityOps<T: Entity>: Send + Sync {
    /// Insert a new record at version 1. Fails if the id already exists.
    async fn insert(&self, record: T) -> StoreResult<()>;

    async fn get(&self, id: T::Id) -> StoreResult<Versioned<T>>;

    /// Commit `record` only if the stored version still equals
    /// `expected_version`; fails with `ConcurrentModification` otherwise.
    async fn compare_and_swap(&self, expected_version: u64, record: T) -> StoreResult<()>;
}

/// Cross-entity lookups the engine needs beyond by-id access.
#[async_trait]
pub trait StoreQueries: Send + Sync {
    /// All channel endpoints owned by a run.
    async fn endpoints_of_run(&self, run: RunId) -> StoreResult<Vec<IoNode>>;

    /// All tasks created for a step run.
    async fn tasks_of_run(&self, run: RunId) -> StoreResult<Vec<Task>>;

    /// All attempts of a task, in creation order.
    async fn attempts_of_task(&self, task: TaskId) -> StoreResult<Vec<TaskAttempt>>;

    /// Runs whose name starts with `prefix`, for boundary queries.
    async fn runs_by_name_prefix(&self, prefix: &str) -> StoreResult<Vec<Run>>;

    /// Endpoint of `run` on `channel` with the given directional flavor.
    async fn endpoint_on_channel(
        &self,
        run: RunId,
        channel: &str,
        flavor: crate::channel::IoFlavor,
    ) -> StoreResult<Option<IoNode>>;

    /// Endpoints whose `sender` is the given endpoint.
    async fn receivers_of(&self, endpoint: IoNodeId) -> StoreResult<Vec<IoNode>>;
}

/// Full store surface consumed by the engine.
pub trait Store:
    EntityOps<Template>
    + EntityOps<Run>
    + EntityOps<DataNode>
    + EntityOps<DataObject>
    + EntityOps<Resource>
    + EntityOps<IoNode>
    + EntityOps<Task>
    + EntityOps<TaskAttempt>
    + StoreQueries
    + Send
    + Sync
    + 'static
{
}

impl<S> Store for S where
    S: EntityOps<Template>
        + EntityOps<Run>
        + EntityOps<DataNode>
        + EntityOps<DataObject>
        + EntityOps<Resource>
        + EntityOps<IoNode>
        + EntityOps<Task>
        + EntityOps<TaskAttempt>
        + StoreQueries
        + Send
        + Sync
        + 'static
{
}
