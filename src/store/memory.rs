//! In-memory store backing tests and local runs.
//!
//! One versioned arena per entity type behind a mutex. Versions start at 1
//! on insert and bump on every successful compare-and-swap, which is all
//! the optimistic guard needs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::channel::{IoFlavor, IoNode};
use crate::data::object::{DataObject, Resource};
use crate::data::tree::DataNode;
use crate::error::{StoreError, StoreResult};
use crate::ids::{IoNodeId, RunId, TaskId};
use crate::run::Run;
use crate::task::{Task, TaskAttempt};
use crate::template::Template;

use super::{Entity, EntityOps, StoreQueries, Versioned};

struct Arena<T: Entity> {
    records: Mutex<FxHashMap<T::Id, Versioned<T>>>,
}

impl<T: Entity> Default for Arena<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<T: Entity> Arena<T> {
    fn insert(&self, record: T) -> StoreResult<()> {
        let mut records = self.records.lock().expect("arena poisoned");
        let id = record.id();
        if records.contains_key(&id) {
            return Err(StoreError::Message(format!(
                "{} {id} already exists",
                T::KIND
            )));
        }
        records.insert(id, Versioned { record, version: 1 });
        Ok(())
    }

    fn get(&self, id: T::Id) -> StoreResult<Versioned<T>> {
        self.records
            .lock()
            .expect("arena poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(T::KIND, id))
    }

    fn compare_and_swap(&self, expected_version: u64, record: T) -> StoreResult<()> {
        let mut records = self.records.lock().expect("arena poisoned");
        let id = record.id();
        let slot = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(T::KIND, id))?;
        if slot.version != expected_version {
            return Err(StoreError::ConcurrentModification);
        }
        slot.record = record;
        slot.version += 1;
        Ok(())
    }

    fn scan<F>(&self, mut keep: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.records
            .lock()
            .expect("arena poisoned")
            .values()
            .filter(|versioned| keep(&versioned.record))
            .map(|versioned| versioned.record.clone())
            .collect()
    }
}

/// Store keeping everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Arenas>,
}

#[derive(Default)]
struct Arenas {
    templates: Arena<Template>,
    runs: Arena<Run>,
    data_nodes: Arena<DataNode>,
    data_objects: Arena<DataObject>,
    resources: Arena<Resource>,
    io_nodes: Arena<IoNode>,
    tasks: Arena<Task>,
    attempts: Arena<TaskAttempt>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

macro_rules! entity_ops {
    ($entity:ty, $arena:ident) => {
        #[async_trait]
        impl EntityOps<$entity> for MemoryStore {
            async fn insert(&self, record: $entity) -> StoreResult<()> {
                self.inner.$arena.insert(record)
            }

            async fn get(
                &self,
                id: <$entity as Entity>::Id,
            ) -> StoreResult<Versioned<$entity>> {
                self.inner.$arena.get(id)
            }

            async fn compare_and_swap(
                &self,
                expected_version: u64,
                record: $entity,
            ) -> StoreResult<()> {
                self.inner.$arena.compare_and_swap(expected_version, record)
            }
        }
    };
}

entity_ops!(Template, templates);
entity_ops!(Run, runs);
entity_ops!(DataNode, data_nodes);
entity_ops!(DataObject, data_objects);
entity_ops!(Resource, resources);
entity_ops!(IoNode, io_nodes);
entity_ops!(Task, tasks);
entity_ops!(TaskAttempt, attempts);

#[async_trait]
impl StoreQueries for MemoryStore {
    async fn endpoints_of_run(&self, run: RunId) -> StoreResult<Vec<IoNode>> {
        Ok(self.inner.io_nodes.scan(|node| node.run == run))
    }

    async fn tasks_of_run(&self, run: RunId) -> StoreResult<Vec<Task>> {
        let mut tasks = self.inner.tasks.scan(|task| task.step_run == run);
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn attempts_of_task(&self, task: TaskId) -> StoreResult<Vec<TaskAttempt>> {
        let mut attempts = self.inner.attempts.scan(|attempt| attempt.task == task);
        attempts.sort_by_key(|attempt| attempt.created_at);
        Ok(attempts)
    }

    async fn runs_by_name_prefix(&self, prefix: &str) -> StoreResult<Vec<Run>> {
        let mut runs = self.inner.runs.scan(|run| run.name.starts_with(prefix));
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn endpoint_on_channel(
        &self,
        run: RunId,
        channel: &str,
        flavor: IoFlavor,
    ) -> StoreResult<Option<IoNode>> {
        Ok(self
            .inner
            .io_nodes
            .scan(|node| node.run == run && node.channel == channel && node.flavor == flavor)
            .into_iter()
            .next())
    }

    async fn receivers_of(&self, endpoint: IoNodeId) -> StoreResult<Vec<IoNode>> {
        Ok(self.inner.io_nodes.scan(|node| node.sender == Some(endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Run, RunKind};
    use crate::ids::TemplateId;

    #[tokio::test]
    async fn insert_then_get_round_trips_at_version_one() {
        let store = MemoryStore::new();
        let run = Run::new(TemplateId::new(), "demo", RunKind::Step, None);
        let id = run.id;
        EntityOps::<Run>::insert(&store, run).await.unwrap();
        let versioned = EntityOps::<Run>::get(&store, id).await.unwrap();
        assert_eq!(versioned.version, 1);
        assert_eq!(versioned.record.name, "demo");
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let run = Run::new(TemplateId::new(), "demo", RunKind::Step, None);
        let id = run.id;
        EntityOps::<Run>::insert(&store, run).await.unwrap();

        let fresh = EntityOps::<Run>::get(&store, id).await.unwrap();
        let mut first = fresh.record.clone();
        first.name = "first".to_string();
        EntityOps::<Run>::compare_and_swap(&store, fresh.version, first)
            .await
            .unwrap();

        let mut second = fresh.record;
        second.name = "second".to_string();
        let err = EntityOps::<Run>::compare_and_swap(&store, fresh.version, second)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentModification));

        let current = EntityOps::<Run>::get(&store, id).await.unwrap();
        assert_eq!(current.record.name, "first");
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        let run = Run::new(TemplateId::new(), "demo", RunKind::Step, None);
        EntityOps::<Run>::insert(&store, run.clone()).await.unwrap();
        assert!(EntityOps::<Run>::insert(&store, run).await.is_err());
    }
}
