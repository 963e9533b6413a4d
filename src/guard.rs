//! Optimistic-concurrency save discipline.
//!
//! `save_with_retries` is the only path by which shared run/task/data-node
//! state is written: read a versioned copy, apply the mutation in memory,
//! commit only if the version is unchanged, and re-read + re-apply on
//! conflict up to a small bound. A mutation that rejects the current state
//! aborts immediately without retrying.

use tracing::{debug, warn};

use crate::error::{SaveError, StoreError};
use crate::store::{Entity, EntityOps, Versioned};

/// Apply `mutate` to the stored record under compare-and-swap, retrying on
/// version conflicts up to `max_retries` additional times. Returns the
/// committed record.
pub async fn save_with_retries<T, S, F>(
    store: &S,
    id: T::Id,
    max_retries: u32,
    mut mutate: F,
) -> Result<T, SaveError>
where
    T: Entity,
    S: EntityOps<T> + ?Sized,
    F: FnMut(&mut T) -> Result<(), SaveError> + Send,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let Versioned { mut record, version } = store.get(id).await?;
        mutate(&mut record)?;
        match store.compare_and_swap(version, record.clone()).await {
            Ok(()) => {
                if attempts > 1 {
                    debug!(
                        entity = T::KIND,
                        %id,
                        attempts,
                        "optimistic save committed after retry"
                    );
                }
                return Ok(record);
            }
            Err(StoreError::ConcurrentModification) => {
                if attempts > max_retries {
                    warn!(entity = T::KIND, %id, attempts, "optimistic save gave up");
                    return Err(SaveError::RetriesExceeded { attempts });
                }
                debug!(entity = T::KIND, %id, attempts, "version conflict, re-reading");
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreResult;
    use crate::ids::TemplateId;
    use crate::run::{Run, RunKind, RunStatus};
    use crate::store::MemoryStore;

    /// Store wrapper that forces version conflicts for the first
    /// `conflicts` commits by dirtying the record behind the caller's back.
    struct ConflictInjector {
        inner: MemoryStore,
        remaining: AtomicU32,
    }

    impl ConflictInjector {
        fn new(inner: MemoryStore, conflicts: u32) -> Self {
            Self {
                inner,
                remaining: AtomicU32::new(conflicts),
            }
        }
    }

    #[async_trait]
    impl EntityOps<Run> for ConflictInjector {
        async fn insert(&self, record: Run) -> StoreResult<()> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: crate::ids::RunId) -> StoreResult<Versioned<Run>> {
            EntityOps::<Run>::get(&self.inner, id).await
        }

        async fn compare_and_swap(&self, expected_version: u64, record: Run) -> StoreResult<()> {
            let stolen = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stolen {
                // A concurrent writer wins the race: bump the version with
                // an unrelated touch, then let the caller's commit collide.
                let current = EntityOps::<Run>::get(&self.inner, record.id).await?;
                let mut touched = current.record.clone();
                touched.add_event("interloper", None, false);
                self.inner
                    .compare_and_swap(current.version, touched)
                    .await?;
            }
            self.inner.compare_and_swap(expected_version, record).await
        }
    }

    async fn seeded(store: &impl EntityOps<Run>) -> crate::ids::RunId {
        let run = Run::new(TemplateId::new(), "guarded", RunKind::Step, None);
        let id = run.id;
        store.insert(run).await.unwrap();
        id
    }

    #[tokio::test]
    async fn conflict_is_retried_then_committed() {
        let store = ConflictInjector::new(MemoryStore::new(), 1);
        let id = seeded(&store).await;

        let run = save_with_retries(&store, id, 5, |run: &mut Run| {
            run.transition(RunStatus::Running);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(run.status, RunStatus::Running);
        // The interloper's event survived: no lost update in either
        // direction.
        let current = EntityOps::<Run>::get(&store, id).await.unwrap();
        assert_eq!(current.record.status, RunStatus::Running);
        assert_eq!(current.record.events.len(), 1);
    }

    #[tokio::test]
    async fn unbounded_conflicts_exhaust_retries() {
        let store = ConflictInjector::new(MemoryStore::new(), u32::MAX);
        let id = seeded(&store).await;

        let err = save_with_retries(&store, id, 3, |run: &mut Run| {
            run.transition(RunStatus::Running);
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SaveError::RetriesExceeded { attempts: 4 }));
    }

    #[tokio::test]
    async fn rejecting_mutation_aborts_without_retry() {
        let store = ConflictInjector::new(MemoryStore::new(), 0);
        let id = seeded(&store).await;

        let err = save_with_retries(&store, id, 5, |_run: &mut Run| {
            Err(SaveError::Rejected("state says no".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SaveError::Rejected(_)));
        let current = EntityOps::<Run>::get(&store, id).await.unwrap();
        assert_eq!(current.version, 1);
    }
}
