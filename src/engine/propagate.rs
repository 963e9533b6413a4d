//! Channel propagation: pushing newly-available data along the run tree.
//!
//! A push copies data object references from a sender's tree into each
//! receiver's tree, forwards through connectors, and triggers the task
//! check on step inputs. Pushing is idempotent: already-present leaves are
//! skipped, and a lost write-once race means another pusher got there
//! first.

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::channel::{IoFlavor, IoNode};
use crate::data::tree;
use crate::error::{DataError, EngineResult, SaveError};
use crate::ids::IoNodeId;
use crate::manager::TaskManager;
use crate::run::RunKind;
use crate::store::{EntityOps, Store};

use super::Engine;

impl<S: Store, M: TaskManager> Engine<S, M> {
    /// Notify every downstream receiver that data under `endpoint` may now
    /// be available. Safe to call repeatedly with the same state.
    pub(crate) fn push(&self, endpoint: IoNodeId) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            let sender = EntityOps::<IoNode>::get(&*self.store, endpoint).await?.record;
            let Some(sender_tree) = sender.tree else {
                trace!(endpoint = %sender.id, "push on endpoint with no tree yet");
                return Ok(());
            };

            let receivers = self.store.receivers_of(sender.id).await?;
            for receiver in receivers {
                let copied = self.copy_new_leaves(sender_tree, &receiver).await?;
                if copied > 0 {
                    debug!(
                        from = %sender.id,
                        to = %receiver.id,
                        channel = %receiver.channel,
                        copied,
                        "propagated data refs"
                    );
                }
                self.after_receive(&receiver).await?;
            }

            // A step input endpoint is itself the end of the line: data
            // arriving here means the step may have new ready combinations.
            if sender.flavor == IoFlavor::Input {
                let run = self.get_run(sender.run).await?;
                if run.kind == RunKind::Step {
                    self.create_ready_tasks(run.id).await?;
                }
            }
            Ok(())
        })
    }

    /// Reference-copy every leaf the receiver does not have yet. Returns
    /// how many leaves were newly copied.
    async fn copy_new_leaves(
        &self,
        sender_tree: crate::ids::DataNodeId,
        receiver: &IoNode,
    ) -> EngineResult<usize> {
        let receiver_tree = self.ensure_tree(receiver.id).await?;
        let leaves = tree::leaf_paths(&*self.store, sender_tree).await?;
        let mut copied = 0;
        for (path, leaf_id) in leaves {
            let leaf = EntityOps::<crate::data::tree::DataNode>::get(&*self.store, leaf_id)
                .await?
                .record;
            let Some(object) = leaf.data else { continue };
            match tree::get_node(&*self.store, receiver_tree, &path).await {
                Ok(existing) if existing.data.is_some() => continue,
                _ => {}
            }
            match tree::add_data_object(&*self.store, self.retries(), receiver_tree, &path, object)
                .await
            {
                Ok(_) => copied += 1,
                // Another pusher landed the same leaf first; the data is
                // identical by construction.
                Err(SaveError::Data(DataError::DataAlreadyExists { .. })) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(copied)
    }

    /// Forward a push through the receiving endpoint.
    async fn after_receive(&self, receiver: &IoNode) -> EngineResult<()> {
        match receiver.flavor {
            // Connectors and workflow-side endpoints forward onward.
            IoFlavor::Connector | IoFlavor::Output => self.push(receiver.id).await,
            IoFlavor::Input => {
                let run = self.get_run(receiver.run).await?;
                match run.kind {
                    RunKind::Step => {
                        self.create_ready_tasks(run.id).await?;
                        Ok(())
                    }
                    // A workflow input feeds the workflow's own connector.
                    RunKind::Workflow => self.push(receiver.id).await,
                }
            }
        }
    }
}
