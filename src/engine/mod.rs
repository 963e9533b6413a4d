//! The orchestration engine facade.
//!
//! Owns the store and the task-manager backend, and exposes the boundary
//! operations: create/read/cancel runs, attempt status updates, the data
//! object/node surface used by importers and workers, and worker settings.
//! The engine keeps no mutable state of its own; everything lives in the
//! store behind the optimistic guard.

mod inputs;
mod instantiate;
mod propagate;
mod status;
mod tasks;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::data::object::{DataObject, DataValue, FileData, Resource, UploadStatus};
use crate::data::tree::DataNode;
use crate::error::{EngineError, EngineResult, StoreError, ValidationError};
use crate::guard::save_with_retries;
use crate::ids::{DataNodeId, DataObjectId, ResourceId, RunId, TaskAttemptId, TemplateId};
use crate::manager::TaskManager;
use crate::run::{Run, RunEvent, RunKind};
use crate::store::{EntityOps, Store};
use crate::task::{Task, TaskAttempt};
use crate::template::{validate_template, Template};
use crate::worker::WorkerSettings;

/// A named input value in a run request: a JSON literal (scalar or nested
/// array), or references to already-registered data objects.
#[derive(Debug, Clone)]
pub enum RunInput {
    Literal(serde_json::Value),
    Reference(DataObjectId),
    References(Vec<DataObjectId>),
}

/// Request to instantiate a template.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub name: String,
    /// Channel name to supplied value.
    pub inputs: BTreeMap<String, RunInput>,
    /// Policy overrides; engine config defaults apply when unset.
    pub hard_stop_on_fail: Option<bool>,
    pub hard_stop_on_cancel: Option<bool>,
}

/// A run with its children and tasks, resolved recursively for reads.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run: Run,
    pub children: Vec<RunView>,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: Task,
    pub attempts: Vec<TaskAttempt>,
}

/// The orchestration engine. Cheap to clone; all state is in the store.
pub struct Engine<S, M> {
    pub(crate) store: Arc<S>,
    pub(crate) manager: Arc<M>,
    pub(crate) config: EngineConfig,
}

impl<S, M> Clone for Engine<S, M> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            manager: Arc::clone(&self.manager),
            config: self.config.clone(),
        }
    }
}

impl<S: Store, M: TaskManager> Engine<S, M> {
    pub fn new(store: Arc<S>, manager: Arc<M>, config: EngineConfig) -> Self {
        Self {
            store,
            manager,
            config,
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.config.max_save_retries
    }

    /// Validate and store an immutable template. Children must be imported
    /// first; a workflow referencing absent children fails validation.
    pub async fn import_template(&self, template: Template) -> EngineResult<TemplateId> {
        validate_template(&*self.store, &template).await?;
        let id = template.id;
        EntityOps::<Template>::insert(&*self.store, template).await?;
        info!(template = %id, "template imported");
        Ok(id)
    }

    pub async fn get_template(&self, id: TemplateId) -> EngineResult<Template> {
        Ok(EntityOps::<Template>::get(&*self.store, id).await?.record)
    }

    /// Create a run from a template plus named input values, wire the run
    /// tree, materialize inputs, and start propagation.
    pub async fn create_run(
        &self,
        template: TemplateId,
        request: RunRequest,
    ) -> EngineResult<Run> {
        let template_record = self.get_template(template).await?;

        // Reject unknown channels before creating anything.
        for channel in request.inputs.keys() {
            if template_record.input(channel).is_none() {
                return Err(ValidationError::UnknownInputChannel {
                    channel: channel.clone(),
                }
                .into());
            }
        }
        for input in &template_record.inputs {
            if !request.inputs.contains_key(&input.channel) && input.default.is_none() {
                return Err(ValidationError::MissingInput {
                    channel: input.channel.clone(),
                }
                .into());
            }
        }

        let run = self
            .create_run_node(&template_record, request.name.clone(), None, &request)
            .await?;
        info!(run = %run.id, name = %run.name, "run created");

        // Request-supplied values land before postprocessing, so default
        // application sees their trees and leaves those channels alone.
        // Channels the request omits fall back to their template defaults
        // inside postprocessing.
        let mut fed = Vec::new();
        for input in &template_record.inputs {
            let Some(value) = request.inputs.get(&input.channel) else {
                continue;
            };
            let endpoint = self
                .input_endpoint(run.id, &input.channel)
                .await?
                .ok_or_else(|| ValidationError::UnknownInputChannel {
                    channel: input.channel.clone(),
                })?;
            self.materialize_input(&endpoint, input, value.clone()).await?;
            fed.push(endpoint.id);
        }

        self.postprocess(run.id).await?;

        // Propagation waits for the wiring postprocessing establishes.
        for endpoint in fed {
            self.push(endpoint).await?;
        }
        self.start_ready_steps(run.id).await?;

        Ok(self.get_run(run.id).await?)
    }

    pub async fn get_run(&self, id: RunId) -> EngineResult<Run> {
        Ok(EntityOps::<Run>::get(&*self.store, id).await?.record)
    }

    pub async fn find_runs(&self, name_prefix: &str) -> EngineResult<Vec<Run>> {
        Ok(self.store.runs_by_name_prefix(name_prefix).await?)
    }

    /// Resolve a run with all descendants and tasks, for boundary reads.
    pub async fn get_run_view(&self, id: RunId) -> EngineResult<RunView> {
        let run = self.get_run(id).await?;
        let mut tasks = Vec::new();
        for task_id in run.task_ids() {
            // The input-set claim commits before the task row is inserted;
            // a read in that window simply skips the not-yet-visible task.
            let task = match EntityOps::<Task>::get(&*self.store, task_id).await {
                Ok(versioned) => versioned.record,
                Err(StoreError::NotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            let attempts = self.store.attempts_of_task(task_id).await?;
            tasks.push(TaskView { task, attempts });
        }
        let mut children = Vec::new();
        for child in &run.children {
            children.push(Box::pin(self.get_run_view(*child)).await?);
        }
        Ok(RunView {
            run,
            children,
            tasks,
        })
    }

    /// Cancel a run: mark it killed and, per its cancellation policy, kill
    /// all descendant work. Does not wait for backend teardown.
    pub async fn cancel_run(&self, id: RunId, message: impl Into<String>) -> EngineResult<()> {
        if self.get_run(id).await?.status.is_terminal() {
            return Err(EngineError::RunTerminal(id));
        }
        self.kill_run(id, message.into()).await?;
        // Cancellation of a child still aggregates into its ancestors.
        let run = self.get_run(id).await?;
        if let Some(parent) = run.parent {
            self.update_workflow_status(parent).await?;
        }
        Ok(())
    }

    /// The chain of error events that led to a run's failure, deepest
    /// cause first.
    pub async fn failure_chain(&self, id: RunId) -> EngineResult<Vec<RunEvent>> {
        let run = self.get_run(id).await?;
        let mut chain = Vec::new();
        for child in &run.children {
            chain.extend(Box::pin(self.failure_chain(*child)).await?);
        }
        chain.extend(run.events.into_iter().filter(|event| event.is_error));
        Ok(chain)
    }

    /// Worker settings for one attempt.
    pub async fn worker_settings(&self, attempt: TaskAttemptId) -> EngineResult<WorkerSettings> {
        let attempt = EntityOps::<TaskAttempt>::get(&*self.store, attempt).await?.record;
        Ok(WorkerSettings::for_attempt(
            &self.config,
            attempt.task,
            attempt.id,
        ))
    }

    // ------------------------------------------------------------------
    // Data object / resource boundary (importers and workers)
    // ------------------------------------------------------------------

    /// Register a scalar data object.
    pub async fn post_data_object(&self, value: DataValue) -> EngineResult<DataObject> {
        let object = DataObject::new(value);
        EntityOps::<DataObject>::insert(&*self.store, object.clone()).await?;
        Ok(object)
    }

    /// Register a file object with a fresh incomplete upload resource.
    /// The importer marks the resource complete once bytes have landed.
    pub async fn post_file_object(
        &self,
        filename: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> EngineResult<DataObject> {
        let resource = Resource::initialize();
        let resource_id = resource.id;
        EntityOps::<Resource>::insert(&*self.store, resource).await?;
        self.post_data_object(DataValue::File(FileData {
            filename: filename.into(),
            content_hash: content_hash.into(),
            resource: resource_id,
        }))
        .await
    }

    pub async fn get_data_object(&self, id: DataObjectId) -> EngineResult<DataObject> {
        Ok(EntityOps::<DataObject>::get(&*self.store, id).await?.record)
    }

    pub async fn get_data_node(&self, id: DataNodeId) -> EngineResult<DataNode> {
        Ok(EntityOps::<DataNode>::get(&*self.store, id).await?.record)
    }

    pub async fn get_resource(&self, id: ResourceId) -> EngineResult<Resource> {
        Ok(EntityOps::<Resource>::get(&*self.store, id).await?.record)
    }

    /// Flip an upload resource to complete and re-evaluate readiness,
    /// since the finished upload may have unblocked waiting step inputs.
    pub async fn mark_resource_complete(&self, id: ResourceId) -> EngineResult<()> {
        save_with_retries(&*self.store, id, self.retries(), |resource: &mut Resource| {
            resource.upload_status = UploadStatus::Complete;
            Ok(())
        })
        .await?;
        for run in self.store.runs_by_name_prefix("").await? {
            if run.kind == RunKind::Step && !run.status.is_terminal() {
                self.create_ready_tasks(run.id).await?;
            }
        }
        Ok(())
    }
}
