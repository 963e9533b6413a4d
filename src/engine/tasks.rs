//! Task/attempt lifecycle: turning ready input combinations into
//! dispatched work, and folding attempt outcomes back into the run tree.

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::data::path::{DataPath, PathSegment};
use crate::data::tree;
use crate::error::{DataError, EngineError, EngineResult, SaveError};
use crate::ids::{RunId, TaskAttemptId, TaskId};
use crate::manager::{TaskDispatch, TaskManager};
use crate::run::{InputSetClaim, Run, RunKind, RunStatus};
use crate::store::{EntityOps, Store};
use crate::task::{
    AttemptFailure, AttemptOutput, Task, TaskAttempt, TaskInput, TaskOutput, TaskStatus,
};
use crate::template::TemplateSpec;

use super::Engine;

/// One fully-ready combination across all of a step's inputs.
struct InputSet {
    /// Per input, in template order: the ready group's path and node.
    members: Vec<tree::ReadyNode>,
}

impl InputSet {
    fn signature(&self) -> Vec<DataPath> {
        self.members.iter().map(|member| member.path.clone()).collect()
    }

    /// Where outputs of this combination land in the step's output trees:
    /// the deepest scatter path among the members.
    fn scatter_path(&self) -> DataPath {
        self.members
            .iter()
            .map(|member| &member.path)
            .max_by_key(|path| path.len())
            .cloned()
            .unwrap_or_default()
    }
}

impl<S: Store, M: TaskManager> Engine<S, M> {
    /// Create one task per ready, unclaimed input combination of a step
    /// run, and dispatch an attempt for each. At-most-once per combination
    /// is guaranteed by claiming signatures on the run under the guard.
    pub(crate) async fn create_ready_tasks(&self, run_id: RunId) -> EngineResult<Vec<TaskId>> {
        let run = self.get_run(run_id).await?;
        if run.kind != RunKind::Step || run.status.is_terminal() {
            return Ok(Vec::new());
        }
        let template = self.get_template(run.template).await?;
        let TemplateSpec::Step(step) = &template.spec else {
            return Ok(Vec::new());
        };

        let Some(input_sets) = self.ready_input_sets(&run, &template).await? else {
            return Ok(Vec::new());
        };

        let mut created = Vec::new();
        for set in input_sets {
            let signature = set.signature();
            let task_id = TaskId::new();

            let mut claimed = false;
            save_with_retries_run(self, run_id, |run| {
                claimed = run.claim_for(&signature).is_none();
                if claimed {
                    run.input_set_claims.push(InputSetClaim {
                        signature: signature.clone(),
                        task: task_id,
                    });
                    run.transition(RunStatus::Running);
                }
                Ok(())
            })
            .await?;
            if !claimed {
                continue;
            }

            // Private snapshots: attempts address inputs flat, never
            // through the live shared trees.
            let mut inputs = Vec::with_capacity(set.members.len());
            for (declared, member) in template.inputs.iter().zip(&set.members) {
                let snapshot = tree::flattened_clone(&*self.store, member.node).await?;
                inputs.push(TaskInput {
                    channel: declared.channel.clone(),
                    data_type: declared.data_type,
                    tree: snapshot,
                });
            }
            let outputs = template
                .outputs
                .iter()
                .map(|output| TaskOutput {
                    channel: output.channel.clone(),
                    data_type: output.data_type,
                    source: output.source.clone(),
                })
                .collect();

            let attempt = TaskAttempt::new(task_id);
            let attempt_id = attempt.id;
            let task = Task {
                id: task_id,
                step_run: run_id,
                name: template.name.clone(),
                command: step.command.clone(),
                interpreter: step.interpreter.clone(),
                environment: step.environment.clone(),
                resources: step.resources,
                inputs,
                outputs,
                input_signature: signature,
                scatter_path: set.scatter_path(),
                attempts: vec![attempt_id],
                active_attempt: Some(attempt_id),
                status: TaskStatus::Pending,
                created_at: Utc::now(),
            };
            EntityOps::<Task>::insert(&*self.store, task.clone()).await?;
            EntityOps::<TaskAttempt>::insert(&*self.store, attempt.clone()).await?;
            info!(task = %task_id, run = %run_id, step = %template.name, "task created");
            created.push(task_id);

            self.dispatch(TaskDispatch { task, attempt });
        }

        if !created.is_empty() {
            self.update_step_run_status(run_id).await?;
        }
        Ok(created)
    }

    /// Walk a freshly instantiated run tree and evaluate readiness on
    /// every step. Steps without inputs, or fed purely by defaults, have
    /// no upstream push to wake them.
    pub(crate) fn start_ready_steps(&self, run_id: RunId) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            let run = self.get_run(run_id).await?;
            match run.kind {
                RunKind::Step => {
                    self.create_ready_tasks(run_id).await?;
                }
                RunKind::Workflow => {
                    for child in &run.children {
                        self.start_ready_steps(*child).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// All ready combinations across the step's inputs, or `None` when any
    /// input cannot produce combinations yet. A step with no declared
    /// inputs has exactly one (empty) combination.
    async fn ready_input_sets(
        &self,
        run: &Run,
        template: &crate::template::Template,
    ) -> EngineResult<Option<Vec<InputSet>>> {
        if template.inputs.is_empty() {
            return Ok(Some(vec![InputSet { members: Vec::new() }]));
        }

        let mut per_input = Vec::with_capacity(template.inputs.len());
        for declared in &template.inputs {
            let Some(endpoint) = self.input_endpoint(run.id, &declared.channel).await? else {
                return Ok(None);
            };
            let Some(root) = endpoint.tree else {
                return Ok(None);
            };
            let ready = tree::get_ready_data_nodes(
                &*self.store,
                root,
                &DataPath::root(),
                declared.gather_depth,
            )
            .await?;
            if ready.is_empty() {
                return Ok(None);
            }
            per_input.push(ready);
        }

        // Cartesian product, first input slowest-varying.
        let mut sets: Vec<Vec<tree::ReadyNode>> = vec![Vec::new()];
        for ready in per_input {
            let mut next = Vec::with_capacity(sets.len() * ready.len());
            for partial in &sets {
                for node in &ready {
                    let mut extended = partial.clone();
                    extended.push(node.clone());
                    next.push(extended);
                }
            }
            sets = next;
        }
        Ok(Some(
            sets.into_iter().map(|members| InputSet { members }).collect(),
        ))
    }

    /// Hand an attempt to the backend without blocking the caller. A
    /// rejected dispatch is recorded as an execution failure.
    fn dispatch(&self, dispatch: TaskDispatch) {
        let engine = self.clone();
        tokio::spawn(async move {
            let attempt_id = dispatch.attempt.id;
            let task_id = dispatch.task.id;
            debug!(task = %task_id, attempt = %attempt_id, "dispatching attempt");
            if let Err(err) = engine.manager.run(dispatch).await {
                error!(task = %task_id, attempt = %attempt_id, error = %err, "dispatch failed");
                if let Err(report_err) = engine
                    .report_attempt_failed(attempt_id, err.to_string(), None)
                    .await
                {
                    error!(
                        attempt = %attempt_id,
                        error = %report_err,
                        "failed to record dispatch failure"
                    );
                }
            }
        });
    }

    /// Append a fresh attempt to a non-terminal task, make it active, and
    /// dispatch it. The previous attempt is superseded: its terminal
    /// reports are still recorded on the attempt itself but no longer
    /// move the task or cascade into the run.
    pub async fn create_task_attempt(&self, task_id: TaskId) -> EngineResult<TaskAttempt> {
        let attempt = TaskAttempt::new(task_id);
        let attempt_id = attempt.id;
        let task = crate::guard::save_with_retries(
            &*self.store,
            task_id,
            self.retries(),
            |task: &mut Task| {
                if task.status.is_terminal() {
                    return Err(SaveError::Rejected(format!("task {} is terminal", task.id)));
                }
                task.attempts.push(attempt_id);
                task.active_attempt = Some(attempt_id);
                task.transition(TaskStatus::Pending);
                Ok(())
            },
        )
        .await
        .map_err(|err| match err {
            SaveError::Rejected(_) => EngineError::TaskTerminal(task_id),
            other => other.into(),
        })?;
        EntityOps::<TaskAttempt>::insert(&*self.store, attempt.clone()).await?;
        info!(task = %task_id, attempt = %attempt_id, "fresh attempt created");

        self.dispatch(TaskDispatch {
            task,
            attempt: attempt.clone(),
        });
        Ok(attempt)
    }

    // ------------------------------------------------------------------
    // Attempt status updates (called by backends and workers)
    // ------------------------------------------------------------------

    /// Record the container/image the backend started for an attempt.
    pub async fn report_attempt_container(
        &self,
        attempt: TaskAttemptId,
        container_id: String,
        image_id: Option<String>,
    ) -> EngineResult<()> {
        self.update_attempt(attempt, move |attempt| {
            attempt.container_id = Some(container_id.clone());
            attempt.image_id = image_id.clone();
            Ok(())
        })
        .await
    }

    /// Worker liveness ping. Also moves a pending attempt (and its task
    /// and run) to running.
    pub async fn report_attempt_heartbeat(&self, attempt_id: TaskAttemptId) -> EngineResult<()> {
        self.update_attempt(attempt_id, |attempt| {
            attempt.last_heartbeat = Some(Utc::now());
            attempt.transition(TaskStatus::Running);
            Ok(())
        })
        .await?;
        let attempt = EntityOps::<TaskAttempt>::get(&*self.store, attempt_id).await?.record;
        if attempt.status == TaskStatus::Running {
            self.mark_task_running(attempt.task).await?;
        }
        Ok(())
    }

    /// Append a log-file reference reported by the worker.
    pub async fn report_attempt_log_file(
        &self,
        attempt: TaskAttemptId,
        name: String,
        url: String,
    ) -> EngineResult<()> {
        self.update_attempt(attempt, move |attempt| {
            attempt.log_files.push(crate::task::LogFileRef {
                name: name.clone(),
                url: url.clone(),
                created_at: Utc::now(),
            });
            Ok(())
        })
        .await
    }

    /// Append a timepoint/event reported by the worker.
    pub async fn report_attempt_timepoint(
        &self,
        attempt: TaskAttemptId,
        message: String,
        detail: Option<String>,
        is_error: bool,
    ) -> EngineResult<()> {
        self.update_attempt(attempt, move |attempt| {
            attempt.add_timepoint(message.clone(), detail.clone(), is_error);
            Ok(())
        })
        .await
    }

    /// Terminal success: record outputs on the attempt, pull them into the
    /// step run's output trees, and propagate. Re-reports are no-ops.
    pub async fn report_attempt_finished(
        &self,
        attempt_id: TaskAttemptId,
        outputs: Vec<AttemptOutput>,
    ) -> EngineResult<()> {
        let mut transitioned = false;
        let attempt = crate::guard::save_with_retries(
            &*self.store,
            attempt_id,
            self.retries(),
            |attempt: &mut TaskAttempt| {
                transitioned = attempt.transition(TaskStatus::Finished);
                if transitioned {
                    attempt.outputs = outputs.clone();
                }
                Ok(())
            },
        )
        .await?;
        if !transitioned {
            debug!(attempt = %attempt_id, "finish report on terminal attempt ignored");
            return Ok(());
        }

        let task = self.finish_task(&attempt).await?;
        self.pull_outputs(&task, &attempt).await?;
        self.update_step_run_status(task.step_run).await?;
        self.cleanup_worker(attempt_id);
        Ok(())
    }

    /// Terminal failure: record the message/detail and cascade upward.
    /// The core never retries; any retry policy is the backend's concern.
    pub async fn report_attempt_failed(
        &self,
        attempt_id: TaskAttemptId,
        message: String,
        detail: Option<String>,
    ) -> EngineResult<()> {
        let mut transitioned = false;
        let attempt = crate::guard::save_with_retries(
            &*self.store,
            attempt_id,
            self.retries(),
            |attempt: &mut TaskAttempt| {
                transitioned = attempt.transition(TaskStatus::Failed);
                if transitioned {
                    attempt.failure = Some(AttemptFailure {
                        message: message.clone(),
                        detail: detail.clone(),
                    });
                    attempt.add_timepoint(message.clone(), detail.clone(), true);
                }
                Ok(())
            },
        )
        .await?;
        if !transitioned {
            debug!(attempt = %attempt_id, "failure report on terminal attempt ignored");
            return Ok(());
        }

        let mut was_active = false;
        let task = crate::guard::save_with_retries(
            &*self.store,
            attempt.task,
            self.retries(),
            |task: &mut Task| {
                was_active = task.active_attempt == Some(attempt_id);
                if was_active {
                    task.transition(TaskStatus::Failed);
                }
                Ok(())
            },
        )
        .await?;
        warn!(task = %task.id, attempt = %attempt_id, %message, "attempt failed");
        if !was_active {
            // A superseded attempt's failure stays on the attempt record.
            self.cleanup_worker(attempt_id);
            return Ok(());
        }

        self.fail_run(
            task.step_run,
            format!("task of step '{}' failed: {message}", task.name),
            detail,
        )
        .await?;
        self.cleanup_worker(attempt_id);
        Ok(())
    }

    async fn finish_task(&self, attempt: &TaskAttempt) -> EngineResult<Task> {
        let attempt_id = attempt.id;
        let task = crate::guard::save_with_retries(
            &*self.store,
            attempt.task,
            self.retries(),
            |task: &mut Task| {
                if task.active_attempt != Some(attempt_id) {
                    return Err(SaveError::Rejected(format!(
                        "attempt {attempt_id} is not active on task {}",
                        task.id
                    )));
                }
                task.transition(TaskStatus::Finished);
                Ok(())
            },
        )
        .await
        .map_err(|err| match err {
            SaveError::Rejected(_) => EngineError::StaleAttempt(attempt_id),
            other => other.into(),
        })?;
        Ok(task)
    }

    /// Push each produced output into the owning step run's output
    /// endpoint. Filename/stream sources land at the task's scatter path;
    /// glob sources add one trailing array dimension there.
    async fn pull_outputs(&self, task: &Task, attempt: &TaskAttempt) -> EngineResult<()> {
        for produced in &attempt.outputs {
            let Some(declared) = task
                .outputs
                .iter()
                .find(|output| output.channel == produced.channel)
            else {
                warn!(
                    task = %task.id,
                    channel = %produced.channel,
                    "attempt reported an undeclared output channel"
                );
                continue;
            };
            let Some(endpoint) = self
                .store
                .endpoint_on_channel(task.step_run, &produced.channel, crate::channel::IoFlavor::Output)
                .await?
            else {
                continue;
            };
            let root = self.ensure_tree(endpoint.id).await?;

            let base = &task.scatter_path;
            let placements: Vec<(DataPath, crate::ids::DataObjectId)> =
                if declared.source.is_array() {
                    let degree = produced.objects.len() as u32;
                    produced
                        .objects
                        .iter()
                        .enumerate()
                        .map(|(index, object)| {
                            (base.child(PathSegment::new(index as u32, degree)), *object)
                        })
                        .collect()
                } else {
                    produced
                        .objects
                        .iter()
                        .map(|object| (base.clone(), *object))
                        .collect()
                };

            for (path, object) in placements {
                match tree::add_data_object(&*self.store, self.retries(), root, &path, object).await
                {
                    Ok(_) => {}
                    // Idempotent re-report of the same outputs.
                    Err(SaveError::Data(DataError::DataAlreadyExists { .. })) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            self.push(endpoint.id).await?;
        }
        Ok(())
    }

    async fn mark_task_running(&self, task_id: TaskId) -> EngineResult<()> {
        let task = crate::guard::save_with_retries(
            &*self.store,
            task_id,
            self.retries(),
            |task: &mut Task| {
                task.transition(TaskStatus::Running);
                Ok(())
            },
        )
        .await?;
        crate::guard::save_with_retries(
            &*self.store,
            task.step_run,
            self.retries(),
            |run: &mut Run| {
                run.transition(RunStatus::Running);
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn update_attempt<F>(&self, attempt: TaskAttemptId, mutate: F) -> EngineResult<()>
    where
        F: FnMut(&mut TaskAttempt) -> Result<(), SaveError> + Send,
    {
        let mut mutate = mutate;
        crate::guard::save_with_retries(
            &*self.store,
            attempt,
            self.retries(),
            |record: &mut TaskAttempt| {
                if record.status.is_terminal() {
                    // Terminal attempts accept no further updates.
                    return Ok(());
                }
                mutate(record)
            },
        )
        .await?;
        Ok(())
    }

    pub(crate) fn cleanup_worker(&self, attempt: TaskAttemptId) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.manager.delete_worker_resources(attempt).await;
        });
    }
}

/// Guarded run mutation helper local to this module.
async fn save_with_retries_run<S, M, F>(
    engine: &Engine<S, M>,
    run: RunId,
    mutate: F,
) -> Result<Run, SaveError>
where
    S: Store,
    M: TaskManager,
    F: FnMut(&mut Run) -> Result<(), SaveError> + Send,
{
    crate::guard::save_with_retries(&*engine.store, run, engine.retries(), mutate).await
}
