//! Status aggregation and the fail/kill cascades.
//!
//! Step runs derive their status from their tasks; workflow runs derive
//! theirs from their children. Failure propagates upward (killing
//! unfinished siblings when the run's hard-stop policy says so) and
//! cancellation propagates downward. Terminal statuses never change.

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::data::path::DataPath;
use crate::data::tree;
use crate::error::EngineResult;
use crate::guard::save_with_retries;
use crate::ids::RunId;
use crate::manager::TaskManager;
use crate::run::{PostprocessingStatus, Run, RunKind, RunStatus};
use crate::store::Store;
use crate::task::{Task, TaskAttempt, TaskStatus};

use super::Engine;

impl<S: Store, M: TaskManager> Engine<S, M> {
    /// Recompute a step run's status from its tasks. A step finishes only
    /// once every expected input combination has a finished task, so a
    /// late-arriving scatter element can still extend a running step but
    /// never reopen a finished one.
    pub(crate) async fn update_step_run_status(&self, run_id: RunId) -> EngineResult<()> {
        let run = self.get_run(run_id).await?;
        if run.kind != RunKind::Step || run.status.is_terminal() {
            return Ok(());
        }
        let tasks = self.store.tasks_of_run(run_id).await?;
        let statuses: Vec<TaskStatus> = tasks.iter().map(|task| task.status).collect();

        let target = if statuses.iter().any(|status| *status == TaskStatus::Failed) {
            Some(RunStatus::Failed)
        } else if !statuses.is_empty() && statuses.iter().all(TaskStatus::is_terminal) {
            if statuses.iter().any(|status| *status == TaskStatus::Killed) {
                Some(RunStatus::Killed)
            } else {
                match self.expected_task_count(&run).await? {
                    Some(expected) if expected == statuses.len() => Some(RunStatus::Finished),
                    // More combinations are still on their way.
                    _ => Some(RunStatus::Running),
                }
            }
        } else if !statuses.is_empty() {
            Some(RunStatus::Running)
        } else {
            None
        };
        let Some(target) = target else {
            return Ok(());
        };

        if target == RunStatus::Failed {
            // fail_run owns the event record and the upward cascade.
            return self
                .fail_run(run_id, "one or more tasks failed".to_string(), None)
                .await;
        }

        let mut changed = false;
        let committed = save_with_retries(&*self.store, run_id, self.retries(), |run: &mut Run| {
            changed = run.transition(target);
            Ok(())
        })
        .await?;
        if !changed {
            return Ok(());
        }
        info!(run = %run_id, name = %committed.name, status = %target, "step run status");
        if let Some(parent) = committed.parent {
            self.update_workflow_status(parent).await?;
        }
        Ok(())
    }

    /// How many tasks this step run will create in total, or `None` while
    /// any input tree is still incomplete.
    async fn expected_task_count(&self, run: &Run) -> EngineResult<Option<usize>> {
        let template = self.get_template(run.template).await?;
        if template.inputs.is_empty() {
            return Ok(Some(1));
        }
        let mut expected = 1usize;
        for declared in &template.inputs {
            let Some(endpoint) = self.input_endpoint(run.id, &declared.channel).await? else {
                return Ok(None);
            };
            let Some(root) = endpoint.tree else {
                return Ok(None);
            };
            if !tree::is_ready(&*self.store, root).await? {
                return Ok(None);
            }
            let ready = tree::get_ready_data_nodes(
                &*self.store,
                root,
                &DataPath::root(),
                declared.gather_depth,
            )
            .await?;
            expected = expected.saturating_mul(ready.len());
        }
        Ok(Some(expected))
    }

    /// Recompute a workflow run's status from its children and propagate
    /// upward. Hard-stop failure short-circuits through `fail_run` before
    /// this ever sees a mixed picture; this handles the patient
    /// wait-for-all aggregation and normal completion.
    pub(crate) fn update_workflow_status(&self, run_id: RunId) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            let run = self.get_run(run_id).await?;
            if run.kind != RunKind::Workflow || run.status.is_terminal() {
                return Ok(());
            }
            let mut children = Vec::with_capacity(run.children.len());
            for child in &run.children {
                children.push(self.get_run(*child).await?);
            }
            let all_terminal =
                !children.is_empty() && children.iter().all(|child| child.status.is_terminal());
            let any_failed = children.iter().any(|child| child.status == RunStatus::Failed);
            let any_killed = children.iter().any(|child| child.status == RunStatus::Killed);
            let any_started = children.iter().any(|child| child.status != RunStatus::Waiting);

            if all_terminal && any_failed {
                let names: Vec<&str> = children
                    .iter()
                    .filter(|child| child.status == RunStatus::Failed)
                    .map(|child| child.name.as_str())
                    .collect();
                return self
                    .fail_run(
                        run_id,
                        format!("child run(s) failed: {}", names.join(", ")),
                        None,
                    )
                    .await;
            }
            let target = if all_terminal && any_killed {
                Some(RunStatus::Killed)
            } else if all_terminal {
                match run.postprocessing_status {
                    PostprocessingStatus::Done => Some(RunStatus::Finished),
                    PostprocessingStatus::Error => {
                        return self
                            .fail_run(run_id, "workflow initialization failed".to_string(), None)
                            .await;
                    }
                    _ => None,
                }
            } else if any_started {
                Some(RunStatus::Running)
            } else {
                None
            };
            let Some(target) = target else {
                return Ok(());
            };

            let mut changed = false;
            let committed =
                save_with_retries(&*self.store, run_id, self.retries(), |run: &mut Run| {
                    changed = run.transition(target);
                    if changed && target == RunStatus::Killed {
                        run.add_event("all remaining children were killed", None, true);
                    }
                    Ok(())
                })
                .await?;
            if !changed {
                return Ok(());
            }
            info!(run = %run_id, name = %committed.name, status = %target, "workflow run status");
            if let Some(parent) = committed.parent {
                self.update_workflow_status(parent).await?;
            }
            Ok(())
        })
    }

    /// Mark a run failed and cascade: kill its own outstanding work, then
    /// either hard-stop the parent (killing unfinished siblings) or let
    /// the parent keep running its other children to completion.
    pub(crate) fn fail_run(
        &self,
        run_id: RunId,
        message: String,
        detail: Option<String>,
    ) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            let mut changed = false;
            let committed =
                save_with_retries(&*self.store, run_id, self.retries(), |run: &mut Run| {
                    changed = run.transition(RunStatus::Failed);
                    if changed {
                        run.add_event(message.clone(), detail.clone(), true);
                    }
                    Ok(())
                })
                .await?;
            if !changed {
                debug!(run = %run_id, "failure report on terminal run ignored");
                return Ok(());
            }
            warn!(run = %run_id, name = %committed.name, %message, "run failed");

            match committed.kind {
                RunKind::Step => self.kill_tasks_of(run_id, "owning run failed").await?,
                RunKind::Workflow => {
                    for child in &committed.children {
                        self.kill_run(*child, format!("parent run '{}' failed", committed.name))
                            .await?;
                    }
                }
            }

            if let Some(parent_id) = committed.parent {
                let parent = self.get_run(parent_id).await?;
                if parent.hard_stop_on_fail {
                    for sibling in &parent.children {
                        if *sibling != run_id {
                            self.kill_run(
                                *sibling,
                                format!("sibling run '{}' failed", committed.name),
                            )
                            .await?;
                        }
                    }
                    self.fail_run(
                        parent_id,
                        format!("child run '{}' failed", committed.name),
                        None,
                    )
                    .await?;
                } else {
                    self.update_workflow_status(parent_id).await?;
                }
            }
            Ok(())
        })
    }

    /// Mark a run killed and, per its cancellation policy, kill every
    /// descendant run, task, and attempt. Already-terminal runs are left
    /// alone.
    pub(crate) fn kill_run(
        &self,
        run_id: RunId,
        message: String,
    ) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            let mut changed = false;
            let committed =
                save_with_retries(&*self.store, run_id, self.retries(), |run: &mut Run| {
                    changed = run.transition(RunStatus::Killed);
                    if changed {
                        run.add_event(message.clone(), None, true);
                    }
                    Ok(())
                })
                .await?;
            if !changed {
                return Ok(());
            }
            info!(run = %run_id, name = %committed.name, %message, "run killed");

            if committed.hard_stop_on_cancel {
                for child in &committed.children {
                    self.kill_run(*child, message.clone()).await?;
                }
                if committed.kind == RunKind::Step {
                    self.kill_tasks_of(run_id, &message).await?;
                }
            }
            Ok(())
        })
    }

    /// Kill every non-terminal task of a step run, along with its active
    /// attempt, and schedule worker teardown.
    async fn kill_tasks_of(&self, run_id: RunId, message: &str) -> EngineResult<()> {
        let tasks = self.store.tasks_of_run(run_id).await?;
        for task in tasks {
            if task.status.is_terminal() {
                continue;
            }
            let committed =
                save_with_retries(&*self.store, task.id, self.retries(), |task: &mut Task| {
                    task.transition(TaskStatus::Killed);
                    Ok(())
                })
                .await?;
            let Some(attempt_id) = committed.active_attempt else {
                continue;
            };
            let message = message.to_string();
            save_with_retries(
                &*self.store,
                attempt_id,
                self.retries(),
                |attempt: &mut TaskAttempt| {
                    if attempt.transition(TaskStatus::Killed) {
                        attempt.add_timepoint(message.clone(), None, true);
                    }
                    Ok(())
                },
            )
            .await?;
            self.cleanup_worker(attempt_id);
        }
        Ok(())
    }
}
