//! Template → run instantiation and post-creation wiring.
//!
//! Creating a run mirrors the template's shape; two postprocessing phases
//! then run idempotently under the guard: wiring every endpoint to its
//! sender through auto-created connectors, and recursively instantiating
//! workflow children. A run may legitimately finish before postprocessing
//! completes; that ordering is tolerated.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::channel::{IoFlavor, IoNode};
use crate::data::tree;
use crate::error::EngineResult;
use crate::guard::save_with_retries;
use crate::ids::{IoNodeId, RunId};
use crate::manager::TaskManager;
use crate::run::{PostprocessingStatus, Run};
use crate::store::{EntityOps, Store};
use crate::template::{Template, TemplateSpec};

use super::{Engine, RunRequest};

impl<S: Store, M: TaskManager> Engine<S, M> {
    /// Create one run node mirroring `template`, with its endpoints.
    /// Children and wiring are postprocessing's job.
    pub(crate) async fn create_run_node(
        &self,
        template: &Template,
        name: String,
        parent: Option<&Run>,
        request: &RunRequest,
    ) -> EngineResult<Run> {
        let mut run = Run::new(template.id, name, template.kind(), parent.map(|p| p.id));
        run.hard_stop_on_fail = match parent {
            Some(parent) => parent.hard_stop_on_fail,
            None => request
                .hard_stop_on_fail
                .unwrap_or(self.config.hard_stop_on_fail),
        };
        run.hard_stop_on_cancel = match parent {
            Some(parent) => parent.hard_stop_on_cancel,
            None => request
                .hard_stop_on_cancel
                .unwrap_or(self.config.hard_stop_on_cancel),
        };

        for input in &template.inputs {
            let endpoint = IoNode::new(
                run.id,
                &input.channel,
                IoFlavor::Input,
                input.data_type,
                input.gather_depth,
            );
            run.inputs.push(endpoint.id);
            EntityOps::<IoNode>::insert(&*self.store, endpoint).await?;
        }
        for output in &template.outputs {
            let endpoint =
                IoNode::new(run.id, &output.channel, IoFlavor::Output, output.data_type, 0);
            run.outputs.push(endpoint.id);
            EntityOps::<IoNode>::insert(&*self.store, endpoint).await?;
        }

        EntityOps::<Run>::insert(&*self.store, run.clone()).await?;
        Ok(run)
    }

    /// Run both postprocessing phases for `run` and, recursively, its
    /// children. Racing callers coordinate through the postprocessing
    /// status claim; losers return immediately.
    pub(crate) fn postprocess(&self, run: RunId) -> BoxFuture<'_, EngineResult<()>> {
        Box::pin(async move {
            let mut claimed = false;
            save_with_retries(&*self.store, run, self.retries(), |run: &mut Run| {
                claimed = run.postprocessing_status == PostprocessingStatus::Waiting;
                if claimed {
                    run.postprocessing_status = PostprocessingStatus::InProgress;
                }
                Ok(())
            })
            .await?;
            if !claimed {
                debug!(%run, "postprocessing already claimed elsewhere");
                return Ok(());
            }

            let outcome = self.postprocess_claimed(run).await;
            let final_status = match &outcome {
                Ok(()) => PostprocessingStatus::Done,
                Err(err) => {
                    warn!(%run, error = %err, "postprocessing failed");
                    PostprocessingStatus::Error
                }
            };
            let message = outcome.as_ref().err().map(|err| err.to_string());
            save_with_retries(&*self.store, run, self.retries(), |run: &mut Run| {
                run.postprocessing_status = final_status;
                if let Some(message) = &message {
                    run.add_event("postprocessing failed", Some(message.clone()), true);
                }
                Ok(())
            })
            .await?;
            outcome
        })
    }

    async fn postprocess_claimed(&self, run_id: RunId) -> EngineResult<()> {
        let run = self.get_run(run_id).await?;
        let template = self.get_template(run.template).await?;

        if let TemplateSpec::Workflow(spec) = &template.spec {
            // Phase one: create child run nodes so their endpoints exist.
            let mut children = Vec::with_capacity(spec.children.len());
            for child_template_id in &spec.children {
                let child_template = self.get_template(*child_template_id).await?;
                let child = self
                    .create_run_node(
                        &child_template,
                        format!("{}.{}", run.name, child_template.name),
                        Some(&run),
                        &RunRequest::default(),
                    )
                    .await?;
                children.push(child.id);
            }

            // Phase two: one connector per channel produced in this scope,
            // so sibling steps never reference each other directly.
            let connectors = self.wire_workflow(&run, &template, &children).await?;

            let child_ids = children.clone();
            save_with_retries(&*self.store, run_id, self.retries(), |run: &mut Run| {
                run.children = child_ids.clone();
                run.connectors = connectors.clone();
                Ok(())
            })
            .await?;

            for child in children {
                self.postprocess(child).await?;
            }
        }

        self.apply_input_defaults(run_id, &template).await?;
        debug!(%run_id, "postprocessing done");
        Ok(())
    }

    /// Create connectors and set every sender/receiver edge inside one
    /// workflow scope. Producers are the workflow's own inputs and the
    /// children's outputs; template validation guaranteed uniqueness.
    async fn wire_workflow(
        &self,
        run: &Run,
        template: &Template,
        children: &[RunId],
    ) -> EngineResult<Vec<IoNodeId>> {
        struct Producer {
            endpoint: IoNodeId,
            data_type: crate::data::DataType,
            channel: String,
        }

        let mut producers: Vec<Producer> = Vec::new();
        for input in &template.inputs {
            if let Some(endpoint) = self.input_endpoint(run.id, &input.channel).await? {
                producers.push(Producer {
                    endpoint: endpoint.id,
                    data_type: input.data_type,
                    channel: input.channel.clone(),
                });
            }
        }
        for child in children {
            for endpoint in self.store.endpoints_of_run(*child).await? {
                if endpoint.flavor == IoFlavor::Output {
                    producers.push(Producer {
                        endpoint: endpoint.id,
                        data_type: endpoint.data_type,
                        channel: endpoint.channel.clone(),
                    });
                }
            }
        }

        let mut connectors = Vec::new();
        for producer in &producers {
            let connector = IoNode::new(
                run.id,
                &producer.channel,
                IoFlavor::Connector,
                producer.data_type,
                0,
            );
            let connector_id = connector.id;
            EntityOps::<IoNode>::insert(&*self.store, connector).await?;
            connectors.push(connector_id);
            self.connect(producer.endpoint, connector_id).await?;

            for child in children {
                if let Some(consumer) = self
                    .store
                    .endpoint_on_channel(*child, &producer.channel, IoFlavor::Input)
                    .await?
                {
                    self.connect(connector_id, consumer.id).await?;
                }
            }
            if let Some(own_output) = self
                .store
                .endpoint_on_channel(run.id, &producer.channel, IoFlavor::Output)
                .await?
            {
                self.connect(connector_id, own_output.id).await?;
            }
        }
        Ok(connectors)
    }

    /// Wire `sender -> receiver`: the receiver records its single sender,
    /// the sender tracks the receiver for fan-out.
    pub(crate) async fn connect(
        &self,
        sender: IoNodeId,
        receiver: IoNodeId,
    ) -> EngineResult<()> {
        save_with_retries(&*self.store, receiver, self.retries(), |node: &mut IoNode| {
            node.set_sender(sender)
                .map_err(|err| crate::error::SaveError::Rejected(err.to_string()))
        })
        .await?;
        save_with_retries(&*self.store, sender, self.retries(), |node: &mut IoNode| {
            node.add_receiver(receiver);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Materialize template-declared defaults on this run's unfed inputs
    /// and start propagation for them.
    async fn apply_input_defaults(&self, run_id: RunId, template: &Template) -> EngineResult<()> {
        for input in &template.inputs {
            let Some(default) = &input.default else { continue };
            let Some(endpoint) = self.input_endpoint(run_id, &input.channel).await? else {
                continue;
            };
            if endpoint.sender.is_some() || endpoint.tree.is_some() {
                continue;
            }
            self.materialize_input(&endpoint, input, super::RunInput::Literal(default.clone()))
                .await?;
            self.push(endpoint.id).await?;
        }
        Ok(())
    }

    pub(crate) async fn input_endpoint(
        &self,
        run: RunId,
        channel: &str,
    ) -> EngineResult<Option<IoNode>> {
        Ok(self
            .store
            .endpoint_on_channel(run, channel, IoFlavor::Input)
            .await?)
    }

    /// The endpoint's tree root, creating a blank one on first use. A
    /// racing creator may win; the committed reference decides and the
    /// loser's root stays orphaned.
    pub(crate) async fn ensure_tree(
        &self,
        endpoint: IoNodeId,
    ) -> EngineResult<crate::ids::DataNodeId> {
        let node = EntityOps::<IoNode>::get(&*self.store, endpoint).await?.record;
        if let Some(tree) = node.tree {
            return Ok(tree);
        }
        let root = tree::create_root(&*self.store, node.data_type).await?;
        let root_id = root.id;
        let committed =
            save_with_retries(&*self.store, endpoint, self.retries(), |node: &mut IoNode| {
                if node.tree.is_none() {
                    node.tree = Some(root_id);
                }
                Ok(())
            })
            .await?;
        Ok(committed.tree.expect("tree set above"))
    }
}
