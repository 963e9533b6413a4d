//! Immutable template graph: step and workflow definitions.
//!
//! Templates are created once at import time, validated, and never mutated;
//! many runs reference the same template. A workflow's channel wiring is
//! checked at creation so instantiation can assume every consumed channel
//! has exactly one producer in scope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::data::DataType;
use crate::error::ValidationError;
use crate::ids::TemplateId;
use crate::run::RunKind;
use crate::store::{Entity, EntityOps, Versioned};

/// A named input declaration on a step or workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInput {
    pub channel: String,
    pub data_type: DataType,
    /// How many trailing array dimensions are consumed together.
    /// 0 scatters every element independently.
    #[serde(default)]
    pub gather_depth: u32,
    /// Literal applied when no producer feeds the channel and the run
    /// request leaves it unset. JSON scalar or nested array.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Where a step's output value comes from on the worker side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum OutputSource {
    /// A single file with this exact name.
    Filename(String),
    /// All files matching a glob, producing an array.
    Glob(String),
    /// The process output stream.
    Stream,
}

impl OutputSource {
    /// Glob sources produce one array dimension.
    pub fn is_array(&self) -> bool {
        matches!(self, OutputSource::Glob(_))
    }
}

/// A named output declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateOutput {
    pub channel: String,
    pub data_type: DataType,
    pub source: OutputSource,
}

/// Resource request attached to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cores: 1,
            memory_mb: 1024,
            disk_mb: 1024,
        }
    }
}

/// Step-only payload: what actually executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub command: String,
    pub interpreter: String,
    /// Execution environment, e.g. a container image.
    pub environment: String,
    #[serde(default)]
    pub resources: ResourceRequest,
}

/// Workflow-only payload: ordered child templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub children: Vec<TemplateId>,
}

/// Step/workflow tagged union sharing the common header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TemplateSpec {
    Step(StepSpec),
    Workflow(WorkflowSpec),
}

/// Immutable definition of a step or workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub inputs: Vec<TemplateInput>,
    pub outputs: Vec<TemplateOutput>,
    pub spec: TemplateSpec,
}

impl Template {
    pub fn kind(&self) -> RunKind {
        match self.spec {
            TemplateSpec::Step(_) => RunKind::Step,
            TemplateSpec::Workflow(_) => RunKind::Workflow,
        }
    }

    pub fn step_spec(&self) -> Option<&StepSpec> {
        match &self.spec {
            TemplateSpec::Step(spec) => Some(spec),
            TemplateSpec::Workflow(_) => None,
        }
    }

    pub fn child_ids(&self) -> &[TemplateId] {
        match &self.spec {
            TemplateSpec::Step(_) => &[],
            TemplateSpec::Workflow(spec) => &spec.children,
        }
    }

    pub fn input(&self, channel: &str) -> Option<&TemplateInput> {
        self.inputs.iter().find(|input| input.channel == channel)
    }

    pub fn output(&self, channel: &str) -> Option<&TemplateOutput> {
        self.outputs.iter().find(|output| output.channel == channel)
    }
}

impl Entity for Template {
    type Id = TemplateId;
    const KIND: &'static str = "template";

    fn id(&self) -> TemplateId {
        self.id
    }
}

/// Validate a workflow template's channel wiring against its (already
/// stored) children: every channel consumed by a child input without a
/// default, or by a workflow output, needs exactly one producer in scope.
/// Producers are the workflow's own inputs and the children's outputs.
pub async fn validate_template<S>(store: &S, template: &Template) -> Result<(), ValidationError>
where
    S: EntityOps<Template>,
{
    let TemplateSpec::Workflow(spec) = &template.spec else {
        return Ok(());
    };
    if spec.children.is_empty() {
        return Err(ValidationError::EmptyWorkflow {
            template: template.id,
        });
    }

    let mut producers: HashMap<String, u32> = HashMap::new();
    for input in &template.inputs {
        *producers.entry(input.channel.clone()).or_default() += 1;
    }

    let mut children = Vec::with_capacity(spec.children.len());
    for child_id in &spec.children {
        let Versioned { record: child, .. } =
            store
                .get(*child_id)
                .await
                .map_err(|_| ValidationError::UnknownChildTemplate {
                    workflow: template.id,
                    child: *child_id,
                })?;
        children.push(child);
    }

    for child in &children {
        for output in &child.outputs {
            *producers.entry(output.channel.clone()).or_default() += 1;
        }
    }

    let mut consumed: Vec<&str> = Vec::new();
    for child in &children {
        for input in &child.inputs {
            if input.default.is_none() {
                consumed.push(input.channel.as_str());
            }
        }
    }
    for output in &template.outputs {
        consumed.push(output.channel.as_str());
    }

    for channel in consumed {
        match producers.get(channel).copied().unwrap_or(0) {
            0 => {
                return Err(ValidationError::MissingProducer {
                    workflow: template.id,
                    channel: channel.to_string(),
                })
            }
            1 => {}
            _ => {
                return Err(ValidationError::DuplicateProducer {
                    workflow: template.id,
                    channel: channel.to_string(),
                })
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn step(name: &str, inputs: &[&str], outputs: &[&str]) -> Template {
        Template {
            id: TemplateId::new(),
            name: name.to_string(),
            inputs: inputs
                .iter()
                .map(|channel| TemplateInput {
                    channel: channel.to_string(),
                    data_type: DataType::String,
                    gather_depth: 0,
                    default: None,
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|channel| TemplateOutput {
                    channel: channel.to_string(),
                    data_type: DataType::String,
                    source: OutputSource::Stream,
                })
                .collect(),
            spec: TemplateSpec::Step(StepSpec {
                command: "true".to_string(),
                interpreter: "/bin/bash".to_string(),
                environment: "busybox".to_string(),
                resources: ResourceRequest::default(),
            }),
        }
    }

    fn workflow(name: &str, inputs: &[&str], outputs: &[&str], children: &[&Template]) -> Template {
        let mut template = step(name, inputs, outputs);
        template.spec = TemplateSpec::Workflow(WorkflowSpec {
            children: children.iter().map(|child| child.id).collect(),
        });
        template
    }

    async fn store_with(children: &[&Template]) -> MemoryStore {
        let store = MemoryStore::new();
        for child in children {
            EntityOps::<Template>::insert(&store, (*child).clone())
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn wired_workflow_passes() {
        let a = step("a", &["raw"], &["mid"]);
        let b = step("b", &["mid"], &["out"]);
        let parent = workflow("wf", &["raw"], &["out"], &[&a, &b]);
        let store = store_with(&[&a, &b]).await;
        validate_template(&store, &parent).await.unwrap();
    }

    #[tokio::test]
    async fn unfed_child_input_is_rejected() {
        let b = step("b", &["mid"], &["out"]);
        let parent = workflow("wf", &[], &["out"], &[&b]);
        let store = store_with(&[&b]).await;
        let err = validate_template(&store, &parent).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MissingProducer { channel, .. } if channel == "mid"
        ));
    }

    #[tokio::test]
    async fn defaulted_child_input_needs_no_producer() {
        let mut b = step("b", &["mid"], &["out"]);
        b.inputs[0].default = Some(serde_json::json!("fallback"));
        let parent = workflow("wf", &[], &["out"], &[&b]);
        let store = store_with(&[&b]).await;
        validate_template(&store, &parent).await.unwrap();
    }

    #[tokio::test]
    async fn two_producers_on_one_channel_are_rejected() {
        let a = step("a", &[], &["mid"]);
        let b = step("b", &[], &["mid"]);
        let c = step("c", &["mid"], &["out"]);
        let parent = workflow("wf", &[], &["out"], &[&a, &b, &c]);
        let store = store_with(&[&a, &b, &c]).await;
        let err = validate_template(&store, &parent).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DuplicateProducer { channel, .. } if channel == "mid"
        ));
    }

    #[tokio::test]
    async fn unfed_workflow_output_is_rejected() {
        let a = step("a", &[], &["mid"]);
        let parent = workflow("wf", &[], &["missing"], &[&a]);
        let store = store_with(&[&a]).await;
        let err = validate_template(&store, &parent).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MissingProducer { channel, .. } if channel == "missing"
        ));
    }

    #[tokio::test]
    async fn empty_workflow_is_rejected() {
        let parent = workflow("wf", &[], &[], &[]);
        let store = store_with(&[]).await;
        let err = validate_template(&store, &parent).await.unwrap_err();
        assert!(matches!(err, ValidationError::EmptyWorkflow { .. }));
    }

    #[tokio::test]
    async fn missing_child_template_is_rejected() {
        let orphan = step("never-stored", &[], &["mid"]);
        let c = step("c", &["mid"], &["out"]);
        let parent = workflow("wf", &[], &["out"], &[&orphan, &c]);
        let store = store_with(&[&c]).await;
        let err = validate_template(&store, &parent).await.unwrap_err();
        assert!(matches!(err, ValidationError::UnknownChildTemplate { .. }));
    }

    #[tokio::test]
    async fn step_templates_validate_without_children() {
        let template = step("solo", &["in"], &["out"]);
        assert_eq!(template.kind(), RunKind::Step);
        let store = store_with(&[]).await;
        validate_template(&store, &template).await.unwrap();
    }
}
