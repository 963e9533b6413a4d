//! End-to-end lifecycle of a two-step linear workflow: a file input feeds
//! step `align`, whose output feeds step `call`, whose output becomes the
//! workflow output. Attempt completion is driven by hand through the
//! engine's status-update operations, the way a real backend would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use weft::data::object::DataValue;
use weft::data::{DataPath, DataType};
use weft::engine::{Engine, RunInput, RunRequest, RunView};
use weft::ids::{TaskId, TemplateId};
use weft::manager::RecordingManager;
use weft::run::{InputSetClaim, Run, RunStatus};
use weft::store::MemoryStore;
use weft::task::{AttemptOutput, TaskStatus};
use weft::template::{
    OutputSource, StepSpec, Template, TemplateInput, TemplateOutput, TemplateSpec, WorkflowSpec,
};
use weft::{guard, EngineConfig, EngineError};

fn step_template(
    name: &str,
    inputs: &[(&str, DataType)],
    outputs: &[(&str, DataType, OutputSource)],
) -> Template {
    Template {
        id: TemplateId::new(),
        name: name.to_string(),
        inputs: inputs
            .iter()
            .map(|(channel, data_type)| TemplateInput {
                channel: channel.to_string(),
                data_type: *data_type,
                gather_depth: 0,
                default: None,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(channel, data_type, source)| TemplateOutput {
                channel: channel.to_string(),
                data_type: *data_type,
                source: source.clone(),
            })
            .collect(),
        spec: TemplateSpec::Step(StepSpec {
            command: format!("run-{name}"),
            interpreter: "/bin/bash".to_string(),
            environment: "ubuntu:22.04".to_string(),
            resources: Default::default(),
        }),
    }
}

fn workflow_template(
    name: &str,
    inputs: &[(&str, DataType)],
    outputs: &[(&str, DataType)],
    children: &[&Template],
) -> Template {
    Template {
        id: TemplateId::new(),
        name: name.to_string(),
        inputs: inputs
            .iter()
            .map(|(channel, data_type)| TemplateInput {
                channel: channel.to_string(),
                data_type: *data_type,
                gather_depth: 0,
                default: None,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(channel, data_type)| TemplateOutput {
                channel: channel.to_string(),
                data_type: *data_type,
                source: OutputSource::Stream,
            })
            .collect(),
        spec: TemplateSpec::Workflow(WorkflowSpec {
            children: children.iter().map(|child| child.id).collect(),
        }),
    }
}

struct Fixture {
    engine: Engine<MemoryStore, RecordingManager>,
    store: Arc<MemoryStore>,
    manager: Arc<RecordingManager>,
    workflow: TemplateId,
}

/// `align` consumes the raw file, `call` consumes align's product.
async fn linear_fixture(config: EngineConfig) -> Result<Fixture> {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryStore::new());
    let manager = RecordingManager::new();
    let engine = Engine::new(Arc::clone(&store), Arc::clone(&manager), config);

    let align = step_template(
        "align",
        &[("raw", DataType::File)],
        &[(
            "aligned",
            DataType::File,
            OutputSource::Filename("aligned.bam".to_string()),
        )],
    );
    let call = step_template(
        "call",
        &[("aligned", DataType::File)],
        &[("variants", DataType::String, OutputSource::Stream)],
    );
    let workflow = workflow_template(
        "pipeline",
        &[("raw", DataType::File)],
        &[("variants", DataType::String)],
        &[&align, &call],
    );

    engine.import_template(align).await?;
    engine.import_template(call).await?;
    let workflow = engine.import_template(workflow).await?;
    Ok(Fixture {
        engine,
        store,
        manager,
        workflow,
    })
}

fn child<'a>(view: &'a RunView, name: &str) -> &'a RunView {
    view.children
        .iter()
        .find(|child| child.run.name.ends_with(name))
        .unwrap_or_else(|| panic!("no child run named {name}"))
}

fn file_request(name: &str, raw: weft::ids::DataObjectId) -> RunRequest {
    let mut request = RunRequest::default();
    request.name = name.to_string();
    request
        .inputs
        .insert("raw".to_string(), RunInput::Reference(raw));
    request
}

async fn wait_for_dispatches(manager: &RecordingManager, count: usize) {
    for _ in 0..100 {
        if manager.dispatches().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} dispatches, saw {}",
        manager.dispatches().len()
    );
}

#[tokio::test]
async fn linear_workflow_runs_to_completion() -> Result<()> {
    let fx = linear_fixture(EngineConfig::default()).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:aa11").await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job1", raw.id))
        .await?;

    // The upload is still incomplete, so align cannot start yet.
    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(view.children.len(), 2);
    assert!(child(&view, "align").tasks.is_empty());

    let resource = fx.engine.get_data_object(raw.id).await?.resource().unwrap();
    fx.engine.mark_resource_complete(resource).await?;

    let view = fx.engine.get_run_view(run.id).await?;
    let align = child(&view, "align");
    assert_eq!(align.tasks.len(), 1);
    assert_eq!(align.run.status, RunStatus::Running);
    assert!(child(&view, "call").tasks.is_empty());
    wait_for_dispatches(&fx.manager, 1).await;

    // Backend finishes align with a complete output file.
    let align_attempt = align.tasks[0].attempts[0].id;
    fx.engine.report_attempt_heartbeat(align_attempt).await?;
    let aligned = fx.engine.post_file_object("aligned.bam", "sha:bb22").await?;
    fx.engine
        .mark_resource_complete(aligned.resource().unwrap())
        .await?;
    fx.engine
        .report_attempt_finished(
            align_attempt,
            vec![AttemptOutput {
                channel: "aligned".to_string(),
                objects: vec![aligned.id],
            }],
        )
        .await?;

    // Align finished and its output propagated, so call now has one task.
    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(child(&view, "align").run.status, RunStatus::Finished);
    let call = child(&view, "call");
    assert_eq!(call.tasks.len(), 1);
    wait_for_dispatches(&fx.manager, 2).await;

    let call_attempt = call.tasks[0].attempts[0].id;
    let variants = fx
        .engine
        .post_data_object(DataValue::String("chr1:12345 A>T".to_string()))
        .await?;
    fx.engine
        .report_attempt_finished(
            call_attempt,
            vec![AttemptOutput {
                channel: "variants".to_string(),
                objects: vec![variants.id],
            }],
        )
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(view.run.status, RunStatus::Finished);
    for name in ["align", "call"] {
        let step = child(&view, name);
        assert_eq!(step.run.status, RunStatus::Finished);
        assert_eq!(step.tasks.len(), 1);
        assert_eq!(step.tasks[0].task.status, TaskStatus::Finished);
    }
    Ok(())
}

#[tokio::test]
async fn failed_attempt_fails_the_run_and_kills_siblings() -> Result<()> {
    let fx = linear_fixture(EngineConfig::default()).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:cc33").await?;
    fx.engine
        .mark_resource_complete(raw.resource().unwrap())
        .await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job2", raw.id))
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    let align_attempt = child(&view, "align").tasks[0].attempts[0].id;
    fx.engine
        .report_attempt_failed(
            align_attempt,
            "aligner exited with code 137".to_string(),
            Some("oom-killed".to_string()),
        )
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(view.run.status, RunStatus::Failed);
    let align = child(&view, "align");
    assert_eq!(align.run.status, RunStatus::Failed);
    assert_eq!(align.tasks[0].task.status, TaskStatus::Failed);
    assert_eq!(align.tasks[0].attempts[0].status, TaskStatus::Failed);

    // The sibling never got work and is killed, not failed.
    let call = child(&view, "call");
    assert_eq!(call.run.status, RunStatus::Killed);
    assert!(call.tasks.is_empty());

    // Deepest cause first.
    let chain = fx.engine.failure_chain(run.id).await?;
    assert!(!chain.is_empty());
    assert!(chain[0].message.contains("exited with code 137"));
    Ok(())
}

#[tokio::test]
async fn soft_stop_lets_siblings_finish_before_failing() -> Result<()> {
    let mut config = EngineConfig::default();
    config.hard_stop_on_fail = false;
    let fx = linear_fixture(config).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:ee55").await?;
    fx.engine
        .mark_resource_complete(raw.resource().unwrap())
        .await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job4", raw.id))
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    let align_attempt = child(&view, "align").tasks[0].attempts[0].id;
    fx.engine
        .report_attempt_failed(align_attempt, "transient".to_string(), None)
        .await?;

    // align failed, but the workflow keeps waiting for call. call can
    // never start here (its input came from align), so cancel it; only
    // then does the workflow settle as failed.
    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(child(&view, "align").run.status, RunStatus::Failed);
    assert_eq!(view.run.status, RunStatus::Running);

    let call_id = child(&view, "call").run.id;
    fx.engine.cancel_run(call_id, "upstream failed").await?;

    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(view.run.status, RunStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn cancellation_kills_descendant_work() -> Result<()> {
    let fx = linear_fixture(EngineConfig::default()).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:dd44").await?;
    fx.engine
        .mark_resource_complete(raw.resource().unwrap())
        .await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job3", raw.id))
        .await?;

    fx.engine.cancel_run(run.id, "operator request").await?;

    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(view.run.status, RunStatus::Killed);
    for name in ["align", "call"] {
        assert_eq!(child(&view, name).run.status, RunStatus::Killed);
    }
    let align = child(&view, "align");
    assert_eq!(align.tasks[0].task.status, TaskStatus::Killed);
    assert_eq!(align.tasks[0].attempts[0].status, TaskStatus::Killed);

    // Terminal runs ignore later completion reports.
    let attempt = align.tasks[0].attempts[0].id;
    fx.engine.report_attempt_finished(attempt, Vec::new()).await?;
    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(
        child(&view, "align").tasks[0].attempts[0].status,
        TaskStatus::Killed
    );

    // Cancelling a run that is already terminal is rejected.
    let err = fx.engine.cancel_run(run.id, "again").await.unwrap_err();
    assert!(matches!(err, EngineError::RunTerminal(_)));
    Ok(())
}

#[tokio::test]
async fn fresh_attempt_supersedes_the_active_one() -> Result<()> {
    let fx = linear_fixture(EngineConfig::default()).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:aa77").await?;
    fx.engine
        .mark_resource_complete(raw.resource().unwrap())
        .await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job6", raw.id))
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    let task_id = child(&view, "align").tasks[0].task.id;
    let first = child(&view, "align").tasks[0].attempts[0].id;

    let second = fx.engine.create_task_attempt(task_id).await?;
    wait_for_dispatches(&fx.manager, 2).await;

    // The superseded attempt's failure stays on its own record; the task
    // and run carry on with the replacement.
    fx.engine
        .report_attempt_failed(first, "worker presumed lost".to_string(), None)
        .await?;
    let view = fx.engine.get_run_view(run.id).await?;
    let task = &child(&view, "align").tasks[0];
    assert_eq!(task.attempts.len(), 2);
    assert_eq!(task.task.active_attempt, Some(second.id));
    assert_ne!(task.task.status, TaskStatus::Failed);
    assert_eq!(view.run.status, RunStatus::Running);
    let stale = task.attempts.iter().find(|a| a.id == first).unwrap();
    assert_eq!(stale.status, TaskStatus::Failed);

    let aligned = fx.engine.post_file_object("aligned.bam", "sha:bb88").await?;
    fx.engine
        .mark_resource_complete(aligned.resource().unwrap())
        .await?;
    fx.engine
        .report_attempt_finished(
            second.id,
            vec![AttemptOutput {
                channel: "aligned".to_string(),
                objects: vec![aligned.id],
            }],
        )
        .await?;
    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(child(&view, "align").run.status, RunStatus::Finished);

    // Terminal tasks never grow new attempts.
    let err = fx.engine.create_task_attempt(task_id).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskTerminal(_)));
    Ok(())
}

#[tokio::test]
async fn view_skips_claims_whose_task_is_not_yet_visible() -> Result<()> {
    let fx = linear_fixture(EngineConfig::default()).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:gg88").await?;
    fx.engine
        .mark_resource_complete(raw.resource().unwrap())
        .await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job7", raw.id))
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    let align_id = child(&view, "align").run.id;

    // An input-set claim commits before its task row is inserted; a read
    // in that window must not fail on the missing task.
    let ghost = TaskId::new();
    guard::save_with_retries(&*fx.store, align_id, 3, |run: &mut Run| {
        run.input_set_claims.push(InputSetClaim {
            signature: vec![DataPath::root()],
            task: ghost,
        });
        Ok(())
    })
    .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    assert_eq!(child(&view, "align").tasks.len(), 1);
    Ok(())
}

#[tokio::test]
async fn worker_settings_scope_directories_per_attempt() -> Result<()> {
    let workdir = tempfile::tempdir()?;
    let mut config = EngineConfig::default();
    config.task_workdir_root = workdir.path().to_path_buf();
    let fx = linear_fixture(config).await?;

    let raw = fx.engine.post_file_object("reads.fastq", "sha:ff66").await?;
    fx.engine
        .mark_resource_complete(raw.resource().unwrap())
        .await?;
    let run = fx
        .engine
        .create_run(fx.workflow, file_request("job5", raw.id))
        .await?;

    let view = fx.engine.get_run_view(run.id).await?;
    let task = &child(&view, "align").tasks[0];
    let settings = fx.engine.worker_settings(task.attempts[0].id).await?;
    assert!(settings.working_dir.starts_with(workdir.path()));
    let dir = settings.working_dir.to_string_lossy().to_string();
    assert!(dir.contains(&task.task.id.to_string()));
    assert!(dir.contains(&task.attempts[0].id.to_string()));
    Ok(())
}
