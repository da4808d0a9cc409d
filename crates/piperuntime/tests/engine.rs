use async_trait::async_trait;
use pipecore::{
    ConstructionError, ExecutionError, ExecutionEvent, FunctionRegistry, NodeSpec, Outputs,
    PipelineError, Port, ProcessAdapter, ProcessError, ResolutionError, RunInputs, Selector,
    Value, Workflow,
};
use piperuntime::{
    CacheMode, CancellationToken, FailurePolicy, NodeOutcome, PipelineRuntime, RuntimeConfig,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memory_runtime(config: RuntimeConfig) -> PipelineRuntime {
    PipelineRuntime::new(RuntimeConfig {
        cache: CacheMode::Memory,
        ..config
    })
}

fn inputs_for(node: &str, values: &[(&str, Value)]) -> RunInputs {
    let outputs: Outputs = values
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    RunInputs::from([(node.to_string(), outputs)])
}

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn("double", &["x"], &["y"], |args| {
            let x = args.number("x")?;
            Ok(Outputs::from([("y".to_string(), Value::from(x * 2.0))]))
        })
        .unwrap();
    registry
        .register_fn("slow", &["x"], &["y"], |args| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Outputs::from([("y".to_string(), args.get("x")?.clone())]))
        })
        .unwrap();
    registry
}

/// Adapter whose every tool exits with status 2.
struct FailingAdapter;

#[async_trait]
impl ProcessAdapter for FailingAdapter {
    async fn invoke(
        &self,
        _tool: &str,
        _params: &Outputs,
        _working_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, ProcessError> {
        Err(ProcessError::NonZeroExit {
            code: Some(2),
            stderr: "segmentation fault".into(),
        })
    }
}

/// `touch` writes `out.nii` into the working directory; `ghost` only claims to.
struct FileAdapter;

#[async_trait]
impl ProcessAdapter for FileAdapter {
    async fn invoke(
        &self,
        tool: &str,
        _params: &Outputs,
        working_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, ProcessError> {
        match tool {
            "touch" => {
                tokio::fs::write(working_dir.join("out.nii"), b"voxels")
                    .await
                    .map_err(|e| ProcessError::Io(e.to_string()))?;
                Ok(BTreeMap::from([("out_file".to_string(), PathBuf::from("out.nii"))]))
            }
            "ghost" => Ok(BTreeMap::from([(
                "out_file".to_string(),
                PathBuf::from("never_written.nii"),
            )])),
            other => Err(ProcessError::UnknownTool(other.to_string())),
        }
    }

    fn tools(&self) -> Vec<String> {
        vec!["ghost".to_string(), "touch".to_string()]
    }
}

fn tool_node(id: &str, tool: &str) -> NodeSpec {
    NodeSpec::process(id, tool)
        .with_input_port("in_file")
        .with_output_port("out_file")
}

/// slow -> after_slow, broken -> after_broken
fn two_branch_workflow(root: &Path) -> (Workflow, RunInputs) {
    let registry = registry();
    let mut wf = Workflow::new("two-branch").with_working_dir(root);
    wf.add_node(NodeSpec::function("slow", &registry, "slow").unwrap())
        .unwrap();
    wf.add_node(NodeSpec::identity("after_slow", ["y"])).unwrap();
    wf.add_node(tool_node("broken", "bet")).unwrap();
    wf.add_node(NodeSpec::identity("after_broken", ["value"]))
        .unwrap();
    wf.connect("slow", "y", "after_slow", "y").unwrap();
    wf.connect("broken", "out_file", "after_broken", "value")
        .unwrap();

    let mut inputs = inputs_for("slow", &[("x", Value::from(1))]);
    inputs.extend(inputs_for("broken", &[("in_file", Value::from("t1.nii"))]));
    (wf, inputs)
}

#[tokio::test]
async fn test_double_end_to_end() {
    init_tracing();
    let registry = registry();
    let mut wf = Workflow::new("double");
    wf.add_node(NodeSpec::identity("inputnode", ["x"])).unwrap();
    wf.add_node(NodeSpec::function("double", &registry, "double").unwrap())
        .unwrap();
    wf.add_node(NodeSpec::identity("outputnode", ["y"])).unwrap();
    wf.connect("inputnode", "x", "double", "x").unwrap();
    wf.connect("double", "y", "outputnode", "y").unwrap();

    let runtime = memory_runtime(RuntimeConfig::default());
    let report = runtime
        .run_with_inputs(&wf, inputs_for("inputnode", &[("x", Value::from(5))]))
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(
        report.outputs("outputnode"),
        Some(&Outputs::from([("y".to_string(), Value::from(10))]))
    );
    assert_eq!(report.output("inputnode", "x"), Some(&Value::from(5)));
}

#[tokio::test]
async fn test_missing_input_is_reported_before_anything_runs() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn("count", &["x"], &["y"], move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Outputs::from([("y".to_string(), args.get("x")?.clone())]))
        })
        .unwrap();

    let mut wf = Workflow::new("missing");
    wf.add_node(NodeSpec::identity("inputnode", ["x"])).unwrap();
    wf.add_node(NodeSpec::function("first", &registry, "count").unwrap())
        .unwrap();
    wf.add_node(NodeSpec::function("second", &registry, "count").unwrap())
        .unwrap();
    wf.connect("inputnode", "x", "first", "x").unwrap();

    let runtime = memory_runtime(RuntimeConfig::default());
    let err = runtime
        .run_with_inputs(&wf, inputs_for("inputnode", &[("x", Value::from(1))]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PipelineError::Resolution(ResolutionError::MissingInput {
            node: "second".into(),
            port: "x".into()
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_run_input_for_unknown_port_is_rejected() {
    let mut wf = Workflow::new("typo");
    wf.add_node(NodeSpec::identity("inputnode", ["x"])).unwrap();

    let runtime = memory_runtime(RuntimeConfig::default());
    let err = runtime
        .run_with_inputs(&wf, inputs_for("inputnode", &[("z", Value::from(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Construction(_)));
}

#[tokio::test]
async fn test_failed_tool_skips_only_its_dependents() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (wf, inputs) = two_branch_workflow(dir.path());

    let runtime =
        memory_runtime(RuntimeConfig::default()).with_adapter(Arc::new(FailingAdapter));
    let report = runtime.run_with_inputs(&wf, inputs).await.unwrap();

    assert!(!report.succeeded());
    match report.outcome("broken").unwrap() {
        NodeOutcome::Failed {
            error:
                ExecutionError::ExternalProcess {
                    node,
                    tool,
                    exit_code,
                    reason,
                },
        } => {
            assert_eq!(node, "broken");
            assert_eq!(tool, "bet");
            assert_eq!(*exit_code, Some(2));
            assert!(reason.contains("segmentation fault"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        report.outcome("after_broken"),
        Some(&NodeOutcome::Skipped {
            upstream: "broken".into()
        })
    );
    assert!(report.outcome("slow").unwrap().is_done());
    assert_eq!(report.output("after_slow", "y"), Some(&Value::from(1)));
    assert_eq!(report.failed_nodes(), vec!["broken"]);
}

#[tokio::test]
async fn test_stop_run_policy_cancels_independent_branches() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (wf, inputs) = two_branch_workflow(dir.path());

    let runtime = memory_runtime(RuntimeConfig {
        on_failure: FailurePolicy::StopRun,
        ..Default::default()
    })
    .with_adapter(Arc::new(FailingAdapter));
    let report = runtime.run_with_inputs(&wf, inputs).await.unwrap();

    // Already running when the failure happened, so it is allowed to finish
    assert!(report.outcome("slow").unwrap().is_done());
    assert_eq!(report.outcome("after_slow"), Some(&NodeOutcome::Cancelled));
    assert!(matches!(
        report.outcome("after_broken"),
        Some(NodeOutcome::Skipped { .. })
    ));
}

#[tokio::test]
async fn test_cancellation_stops_dispatch() {
    init_tracing();
    let registry = registry();
    let mut wf = Workflow::new("cancel");
    wf.add_node(NodeSpec::function("slow", &registry, "slow").unwrap())
        .unwrap();
    wf.add_node(NodeSpec::function("double", &registry, "double").unwrap())
        .unwrap();
    wf.connect("slow", "y", "double", "x").unwrap();

    let runtime = memory_runtime(RuntimeConfig::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = runtime
        .run_with_cancel(&wf, inputs_for("slow", &[("x", Value::from(3))]), cancel)
        .await
        .unwrap();

    assert!(report.outcome("slow").unwrap().is_done());
    assert_eq!(report.outcome("double"), Some(&NodeOutcome::Cancelled));
    assert!(!report.succeeded());
}

#[tokio::test]
async fn test_function_panic_becomes_function_error() {
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn("explode", &["x"], &["y"], |_| panic!("division by zero"))
        .unwrap();
    let mut wf = Workflow::new("panic");
    wf.add_node(
        NodeSpec::function("explode", &registry, "explode")
            .unwrap()
            .with_input("x", 1),
    )
    .unwrap();

    let report = memory_runtime(RuntimeConfig::default())
        .run(&wf)
        .await
        .unwrap();

    match report.outcome("explode").unwrap() {
        NodeOutcome::Failed {
            error: ExecutionError::Function { function, cause, .. },
        } => {
            assert_eq!(function, "explode");
            assert!(cause.contains("division by zero"), "cause was: {cause}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_function_error_keeps_context() {
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn("double", &["x"], &["y"], |args| {
            let x = args.number("x")?;
            Ok(Outputs::from([("y".to_string(), Value::from(x * 2.0))]))
        })
        .unwrap();
    let mut wf = Workflow::new("bad-arg");
    wf.add_node(
        NodeSpec::function("double", &registry, "double")
            .unwrap()
            .with_input("x", "five"),
    )
    .unwrap();

    let report = memory_runtime(RuntimeConfig::default())
        .run(&wf)
        .await
        .unwrap();
    let error = report.outcome("double").unwrap().error().cloned().unwrap();
    assert!(matches!(error, ExecutionError::Function { .. }));
    assert!(error.to_string().contains("'x'"), "error was: {error}");
}

#[tokio::test]
async fn test_slow_invocation_times_out() {
    let registry = registry();
    let mut wf = Workflow::new("timeout");
    wf.add_node(
        NodeSpec::function("slow", &registry, "slow")
            .unwrap()
            .with_input("x", 1),
    )
    .unwrap();

    let runtime = memory_runtime(RuntimeConfig {
        node_timeout_ms: Some(20),
        ..Default::default()
    });
    let report = runtime.run(&wf).await.unwrap();
    assert_eq!(
        report.outcome("slow").unwrap().error(),
        Some(&ExecutionError::Timeout {
            node: "slow".into(),
            millis: 20
        })
    );
}

#[tokio::test]
async fn test_tool_outputs_resolve_inside_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut wf = Workflow::new("touch").with_working_dir(dir.path());
    wf.add_node(tool_node("touch", "touch").with_input("in_file", "t1.nii"))
        .unwrap();

    let runtime = memory_runtime(RuntimeConfig::default()).with_adapter(Arc::new(FileAdapter));
    let report = runtime.run(&wf).await.unwrap();

    assert!(report.succeeded());
    let expected = dir.path().join("touch").join("out.nii");
    assert_eq!(
        report.output("touch", "out_file"),
        Some(&Value::Path(expected.clone()))
    );
    assert!(expected.exists());
}

#[tokio::test]
async fn test_missing_tool_output_violates_contract() {
    let dir = tempfile::tempdir().unwrap();
    let mut wf = Workflow::new("ghost").with_working_dir(dir.path());
    wf.add_node(tool_node("ghost", "ghost").with_input("in_file", "t1.nii"))
        .unwrap();

    let runtime = memory_runtime(RuntimeConfig::default()).with_adapter(Arc::new(FileAdapter));
    let report = runtime.run(&wf).await.unwrap();

    match report.outcome("ghost").unwrap().error() {
        Some(ExecutionError::OutputContractViolation { node, port, .. }) => {
            assert_eq!(node, "ghost");
            assert_eq!(port, "out_file");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_tool_is_rejected_before_anything_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut wf = Workflow::new("unknown-tool").with_working_dir(dir.path());
    wf.add_node(tool_node("touch", "touch").with_input("in_file", "t1.nii"))
        .unwrap();
    wf.add_node(tool_node("strip", "bet").with_input("in_file", "t1.nii"))
        .unwrap();

    let runtime = memory_runtime(RuntimeConfig::default()).with_adapter(Arc::new(FileAdapter));
    let err = runtime.run(&wf).await.unwrap_err();

    assert_eq!(
        err,
        PipelineError::Construction(ConstructionError::UnknownTool {
            node: "strip".into(),
            tool: "bet".into(),
        })
    );
    assert!(!dir.path().join("touch").exists());
}

#[tokio::test]
async fn test_selector_on_empty_sequence_aborts_run() {
    let mut wf = Workflow::new("empty");
    wf.add_node(NodeSpec::identity("files", [Port::sequence("paths")]))
        .unwrap();
    wf.add_node(NodeSpec::identity("pick", ["path"])).unwrap();
    wf.connect_with_selector("files", "paths", "pick", "path", Selector::first())
        .unwrap();

    let runtime = memory_runtime(RuntimeConfig::default());
    let err = runtime
        .run_with_inputs(&wf, inputs_for("files", &[("paths", Value::Array(vec![]))]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PipelineError::Resolution(ResolutionError::EmptyCollection {
            node: "pick".into(),
            port: "path".into(),
            selector: "first".into()
        })
    );
}

#[tokio::test]
async fn test_run_emits_lifecycle_events() {
    let registry = registry();
    let mut wf = Workflow::new("events");
    wf.add_node(
        NodeSpec::function("double", &registry, "double")
            .unwrap()
            .with_input("x", 2),
    )
    .unwrap();

    let runtime = memory_runtime(RuntimeConfig::default());
    let mut events = runtime.subscribe_events();
    let report = runtime.run(&wf).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution_id(), report.execution_id);
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ExecutionEvent::RunStarted { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ExecutionEvent::NodeCompleted { node_id, cached: false, .. } if node_id == "double")));
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::RunCompleted {
            succeeded: true,
            ..
        })
    ));
}
