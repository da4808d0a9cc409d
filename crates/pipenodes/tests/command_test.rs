#![cfg(unix)]

use pipecore::{
    ExecutionError, FunctionRegistry, NodeSpec, Outputs, Port, ProcessAdapter, ProcessError,
    RunInputs, Value, Workflow,
};
use pipenodes::{register_builtins, CommandAdapter, ToolSpec};
use piperuntime::{CacheMode, NodeOutcome, PipelineRuntime, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Upper-cases `in_file` into `<stem>_brain.txt`.
fn skullstrip_tool() -> ToolSpec {
    ToolSpec::new("sh")
        .args([
            "-c",
            "tr a-z A-Z < \"$1\" > \"$2\"",
            "sh",
            "{in_file}",
            "{in_file:stem}_brain.txt",
        ])
        .output("out_file", "{in_file:stem}_brain.txt")
}

#[tokio::test]
async fn test_non_zero_exit_reports_stderr_tail() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let adapter = CommandAdapter::new().with_tool(
        "fail",
        ToolSpec::new("sh").args(["-c", "echo 'cannot open image' >&2; exit 3"]),
    );

    let err = adapter
        .invoke("fail", &Outputs::new(), dir.path())
        .await
        .unwrap_err();

    match err {
        ProcessError::NonZeroExit { code, stderr } => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "cannot open image");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(dir.path().join("command.txt").exists());
    let logged = std::fs::read_to_string(dir.path().join("stderr.log")).unwrap();
    assert!(logged.contains("cannot open image"));
}

#[tokio::test]
async fn test_unknown_tool_and_missing_program() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = CommandAdapter::new()
        .with_tool("ghost", ToolSpec::new("definitely-not-an-installed-program"));

    assert_eq!(adapter.tools(), vec!["ghost"]);
    assert_eq!(
        adapter
            .invoke("bet", &Outputs::new(), dir.path())
            .await
            .unwrap_err(),
        ProcessError::UnknownTool("bet".into())
    );
    assert!(matches!(
        adapter
            .invoke("ghost", &Outputs::new(), dir.path())
            .await
            .unwrap_err(),
        ProcessError::Spawn { .. }
    ));
}

#[tokio::test]
async fn test_sequence_parameter_expands_to_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");
    std::fs::write(&first, "A").unwrap();
    std::fs::write(&second, "B").unwrap();

    let adapter = CommandAdapter::new().with_tool(
        "concat",
        ToolSpec::new("sh")
            .args(["-c", "cat \"$@\" > combined.txt", "sh", "{inputs}"])
            .output("combined", "combined.txt"),
    );
    let params = Outputs::from([(
        "inputs".to_string(),
        Value::from(vec![first.clone(), second.clone()]),
    )]);

    let outputs = adapter.invoke("concat", &params, dir.path()).await.unwrap();

    assert_eq!(outputs["combined"], PathBuf::from("combined.txt"));
    let combined = std::fs::read_to_string(dir.path().join("combined.txt")).unwrap();
    assert_eq!(combined, "AB");
    let command = std::fs::read_to_string(dir.path().join("command.txt")).unwrap();
    assert!(command.ends_with(&format!("{} {}", first.display(), second.display())));
}

#[tokio::test]
async fn test_skullstrip_merge_and_count() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for name in ["sub1", "sub2", "sub3"] {
        let path = dir.path().join(format!("{}.txt", name));
        std::fs::write(&path, name).unwrap();
        files.push(path);
    }

    let mut registry = FunctionRegistry::new();
    register_builtins(&mut registry).unwrap();

    let mut wf = Workflow::new("skullstrip").with_working_dir(dir.path().join("work"));
    wf.add_node(NodeSpec::identity("inputnode", [Port::sequence("files")]))
        .unwrap();
    wf.add_node(
        NodeSpec::process("skullstrip", "bet")
            .with_input_port("in_file")
            .with_output_port("out_file")
            .iterate_over(["in_file"]),
    )
    .unwrap();
    wf.add_node(NodeSpec::function("merge", &registry, "merge2").unwrap())
        .unwrap();
    wf.add_node(NodeSpec::function("count", &registry, "length").unwrap())
        .unwrap();
    wf.connect("inputnode", "files", "skullstrip", "in_file")
        .unwrap();
    wf.connect("skullstrip", "out_file", "merge", "in1").unwrap();
    wf.connect("merge", "out", "count", "items").unwrap();

    let runtime = PipelineRuntime::new(RuntimeConfig {
        cache: CacheMode::Memory,
        ..Default::default()
    })
    .with_adapter(Arc::new(CommandAdapter::new().with_tool("bet", skullstrip_tool())));
    let inputs = RunInputs::from([(
        "inputnode".to_string(),
        Outputs::from([("files".to_string(), Value::from(files))]),
    )]);

    let report = runtime.run_with_inputs(&wf, inputs).await.unwrap();

    assert!(report.succeeded(), "failed nodes: {:?}", report.failed_nodes());
    assert_eq!(report.output("count", "length"), Some(&Value::from(3)));

    let stripped = report
        .output("skullstrip", "out_file")
        .and_then(Value::as_array)
        .unwrap();
    let expected = dir
        .path()
        .join("work")
        .join("skullstrip")
        .join("_1")
        .join("sub2_brain.txt");
    assert_eq!(stripped[1], Value::Path(expected.clone()));
    assert_eq!(std::fs::read_to_string(expected).unwrap(), "SUB2");
}

#[tokio::test]
async fn test_failing_element_is_reported_with_its_index() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.txt");
    std::fs::write(&present, "ok").unwrap();

    let mut wf = Workflow::new("partial").with_working_dir(dir.path().join("work"));
    wf.add_node(
        NodeSpec::process("skullstrip", "bet")
            .with_input_port("in_file")
            .with_output_port("out_file")
            .iterate_over(["in_file"])
            .with_input(
                "in_file",
                vec![present, dir.path().join("absent.txt")],
            ),
    )
    .unwrap();

    let runtime = PipelineRuntime::new(RuntimeConfig {
        cache: CacheMode::Memory,
        ..Default::default()
    })
    .with_adapter(Arc::new(CommandAdapter::new().with_tool("bet", skullstrip_tool())));
    let report = runtime.run(&wf).await.unwrap();

    match report.outcome("skullstrip").unwrap() {
        NodeOutcome::Failed {
            error: ExecutionError::ExternalProcess { node, tool, .. },
        } => {
            assert_eq!(node, "skullstrip[1]");
            assert_eq!(tool, "bet");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}
