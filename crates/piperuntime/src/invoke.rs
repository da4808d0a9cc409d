use crate::cache::{CacheKey, InFlight, ResultCache};
use crate::report::Journal;
use pipecore::{
    EventBus, ExecutionError, ExecutionId, FunctionArgs, Interface, NodeSpec, Outputs,
    ProcessAdapter, RegisteredFunction, Value,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

/// Everything an invocation needs, shared by all tasks of one run.
pub(crate) struct RunContext {
    pub(crate) execution_id: ExecutionId,
    pub(crate) root: PathBuf,
    pub(crate) adapter: Arc<dyn ProcessAdapter>,
    pub(crate) cache: Arc<dyn ResultCache>,
    pub(crate) flights: Arc<InFlight>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) journal: Journal,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_parallel: usize,
}

/// Label used in errors: `id`, or `id[index]` for a map element.
pub(crate) fn label(node: &NodeSpec, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{}[{}]", node.id(), i),
        None => node.id().clone(),
    }
}

/// Working directory of an invocation, relative to the workflow root.
pub(crate) fn scope(node: &NodeSpec, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{}/_{}", node.id(), i),
        None => node.id().clone(),
    }
}

/// Run one concrete invocation, reusing a cached result when one exists.
///
/// Returns the outputs and whether they came from the cache.
pub(crate) async fn invoke(
    ctx: &RunContext,
    node: &NodeSpec,
    index: Option<usize>,
    inputs: Outputs,
) -> Result<(Outputs, bool), ExecutionError> {
    let label = label(node, index);
    let scope = scope(node, index);
    let cache_error = |e: crate::cache::CacheError| ExecutionError::Cache {
        node: label.clone(),
        cause: e.to_string(),
    };

    let key = CacheKey::compute(scope.as_str(), node.interface(), &inputs).map_err(cache_error)?;
    let slot = ctx.journal.open(&scope, node.id(), index, &key);
    tracing::debug!("Invocation {} has key {}", label, key.digest);

    let _flight = ctx.flights.acquire(&key).await;

    match ctx.cache.lookup(&key).await {
        Ok(Some(outputs)) => {
            tracing::debug!("Reusing cached result for {}", label);
            ctx.journal.done(slot, &outputs, true);
            return Ok((outputs, true));
        }
        Ok(None) => {}
        Err(e) => {
            ctx.journal.failed(slot);
            return Err(cache_error(e));
        }
    }

    // The semaphore is owned by the runtime and never closed.
    let permit = ctx.permits.acquire().await.ok();
    ctx.journal.running(slot);

    let work = dispatch(ctx, node, &label, &scope, &inputs);
    let result = match ctx.timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| {
                Err(ExecutionError::Timeout {
                    node: label.clone(),
                    millis: limit.as_millis() as u64,
                })
            }),
        None => work.await,
    };
    drop(permit);

    match result {
        Ok(outputs) => {
            if let Err(e) = ctx.cache.store(&key, &outputs).await {
                ctx.journal.failed(slot);
                return Err(cache_error(e));
            }
            ctx.journal.done(slot, &outputs, false);
            Ok((outputs, false))
        }
        Err(e) => {
            ctx.journal.failed(slot);
            Err(e)
        }
    }
}

async fn dispatch(
    ctx: &RunContext,
    node: &NodeSpec,
    label: &str,
    scope: &str,
    inputs: &Outputs,
) -> Result<Outputs, ExecutionError> {
    match node.interface() {
        Interface::Identity => Ok(node
            .output_ports()
            .iter()
            .filter_map(|port| {
                inputs
                    .get(&port.name)
                    .map(|value| (port.name.clone(), value.clone()))
            })
            .collect()),
        Interface::Function { function } => call_function(function.clone(), label, inputs.clone()).await,
        Interface::Process { tool, params } => {
            let working_dir = ctx.root.join(scope);
            call_process(ctx.adapter.as_ref(), node, label, tool, params, inputs, &working_dir).await
        }
    }
}

async fn call_function(
    function: Arc<RegisteredFunction>,
    label: &str,
    args: Outputs,
) -> Result<Outputs, ExecutionError> {
    let failure = |cause: String| ExecutionError::Function {
        node: label.to_string(),
        function: function.name().to_string(),
        cause,
    };

    let callee = function.clone();
    let returned = tokio::task::spawn_blocking(move || callee.call(&FunctionArgs::new(args)))
        .await
        .map_err(|e| failure(panic_message(e)))?
        .map_err(|e| failure(format!("{:#}", e)))?;

    let mut outputs = Outputs::new();
    for port in function.signature().returns_ports() {
        match returned.get(&port.name) {
            Some(value) => {
                outputs.insert(port.name.clone(), value.clone());
            }
            None if port.required => {
                return Err(failure(format!("did not return declared field '{}'", port.name)))
            }
            None => {}
        }
    }
    Ok(outputs)
}

async fn call_process(
    adapter: &dyn ProcessAdapter,
    node: &NodeSpec,
    label: &str,
    tool: &str,
    params: &Outputs,
    inputs: &Outputs,
    working_dir: &Path,
) -> Result<Outputs, ExecutionError> {
    let failure = |exit_code: Option<i32>, reason: String| ExecutionError::ExternalProcess {
        node: label.to_string(),
        tool: tool.to_string(),
        exit_code,
        reason,
    };

    tokio::fs::create_dir_all(working_dir).await.map_err(|e| {
        failure(
            None,
            format!("cannot create working directory {}: {}", working_dir.display(), e),
        )
    })?;

    let mut args = params.clone();
    args.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));

    tracing::debug!("Invoking tool {} for {} in {}", tool, label, working_dir.display());
    let produced = adapter
        .invoke(tool, &args, working_dir)
        .await
        .map_err(|e| failure(e.exit_code(), e.to_string()))?;

    let mut outputs = Outputs::new();
    for port in node.output_ports() {
        let violation = |detail: String| ExecutionError::OutputContractViolation {
            node: label.to_string(),
            port: port.name.clone(),
            detail,
        };
        match produced.get(&port.name) {
            Some(path) => {
                let path = if path.is_relative() {
                    working_dir.join(path)
                } else {
                    path.clone()
                };
                if tokio::fs::metadata(&path).await.is_ok() {
                    outputs.insert(port.name.clone(), Value::Path(path));
                } else if port.required {
                    return Err(violation(format!("{} does not exist", path.display())));
                }
            }
            None if port.required => {
                return Err(violation("the tool reported no file for it".to_string()))
            }
            None => {}
        }
    }
    Ok(outputs)
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .map(|msg| format!("panicked: {}", msg))
            .unwrap_or_else(|| "panicked".to_string()),
        Err(err) => err.to_string(),
    }
}
