use crate::invoke::{invoke, RunContext};
use crate::mapnode::run_map;
use crate::report::{NodeOutcome, RunReport};
use crate::resolve::{check_inputs, check_tools, resolve_inputs};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use pipecore::{
    ExecutionError, ExecutionEvent, NodeId, Outputs, PipelineError, RunInputs, Workflow,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What happens to the rest of the run when a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed node's dependents; independent branches keep running.
    #[default]
    ContinueIndependent,
    /// Stop dispatching after the first failure. Dependents are skipped, every
    /// other node that has not started is cancelled.
    StopRun,
}

type NodeTask = JoinHandle<(NodeId, Result<(Outputs, bool), ExecutionError>, u64)>;

/// Executes workflows as DAGs with parallel execution
pub(crate) struct WorkflowExecutor {
    on_failure: FailurePolicy,
}

impl WorkflowExecutor {
    pub(crate) fn new(on_failure: FailurePolicy) -> Self {
        Self { on_failure }
    }

    /// Execute a workflow and return one outcome per node.
    ///
    /// Construction and resolution errors abort the run and are returned as `Err`;
    /// execution errors are recorded in the report.
    pub(crate) async fn execute(
        &self,
        workflow: &Workflow,
        ctx: Arc<RunContext>,
        run_inputs: RunInputs,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let execution_id = ctx.execution_id;
        let start_time = Instant::now();

        check_inputs(workflow, &run_inputs)?;
        check_tools(workflow, ctx.adapter.as_ref())?;

        ctx.events.emit(ExecutionEvent::RunStarted {
            execution_id,
            workflow: workflow.name().to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!("Starting workflow run: {} ({})", workflow.name(), execution_id);

        let order = workflow.topological_order();
        let mut pending: Vec<NodeId> = order.clone();
        let mut outcomes: HashMap<NodeId, NodeOutcome> = HashMap::new();
        let mut completed: HashMap<NodeId, Outputs> = HashMap::new();
        let mut running: FuturesUnordered<NodeTask> = FuturesUnordered::new();
        let mut halted = false;

        loop {
            if cancel.is_cancelled() {
                halted = true;
            }

            // Walk pending nodes in topological order so that a node's upstream
            // outcome is always settled before the node itself is looked at.
            let mut waiting = Vec::new();
            for node_id in std::mem::take(&mut pending) {
                let upstream = workflow.upstream(&node_id);

                let blocked = upstream.iter().find_map(|up| match outcomes.get(up) {
                    Some(NodeOutcome::Done { .. }) | None => None,
                    Some(outcome) => Some((up.clone(), outcome.clone())),
                });
                if let Some((blocker, outcome)) = blocked {
                    let outcome = match outcome {
                        NodeOutcome::Cancelled => NodeOutcome::Cancelled,
                        _ => NodeOutcome::Skipped { upstream: blocker },
                    };
                    self.settle(&ctx, &node_id, outcome, &mut outcomes);
                    continue;
                }

                if !upstream.iter().all(|up| outcomes.contains_key(up)) {
                    waiting.push(node_id);
                    continue;
                }

                if halted {
                    self.settle(&ctx, &node_id, NodeOutcome::Cancelled, &mut outcomes);
                    continue;
                }

                let Some(node) = workflow.find_node(&node_id) else {
                    continue;
                };
                let inputs = match resolve_inputs(workflow, node, &completed, &run_inputs) {
                    Ok(inputs) => inputs,
                    Err(e) => {
                        tracing::error!("Cannot resolve inputs of {}: {}", node_id, e);
                        for task in running.iter() {
                            task.abort();
                        }
                        self.finish(&ctx, false, start_time);
                        return Err(e.into());
                    }
                };

                ctx.events.emit(ExecutionEvent::NodeStarted {
                    execution_id,
                    node_id: node_id.clone(),
                    interface: node.interface().fingerprint(),
                    timestamp: Utc::now(),
                });

                let node = node.clone();
                let task_ctx = ctx.clone();
                running.push(tokio::spawn(async move {
                    let start = Instant::now();
                    let result = if node.is_map() {
                        run_map(&task_ctx, &node, inputs).await
                    } else {
                        invoke(&task_ctx, &node, None, inputs).await
                    };
                    let duration_ms = start.elapsed().as_millis() as u64;
                    (node.id().clone(), result, duration_ms)
                }));
            }
            pending = waiting;

            // If nothing is running, nothing pending can become ready
            if running.is_empty() {
                for node_id in pending.drain(..) {
                    self.settle(&ctx, &node_id, NodeOutcome::Cancelled, &mut outcomes);
                }
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !halted => {
                    tracing::warn!("Cancellation requested; no further nodes will start");
                    halted = true;
                    continue;
                }
                Some(joined) = running.next() => joined,
            };

            let (node_id, result, duration_ms) = match joined {
                Ok(done) => done,
                Err(e) => {
                    for task in running.iter() {
                        task.abort();
                    }
                    self.finish(&ctx, false, start_time);
                    return Err(PipelineError::Join(e.to_string()));
                }
            };

            match result {
                Ok((outputs, cached)) => {
                    tracing::info!(
                        "Node {} completed in {}ms{}",
                        node_id,
                        duration_ms,
                        if cached { " (cached)" } else { "" }
                    );
                    ctx.events.emit(ExecutionEvent::NodeCompleted {
                        execution_id,
                        node_id: node_id.clone(),
                        cached,
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    completed.insert(node_id.clone(), outputs.clone());
                    outcomes.insert(node_id, NodeOutcome::Done { outputs, cached });
                }
                Err(error) => {
                    tracing::error!("Node {} failed: {}", node_id, error);
                    ctx.events.emit(ExecutionEvent::NodeFailed {
                        execution_id,
                        node_id: node_id.clone(),
                        error: error.to_string(),
                        timestamp: Utc::now(),
                    });
                    outcomes.insert(node_id, NodeOutcome::Failed { error });
                    if self.on_failure == FailurePolicy::StopRun {
                        halted = true;
                    }
                }
            }
        }

        let mut missing_outputs = Vec::new();
        for node in workflow.nodes() {
            if let Some(NodeOutcome::Done { outputs, .. }) = outcomes.get(node.id()) {
                for port in node.output_ports().iter().filter(|p| p.required) {
                    if !outputs.contains_key(&port.name) {
                        missing_outputs.push((node.id().clone(), port.name.clone()));
                    }
                }
            }
        }

        let outcomes: Vec<(NodeId, NodeOutcome)> = order
            .into_iter()
            .map(|id| {
                let outcome = outcomes.remove(&id).unwrap_or(NodeOutcome::Cancelled);
                (id, outcome)
            })
            .collect();

        let report = RunReport {
            execution_id,
            outcomes,
            records: ctx.journal.snapshot(),
            missing_outputs,
            duration_ms: start_time.elapsed().as_millis() as u64,
        };
        let succeeded = report.succeeded();
        self.finish(&ctx, succeeded, start_time);
        tracing::info!(
            "Workflow run {} finished: {}",
            execution_id,
            if succeeded { "succeeded" } else { "failed" }
        );

        Ok(report)
    }

    fn settle(
        &self,
        ctx: &RunContext,
        node_id: &NodeId,
        outcome: NodeOutcome,
        outcomes: &mut HashMap<NodeId, NodeOutcome>,
    ) {
        let event = match &outcome {
            NodeOutcome::Skipped { upstream } => {
                tracing::warn!("Skipping {}: upstream {} did not complete", node_id, upstream);
                ExecutionEvent::NodeSkipped {
                    execution_id: ctx.execution_id,
                    node_id: node_id.clone(),
                    upstream: upstream.clone(),
                    timestamp: Utc::now(),
                }
            }
            _ => {
                tracing::warn!("Cancelled {}", node_id);
                ExecutionEvent::NodeCancelled {
                    execution_id: ctx.execution_id,
                    node_id: node_id.clone(),
                    timestamp: Utc::now(),
                }
            }
        };
        ctx.events.emit(event);
        outcomes.insert(node_id.clone(), outcome);
    }

    fn finish(&self, ctx: &RunContext, succeeded: bool, start_time: Instant) {
        ctx.events.emit(ExecutionEvent::RunCompleted {
            execution_id: ctx.execution_id,
            succeeded,
            duration_ms: start_time.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}
