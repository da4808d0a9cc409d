use crate::invoke::{invoke, RunContext};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use pipecore::{ExecutionError, ExecutionEvent, NodeSpec, Outputs, Value};

/// Split the inputs of a map node into one input set per element.
///
/// Iterfields are zipped index-wise; every other input is broadcast unchanged.
/// Fails with a shape mismatch, before anything runs, if the iterfields differ
/// in length.
pub(crate) fn expand(node: &NodeSpec, inputs: &Outputs) -> Result<Vec<Outputs>, ExecutionError> {
    let columns: Vec<(&String, &[Value])> = node
        .iterfields()
        .iter()
        .map(|field| {
            let items = inputs.get(field).and_then(Value::as_array).unwrap_or(&[]);
            (field, items)
        })
        .collect();

    let len = columns.first().map(|(_, items)| items.len()).unwrap_or(0);
    if columns.iter().any(|(_, items)| items.len() != len) {
        return Err(ExecutionError::ShapeMismatch {
            node: node.id().clone(),
            lengths: columns
                .iter()
                .map(|(field, items)| ((*field).clone(), items.len()))
                .collect(),
        });
    }

    let broadcast: Outputs = inputs
        .iter()
        .filter(|(name, _)| !node.is_iterfield(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok((0..len)
        .map(|i| {
            let mut element = broadcast.clone();
            for (field, items) in &columns {
                element.insert((*field).clone(), items[i].clone());
            }
            element
        })
        .collect())
}

/// Gather per-element outputs into one sequence per output port, in element order.
pub(crate) fn collect(node: &NodeSpec, elements: &[Outputs]) -> Outputs {
    node.output_ports()
        .iter()
        .map(|port| {
            let column = elements
                .iter()
                .map(|outputs| outputs.get(&port.name).cloned().unwrap_or(Value::Null))
                .collect();
            (port.name.clone(), Value::Array(column))
        })
        .collect()
}

/// Run a map node: expand, invoke every element, collect positionally.
///
/// Fail-fast: the first element error aborts the node, elements still in flight
/// are dropped, and no partial result is returned.
pub(crate) async fn run_map(
    ctx: &RunContext,
    node: &NodeSpec,
    inputs: Outputs,
) -> Result<(Outputs, bool), ExecutionError> {
    let elements = expand(node, &inputs)?;
    let count = elements.len();
    tracing::debug!("Map node {} expands to {} elements", node.id(), count);

    let results: Result<Vec<(Outputs, bool)>, ExecutionError> = stream::iter(elements.into_iter().enumerate())
        .map(|(index, element)| async move {
            let (outputs, cached) = invoke(ctx, node, Some(index), element).await?;
            ctx.events.emit(ExecutionEvent::ElementCompleted {
                execution_id: ctx.execution_id,
                node_id: node.id().clone(),
                index,
                cached,
                timestamp: Utc::now(),
            });
            Ok::<_, ExecutionError>((outputs, cached))
        })
        .buffered(ctx.max_parallel.max(1))
        .try_collect()
        .await;

    let results = match results {
        Ok(results) => results,
        Err(e) => {
            ctx.journal.abandon(node.id());
            return Err(e);
        }
    };

    let cached = count > 0 && results.iter().all(|(_, cached)| *cached);
    let outputs: Vec<Outputs> = results.into_iter().map(|(outputs, _)| outputs).collect();
    Ok((collect(node, &outputs), cached))
}
