use pipecore::{
    Connection, ConstructionError, Direction, Interface, NodeId, NodeSpec, Outputs,
    PipelineError, ProcessAdapter, ResolutionError, RunInputs, Value, Workflow,
};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Check, before anything runs, that run inputs name real ports and that every
/// required input has a connection, a default or a run input.
pub(crate) fn check_inputs(workflow: &Workflow, run_inputs: &RunInputs) -> Result<(), PipelineError> {
    for (node_id, values) in run_inputs {
        let node = workflow
            .find_node(node_id)
            .ok_or_else(|| ConstructionError::UnknownNode(node_id.clone()))?;
        if let Some(port) = values.keys().find(|p| node.input_port(p).is_none()) {
            return Err(ConstructionError::UnknownPort {
                node: node_id.clone(),
                port: port.clone(),
                direction: Direction::Input,
            }
            .into());
        }
    }

    for node in workflow.nodes() {
        let supplied = run_inputs.get(node.id());
        for port in node.input_ports() {
            let needed = port.required || node.is_iterfield(&port.name);
            let satisfied = workflow.connection_into(node.id(), &port.name).is_some()
                || node.defaults().contains_key(&port.name)
                || supplied.is_some_and(|values| values.contains_key(&port.name));
            if needed && !satisfied {
                return Err(ResolutionError::MissingInput {
                    node: node.id().clone(),
                    port: port.name.clone(),
                }
                .into());
            }
        }
    }

    Ok(())
}

/// Reject process nodes whose tool the adapter does not list. Adapters that list
/// no tools are not checked.
pub(crate) fn check_tools(
    workflow: &Workflow,
    adapter: &dyn ProcessAdapter,
) -> Result<(), ConstructionError> {
    let known = adapter.tools();
    if known.is_empty() {
        return Ok(());
    }
    for node in workflow.nodes() {
        if let Interface::Process { tool, .. } = node.interface() {
            if !known.contains(tool) {
                return Err(ConstructionError::UnknownTool {
                    node: node.id().clone(),
                    tool: tool.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Bind a value to every input port of `node`.
///
/// Precedence: connection, then run input, then node default. Every upstream node
/// must already be finished and present in `completed`.
pub(crate) fn resolve_inputs(
    workflow: &Workflow,
    node: &NodeSpec,
    completed: &HashMap<NodeId, Outputs>,
    run_inputs: &RunInputs,
) -> Result<Outputs, ResolutionError> {
    let mut inputs = Outputs::new();
    let supplied = run_inputs.get(node.id());

    for port in node.input_ports() {
        let name = &port.name;
        let iterfield = node.is_iterfield(name);

        let value = match workflow.connection_into(node.id(), name) {
            Some(conn) => {
                let upstream = completed
                    .get(&conn.from_node)
                    .and_then(|outputs| outputs.get(&conn.from_port));
                match upstream {
                    Some(value) => Some(apply_connection(conn, value.clone())?),
                    None if port.required || iterfield => {
                        return Err(ResolutionError::UpstreamOutputMissing {
                            source_node: conn.from_node.clone(),
                            source_port: conn.from_port.clone(),
                            node: node.id().clone(),
                            port: name.clone(),
                        })
                    }
                    None => None,
                }
            }
            None => supplied
                .and_then(|values| values.get(name))
                .or_else(|| node.defaults().get(name))
                .cloned(),
        };

        match value {
            Some(value) => {
                if iterfield && !value.is_sequence() {
                    return Err(ResolutionError::ExpectedSequence {
                        node: node.id().clone(),
                        port: name.clone(),
                        found: value.kind().to_string(),
                    });
                }
                inputs.insert(name.clone(), value);
            }
            None if port.required || iterfield => {
                return Err(ResolutionError::MissingInput {
                    node: node.id().clone(),
                    port: name.clone(),
                })
            }
            None => {}
        }
    }

    Ok(inputs)
}

/// Apply a connection's selector, then its transform, to a value in transit.
pub(crate) fn apply_connection(conn: &Connection, value: Value) -> Result<Value, ResolutionError> {
    let mut value = value;

    if let Some(selector) = &conn.selector {
        if let Value::Array(items) = &value {
            if items.is_empty() {
                return Err(ResolutionError::EmptyCollection {
                    node: conn.to_node.clone(),
                    port: conn.to_port.clone(),
                    selector: selector.name().to_string(),
                });
            }
            value = selector.select(items);
        }
    }

    if let Some(transform) = &conn.transform {
        let outcome = catch_unwind(AssertUnwindSafe(|| transform.apply(value)));
        value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(transform_error(conn, transform.name(), format!("{:#}", e))),
            Err(_) => return Err(transform_error(conn, transform.name(), "transform panicked".into())),
        };
    }

    Ok(value)
}

fn transform_error(conn: &Connection, transform: &str, cause: String) -> ResolutionError {
    ResolutionError::Transform {
        node: conn.to_node.clone(),
        port: conn.to_port.clone(),
        transform: transform.to_string(),
        cause,
    }
}
