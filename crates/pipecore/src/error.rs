use crate::port::{Arity, Direction};
use crate::NodeId;
use thiserror::Error;

/// Errors raised while declaring a workflow. Never produced during execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionError {
    #[error("Invalid node id '{0}': must be a non-empty single path component")]
    InvalidNodeId(NodeId),

    #[error("Node '{0}' is already declared in this workflow")]
    DuplicateNode(NodeId),

    #[error("Node '{0}' is not declared in this workflow")]
    UnknownNode(NodeId),

    #[error("Node '{node}' has no {direction} port named '{port}'")]
    UnknownPort {
        node: NodeId,
        port: String,
        direction: Direction,
    },

    #[error("Port '{port}' is declared twice on node '{node}'")]
    DuplicatePort { node: NodeId, port: String },

    #[error(
        "Cannot wire {source_node}.{source_port} ({delivered}) into {dest_node}.{dest_port} ({expected})"
    )]
    ArityMismatch {
        source_node: NodeId,
        source_port: String,
        dest_node: NodeId,
        dest_port: String,
        delivered: Arity,
        expected: Arity,
    },

    #[error("Input {node}.{port} already has an incoming connection")]
    DuplicateInput { node: NodeId, port: String },

    #[error("Connecting '{source_node}' to '{dest_node}' would create a cycle")]
    Cycle { source_node: NodeId, dest_node: NodeId },

    #[error("Function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("Node '{node}' runs tool '{tool}', which the process adapter does not provide")]
    UnknownTool { node: NodeId, tool: String },

    #[error("Function '{0}' is already registered")]
    DuplicateFunction(String),

    #[error("Iterfield '{field}' on map node '{node}' is not an input port")]
    InvalidIterfield { node: NodeId, field: String },
}

/// Errors raised while preparing the inputs of a node that is about to run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Required input {node}.{port} has no connection, default or run input")]
    MissingInput { node: NodeId, port: String },

    #[error("Upstream {source_node}.{source_port} produced no value for {node}.{port}")]
    UpstreamOutputMissing {
        source_node: NodeId,
        source_port: String,
        node: NodeId,
        port: String,
    },

    #[error("Selector '{selector}' applied to an empty sequence for {node}.{port}")]
    EmptyCollection {
        node: NodeId,
        port: String,
        selector: String,
    },

    #[error("Input {node}.{port} expected a sequence, got {found}")]
    ExpectedSequence {
        node: NodeId,
        port: String,
        found: String,
    },

    #[error("Transform '{transform}' failed for {node}.{port}: {cause}")]
    Transform {
        node: NodeId,
        port: String,
        transform: String,
        cause: String,
    },
}

/// Errors raised while running a node's interface.
///
/// `node` is the invocation label: the node id, or `id[index]` for a map element.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Function '{function}' failed in node '{node}': {cause}")]
    Function {
        node: String,
        function: String,
        cause: String,
    },

    #[error("External tool '{tool}' failed in node '{node}': {reason}")]
    ExternalProcess {
        node: String,
        tool: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("Node '{node}' did not produce declared output '{port}': {detail}")]
    OutputContractViolation {
        node: String,
        port: String,
        detail: String,
    },

    #[error("Map node '{node}' received iterfields of unequal length: {lengths:?}")]
    ShapeMismatch {
        node: String,
        lengths: Vec<(String, usize)>,
    },

    #[error("Node '{node}' timed out after {millis}ms")]
    Timeout { node: String, millis: u64 },

    #[error("Result cache failed for node '{node}': {cause}")]
    Cache { node: String, cause: String },
}

/// Errors reported by a [`ProcessAdapter`](crate::ProcessAdapter).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Cannot render command template: {0}")]
    Template(String),

    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl ProcessError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }
}

/// Errors that abort a whole run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Worker task failed: {0}")]
    Join(String),
}
