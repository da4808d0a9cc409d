//! Core abstractions for the pipeline engine
//!
//! This crate declares workflows: nodes with typed ports, the connections
//! between them, the function registry, and the process adapter contract.
//! It performs no execution.

mod connection;
mod error;
pub mod events;
mod function;
mod node;
mod port;
mod process;
mod value;
mod workflow;

pub use connection::{Connection, Selector, Transform};
pub use error::{
    ConstructionError, ExecutionError, PipelineError, ProcessError, ResolutionError,
};
pub use events::{EventBus, ExecutionEvent, ExecutionId};
pub use function::{Callable, FunctionArgs, FunctionRegistry, FunctionSignature, RegisteredFunction};
pub use node::{Interface, NodeId, NodeSpec};
pub use port::{Arity, Direction, Port};
pub use process::{NoProcessAdapter, ProcessAdapter};
pub use value::{Outputs, Value};
pub use workflow::{RunInputs, Workflow};

/// Result type for graph construction
pub type Result<T> = std::result::Result<T, ConstructionError>;
