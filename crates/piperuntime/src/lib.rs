//! Workflow execution runtime
//!
//! This crate runs [`pipecore::Workflow`]s: it resolves node inputs, expands
//! map nodes, dispatches invocations in parallel under a global limit, and
//! reuses results from earlier runs through a [`ResultCache`].

mod cache;
mod executor;
mod invoke;
mod mapnode;
mod report;
mod resolve;
mod runtime;

pub use cache::{CacheError, CacheKey, FileCache, InFlight, MemoryCache, ResultCache};
pub use executor::FailurePolicy;
pub use report::{ExecutionRecord, InvocationStatus, NodeOutcome, RunReport};
pub use runtime::{CacheMode, PipelineRuntime, RuntimeConfig};
pub use tokio_util::sync::CancellationToken;
