//! Standard node library
//!
//! An external-process adapter driven by tool descriptions, and built-in
//! functions for common plumbing between nodes.

mod builtins;
mod command;

pub use builtins::register_builtins;
pub use command::{CommandAdapter, ToolSpec};
