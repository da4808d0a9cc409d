use crate::{Outputs, ProcessError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bridge between the engine and external tools.
///
/// Implementations must be idempotent for identical `(tool, params)` and must not
/// touch anything outside `working_dir`. The returned map names the file produced
/// for each declared output port.
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    async fn invoke(
        &self,
        tool: &str,
        params: &Outputs,
        working_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, ProcessError>;

    /// Tool ids this adapter knows how to run. When non-empty, process nodes
    /// naming any other tool are rejected before a run starts.
    fn tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Adapter used when no external tools are configured. Every invocation fails.
pub struct NoProcessAdapter;

#[async_trait]
impl ProcessAdapter for NoProcessAdapter {
    async fn invoke(
        &self,
        tool: &str,
        _params: &Outputs,
        _working_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, ProcessError> {
        Err(ProcessError::UnknownTool(tool.to_string()))
    }
}
