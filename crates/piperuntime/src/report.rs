use crate::cache::CacheKey;
use pipecore::{ExecutionError, ExecutionId, NodeId, Outputs, Value};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

/// Lifecycle of a single invocation: a plain node, or one element of a map node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvocationStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Working directory of the invocation, relative to the workflow root.
    pub scope: String,
    pub node: NodeId,
    pub index: Option<usize>,
    pub key: CacheKey,
    pub status: InvocationStatus,
    pub outputs: Option<Outputs>,
    /// The outputs came from a previous successful record.
    pub reused: bool,
}

/// Final state of a node after a run.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Done { outputs: Outputs, cached: bool },
    Failed { error: ExecutionError },
    /// Not run because `upstream` failed or was itself skipped.
    Skipped { upstream: NodeId },
    /// Not run because the run was cancelled or halted.
    Cancelled,
}

impl NodeOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, NodeOutcome::Done { .. })
    }

    pub fn outputs(&self) -> Option<&Outputs> {
        match self {
            NodeOutcome::Done { outputs, .. } => Some(outputs),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            NodeOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Result of a run: one outcome per node, in topological order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub outcomes: Vec<(NodeId, NodeOutcome)>,
    pub records: Vec<ExecutionRecord>,
    /// Required output ports of finished nodes that hold no value.
    pub missing_outputs: Vec<(NodeId, String)>,
    pub duration_ms: u64,
}

impl RunReport {
    /// True only if every node finished and every required output has a value.
    pub fn succeeded(&self) -> bool {
        self.missing_outputs.is_empty() && self.outcomes.iter().all(|(_, o)| o.is_done())
    }

    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == node)
            .map(|(_, outcome)| outcome)
    }

    pub fn outputs(&self, node: &str) -> Option<&Outputs> {
        self.outcome(node).and_then(NodeOutcome::outputs)
    }

    pub fn output(&self, node: &str, port: &str) -> Option<&Value> {
        self.outputs(node).and_then(|outputs| outputs.get(port))
    }

    pub fn failed_nodes(&self) -> Vec<&NodeId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NodeOutcome::Failed { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn records_for(&self, node: &str) -> impl Iterator<Item = &ExecutionRecord> {
        let node = node.to_string();
        self.records.iter().filter(move |r| r.node == node)
    }
}

/// Shared, append-only log of invocation records for one run.
#[derive(Default)]
pub(crate) struct Journal {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl Journal {
    pub(crate) fn open(&self, scope: &str, node: &NodeId, index: Option<usize>, key: &CacheKey) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(ExecutionRecord {
            scope: scope.to_string(),
            node: node.clone(),
            index,
            key: key.clone(),
            status: InvocationStatus::Pending,
            outputs: None,
            reused: false,
        });
        records.len() - 1
    }

    pub(crate) fn running(&self, slot: usize) {
        self.set(slot, |r| r.status = InvocationStatus::Running);
    }

    pub(crate) fn done(&self, slot: usize, outputs: &Outputs, reused: bool) {
        self.set(slot, |r| {
            r.status = InvocationStatus::Done;
            r.outputs = Some(outputs.clone());
            r.reused = reused;
        });
    }

    pub(crate) fn failed(&self, slot: usize) {
        self.set(slot, |r| r.status = InvocationStatus::Failed);
    }

    /// Mark unfinished invocations of `node` as cancelled.
    pub(crate) fn abandon(&self, node: &str) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records.iter_mut().filter(|r| r.node == node) {
            if matches!(
                record.status,
                InvocationStatus::Pending | InvocationStatus::Running
            ) {
                record.status = InvocationStatus::Cancelled;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, slot: usize, update: impl FnOnce(&mut ExecutionRecord)) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(slot) {
            update(record);
        }
    }
}
