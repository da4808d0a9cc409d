use crate::connection::{Connection, Selector, Transform};
use crate::port::Direction;
use crate::{ConstructionError, NodeId, NodeSpec, Outputs};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction as EdgeDirection;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

/// Values supplied at run time for unconnected input ports, per node.
pub type RunInputs = HashMap<NodeId, Outputs>;

/// A directed acyclic graph of nodes and connections.
///
/// Every mutation is validated eagerly; a failed `add_node` or `connect` leaves the
/// workflow exactly as it was.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    working_dir: PathBuf,
    nodes: HashMap<NodeId, NodeSpec>,
    connections: Vec<Connection>,
    inbound: HashMap<(NodeId, String), usize>,
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            working_dir: std::env::temp_dir().join(&name),
            name,
            nodes: HashMap::new(),
            connections: Vec::new(),
            inbound: HashMap::new(),
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_working_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.working_dir = root.into();
        self
    }

    pub fn set_working_dir(&mut self, root: impl Into<PathBuf>) {
        self.working_dir = root.into();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root under which every node invocation gets its own subdirectory.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn add_node(&mut self, node: NodeSpec) -> Result<NodeId, ConstructionError> {
        node.validate()?;
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(ConstructionError::DuplicateNode(id));
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    /// Wire `from_node.from_port` into `to_node.to_port`.
    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<(), ConstructionError> {
        self.add_connection(Connection::new(from_node, from_port, to_node, to_port))
    }

    /// Like [`connect`](Self::connect), with a transform applied in transit.
    pub fn connect_with_transform(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        transform: Transform,
    ) -> Result<(), ConstructionError> {
        self.add_connection(
            Connection::new(from_node, from_port, to_node, to_port).with_transform(transform),
        )
    }

    /// Like [`connect`](Self::connect), selecting one element of a sequence output.
    pub fn connect_with_selector(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        selector: Selector,
    ) -> Result<(), ConstructionError> {
        self.add_connection(
            Connection::new(from_node, from_port, to_node, to_port).with_selector(selector),
        )
    }

    /// Wire several `(output, input)` port pairs between the same two nodes.
    /// Stops at the first invalid pair; pairs before it stay connected.
    pub fn connect_ports(
        &mut self,
        from_node: &str,
        to_node: &str,
        pairs: &[(&str, &str)],
    ) -> Result<(), ConstructionError> {
        for (from_port, to_port) in pairs {
            self.connect(from_node, from_port, to_node, to_port)?;
        }
        Ok(())
    }

    pub fn add_connection(&mut self, conn: Connection) -> Result<(), ConstructionError> {
        let source = self
            .nodes
            .get(&conn.from_node)
            .ok_or_else(|| ConstructionError::UnknownNode(conn.from_node.clone()))?;
        let dest = self
            .nodes
            .get(&conn.to_node)
            .ok_or_else(|| ConstructionError::UnknownNode(conn.to_node.clone()))?;

        let source_arity =
            source
                .output_arity(&conn.from_port)
                .ok_or_else(|| ConstructionError::UnknownPort {
                    node: conn.from_node.clone(),
                    port: conn.from_port.clone(),
                    direction: Direction::Output,
                })?;
        let dest_arity =
            dest.input_arity(&conn.to_port)
                .ok_or_else(|| ConstructionError::UnknownPort {
                    node: conn.to_node.clone(),
                    port: conn.to_port.clone(),
                    direction: Direction::Input,
                })?;

        let slot = (conn.to_node.clone(), conn.to_port.clone());
        if self.inbound.contains_key(&slot) {
            return Err(ConstructionError::DuplicateInput {
                node: conn.to_node.clone(),
                port: conn.to_port.clone(),
            });
        }

        let delivered = conn.delivered_arity(source_arity);
        if !dest_arity.accepts(delivered) {
            return Err(ConstructionError::ArityMismatch {
                source_node: conn.from_node.clone(),
                source_port: conn.from_port.clone(),
                dest_node: conn.to_node.clone(),
                dest_port: conn.to_port.clone(),
                delivered,
                expected: dest_arity,
            });
        }

        let from_idx = self.index[&conn.from_node];
        let to_idx = self.index[&conn.to_node];
        if from_idx == to_idx || has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(ConstructionError::Cycle {
                source_node: conn.from_node.clone(),
                dest_node: conn.to_node.clone(),
            });
        }

        tracing::debug!(
            "Connecting {}.{} -> {}.{}",
            conn.from_node,
            conn.from_port,
            conn.to_node,
            conn.to_port
        );
        self.graph.add_edge(from_idx, to_idx, ());
        self.inbound.insert(slot, self.connections.len());
        self.connections.push(conn);
        Ok(())
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.graph
            .node_indices()
            .filter_map(move |idx| self.nodes.get(&self.graph[idx]))
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// The connection feeding `node.port`, if any.
    pub fn connection_into(&self, node: &str, port: &str) -> Option<&Connection> {
        self.inbound
            .get(&(node.to_string(), port.to_string()))
            .map(|&i| &self.connections[i])
    }

    /// Distinct nodes with a connection into `node`, in insertion order.
    pub fn upstream(&self, node: &str) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node) else {
            return Vec::new();
        };
        let mut preds: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, EdgeDirection::Incoming)
            .collect();
        preds.sort();
        preds.dedup();
        preds.into_iter().map(|i| self.graph[i].clone()).collect()
    }

    /// Topological order with ties broken by insertion order.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                self.graph
                    .neighbors_directed(idx, EdgeDirection::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(self.graph[idx].clone());
            for next in self.graph.neighbors_directed(idx, EdgeDirection::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        order
    }
}
