use crate::function::{FunctionRegistry, RegisteredFunction};
use crate::port::{Arity, Direction, Port};
use crate::{ConstructionError, Outputs, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Node ids are the names nodes are declared under; unique within a workflow.
pub type NodeId = String;

/// What a node does when it runs.
#[derive(Debug, Clone)]
pub enum Interface {
    /// Pass every input field through to the output field of the same name.
    Identity,

    /// Call a registered pure function.
    Function { function: Arc<RegisteredFunction> },

    /// Invoke an external tool through the runtime's process adapter.
    Process { tool: String, params: Outputs },
}

impl Interface {
    /// Stable identity string that feeds the cache key.
    pub fn fingerprint(&self) -> String {
        match self {
            Interface::Identity => "identity".to_string(),
            Interface::Function { function } => format!("function:{}", function.name()),
            Interface::Process { tool, .. } => format!("process:{}", tool),
        }
    }

    /// Fixed parameters of the interface, if any.
    pub fn params(&self) -> Option<&Outputs> {
        match self {
            Interface::Process { params, .. } => Some(params),
            _ => None,
        }
    }
}

/// Declaration of a node: its interface, its ports, and its input defaults.
///
/// A node with iterfields is a map node: each iterfield takes a sequence and the
/// interface runs once per element.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    id: NodeId,
    interface: Interface,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    defaults: Outputs,
    iterfields: Vec<String>,
}

impl NodeSpec {
    fn new(id: impl Into<NodeId>, interface: Interface) -> Self {
        Self {
            id: id.into(),
            interface,
            inputs: Vec::new(),
            outputs: Vec::new(),
            defaults: Outputs::new(),
            iterfields: Vec::new(),
        }
    }

    /// A pass-through node exposing `fields` as both inputs and outputs.
    ///
    /// Identity inputs never block execution: an unset field is simply absent on
    /// the output side. A field's `required` flag applies to the output port.
    pub fn identity<P: Into<Port>>(id: impl Into<NodeId>, fields: impl IntoIterator<Item = P>) -> Self {
        let mut node = Self::new(id, Interface::Identity);
        for field in fields {
            let port: Port = field.into();
            node.inputs.push(port.clone().optional());
            node.outputs.push(port);
        }
        node
    }

    /// A node calling the function registered as `name`.
    pub fn function(
        id: impl Into<NodeId>,
        registry: &FunctionRegistry,
        name: &str,
    ) -> Result<Self, ConstructionError> {
        let function = registry.get(name)?;
        let signature = function.signature().clone();
        let mut node = Self::new(id, Interface::Function { function });
        node.inputs = signature.params().to_vec();
        node.outputs = signature.returns_ports().to_vec();
        node.defaults = signature.defaults().clone();
        Ok(node)
    }

    /// A node running the external tool `tool`. Ports are declared with
    /// [`with_input_port`](Self::with_input_port) and
    /// [`with_output_port`](Self::with_output_port).
    pub fn process(id: impl Into<NodeId>, tool: impl Into<String>) -> Self {
        Self::new(
            id,
            Interface::Process {
                tool: tool.into(),
                params: Outputs::new(),
            },
        )
    }

    pub fn with_input_port(mut self, port: impl Into<Port>) -> Self {
        self.inputs.push(port.into());
        self
    }

    pub fn with_output_port(mut self, port: impl Into<Port>) -> Self {
        self.outputs.push(port.into());
        self
    }

    /// Fixed parameter passed to the external tool on every invocation.
    /// Ignored by other interface kinds.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Interface::Process { params, .. } = &mut self.interface {
            params.insert(key.into(), value.into());
        }
        self
    }

    /// Default value for an input port, used when nothing is wired into it.
    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(port.into(), value.into());
        self
    }

    /// Turn this node into a map node over `fields`.
    pub fn iterate_over<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.iterfields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn input_ports(&self) -> &[Port] {
        &self.inputs
    }

    pub fn output_ports(&self) -> &[Port] {
        &self.outputs
    }

    pub fn input_port(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn defaults(&self) -> &Outputs {
        &self.defaults
    }

    pub fn iterfields(&self) -> &[String] {
        &self.iterfields
    }

    pub fn is_map(&self) -> bool {
        !self.iterfields.is_empty()
    }

    pub fn is_iterfield(&self, port: &str) -> bool {
        self.iterfields.iter().any(|f| f == port)
    }

    /// Arity a connection into `port` must deliver. Iterfields take sequences.
    pub fn input_arity(&self, port: &str) -> Option<Arity> {
        let declared = self.input_port(port)?.arity;
        Some(if self.is_iterfield(port) {
            Arity::Sequence
        } else {
            declared
        })
    }

    /// Arity a connection out of `port` carries. Every output of a map node is a sequence.
    pub fn output_arity(&self, port: &str) -> Option<Arity> {
        let declared = self.output_port(port)?.arity;
        Some(if self.is_map() { Arity::Sequence } else { declared })
    }

    /// Check the declaration is self-consistent. Does not look at other nodes.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        // Ids name working directories under the workflow root.
        if matches!(self.id.as_str(), "" | "." | "..")
            || self.id.contains(['/', '\\', '\0'])
        {
            return Err(ConstructionError::InvalidNodeId(self.id.clone()));
        }

        for ports in [&self.inputs, &self.outputs] {
            let mut seen = HashSet::new();
            for port in ports.iter() {
                if !seen.insert(port.name.as_str()) {
                    return Err(ConstructionError::DuplicatePort {
                        node: self.id.clone(),
                        port: port.name.clone(),
                    });
                }
            }
        }

        if let Some(name) = self.defaults.keys().find(|k| self.input_port(k).is_none()) {
            return Err(ConstructionError::UnknownPort {
                node: self.id.clone(),
                port: name.clone(),
                direction: Direction::Input,
            });
        }

        let mut seen = HashSet::new();
        for field in &self.iterfields {
            if self.input_port(field).is_none() || !seen.insert(field.as_str()) {
                return Err(ConstructionError::InvalidIterfield {
                    node: self.id.clone(),
                    field: field.clone(),
                });
            }
        }

        Ok(())
    }
}
