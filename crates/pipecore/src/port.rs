use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a port carries one value or a sequence of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arity {
    Scalar,
    Sequence,
    /// Takes either; for collecting ports such as `mergeN` inputs.
    Any,
}

impl Arity {
    /// Whether a connection delivering `delivered` may feed a port of this arity.
    pub fn accepts(self, delivered: Arity) -> bool {
        self == Arity::Any || delivered == Arity::Any || self == delivered
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Scalar => write!(f, "scalar"),
            Arity::Sequence => write!(f, "sequence"),
            Arity::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// A named, typed slot on a node.
///
/// `required` on an input port means the node cannot run without a value;
/// on an output port it means a successful node must have produced one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub arity: Arity,
    pub required: bool,
}

impl Port {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arity: Arity::Scalar,
            required: true,
        }
    }

    pub fn sequence(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arity: Arity::Sequence,
            required: true,
        }
    }

    /// A port that takes a scalar or a sequence.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arity: Arity::Any,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_arity(mut self, arity: Arity) -> Self {
        self.arity = arity;
        self
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Port::scalar(name)
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Port::scalar(name)
    }
}
