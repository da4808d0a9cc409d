use crate::port::Arity;
use crate::{NodeId, Value};
use std::fmt;
use std::sync::Arc;

type TransformFn = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;
type SelectorFn = dyn Fn(&[Value]) -> Value + Send + Sync;

/// Pure value→value mapping applied to a value in transit.
#[derive(Clone)]
pub struct Transform {
    name: String,
    output: Option<Arity>,
    func: Arc<TransformFn>,
}

impl Transform {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            output: None,
            func: Arc::new(func),
        }
    }

    /// Declare the arity the transform produces. Without it the transform is
    /// assumed to preserve the arity of its input.
    pub fn producing(mut self, arity: Arity) -> Self {
        self.output = Some(arity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_arity(&self) -> Option<Arity> {
        self.output
    }

    pub fn apply(&self, value: Value) -> anyhow::Result<Value> {
        (self.func)(value)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.name)
            .field("output", &self.output)
            .finish()
    }
}

/// Picks one value out of a sequence when a sequence output feeds a scalar input.
///
/// The function is only ever called with a non-empty slice; an empty sequence is
/// reported by the engine as an empty-collection error.
#[derive(Clone)]
pub struct Selector {
    name: String,
    func: Arc<SelectorFn>,
}

impl Selector {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn first() -> Self {
        Self::new("first", |items| items[0].clone())
    }

    pub fn last() -> Self {
        Self::new("last", |items| items[items.len() - 1].clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn select(&self, items: &[Value]) -> Value {
        (self.func)(items)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector").field("name", &self.name).finish()
    }
}

/// Edge from an output port to an input port. Immutable once added to a workflow.
#[derive(Debug, Clone)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
    pub transform: Option<Transform>,
    pub selector: Option<Selector>,
}

impl Connection {
    pub fn new(
        from_node: impl Into<NodeId>,
        from_port: impl Into<String>,
        to_node: impl Into<NodeId>,
        to_port: impl Into<String>,
    ) -> Self {
        Self {
            from_node: from_node.into(),
            from_port: from_port.into(),
            to_node: to_node.into(),
            to_port: to_port.into(),
            transform: None,
            selector: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Arity that reaches the destination given the source port's arity:
    /// a selector collapses to a scalar, then a transform may declare its own.
    pub fn delivered_arity(&self, source: Arity) -> Arity {
        let selected = if self.selector.is_some() {
            Arity::Scalar
        } else {
            source
        };
        self.transform
            .as_ref()
            .and_then(Transform::output_arity)
            .unwrap_or(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_collapses_sequence() {
        let conn = Connection::new("merge", "out", "warp", "transform").with_selector(Selector::first());
        assert_eq!(conn.delivered_arity(Arity::Sequence), Arity::Scalar);
    }

    #[test]
    fn transform_may_declare_output_arity() {
        let conn = Connection::new("inputspec", "files", "warp", "dimension")
            .with_transform(Transform::new("count", |v| Ok(v)).producing(Arity::Sequence));
        assert_eq!(conn.delivered_arity(Arity::Sequence), Arity::Sequence);
        assert_eq!(conn.delivered_arity(Arity::Scalar), Arity::Sequence);
    }

    #[test]
    fn first_and_last_pick_ends() {
        let items = vec![Value::from(1), Value::from(2), Value::from(3)];
        assert_eq!(Selector::first().select(&items), Value::from(1));
        assert_eq!(Selector::last().select(&items), Value::from(3));
    }
}
