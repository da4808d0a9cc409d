use crate::{ConstructionError, Outputs, Port, Value};
use anyhow::{anyhow, Context};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// A pure function callable from a function node.
pub type Callable = dyn Fn(&FunctionArgs) -> anyhow::Result<Outputs> + Send + Sync;

/// Declared parameter and return fields of a registered function.
#[derive(Debug, Clone, Default)]
pub struct FunctionSignature {
    params: Vec<Port>,
    defaults: BTreeMap<String, Value>,
    returns: Vec<Port>,
}

impl FunctionSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Port::scalar(name));
        self
    }

    pub fn sequence_param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Port::sequence(name));
        self
    }

    /// A parameter that may be left unset; the function sees it as absent.
    pub fn optional_param(mut self, port: Port) -> Self {
        self.params.push(port.optional());
        self
    }

    /// A parameter with a declared default, used when nothing is wired in.
    pub fn param_with_default(mut self, port: impl Into<Port>, default: impl Into<Value>) -> Self {
        let port = port.into().optional();
        self.defaults.insert(port.name.clone(), default.into());
        self.params.push(port);
        self
    }

    pub fn returns(mut self, name: impl Into<String>) -> Self {
        self.returns.push(Port::scalar(name));
        self
    }

    pub fn returns_sequence(mut self, name: impl Into<String>) -> Self {
        self.returns.push(Port::sequence(name));
        self
    }

    pub fn params(&self) -> &[Port] {
        &self.params
    }

    pub fn returns_ports(&self) -> &[Port] {
        &self.returns
    }

    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }
}

/// A function registered under a name, shared by every node that uses it.
pub struct RegisteredFunction {
    name: String,
    signature: FunctionSignature,
    callable: Arc<Callable>,
}

impl RegisteredFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn call(&self, args: &FunctionArgs) -> anyhow::Result<Outputs> {
        (self.callable)(args)
    }
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Registry of functions available to function nodes.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<RegisteredFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a function under `name`.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        signature: FunctionSignature,
        callable: F,
    ) -> Result<(), ConstructionError>
    where
        F: Fn(&FunctionArgs) -> anyhow::Result<Outputs> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(ConstructionError::DuplicateFunction(name));
        }
        tracing::debug!("Registering function: {}", name);
        self.functions.insert(
            name.clone(),
            Arc::new(RegisteredFunction {
                name,
                signature,
                callable: Arc::new(callable),
            }),
        );
        Ok(())
    }

    /// Shorthand for scalar parameters and scalar return fields.
    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        params: &[&str],
        returns: &[&str],
        callable: F,
    ) -> Result<(), ConstructionError>
    where
        F: Fn(&FunctionArgs) -> anyhow::Result<Outputs> + Send + Sync + 'static,
    {
        let signature = params
            .iter()
            .fold(FunctionSignature::new(), |sig, p| sig.param(*p));
        let signature = returns.iter().fold(signature, |sig, r| sig.returns(*r));
        self.register(name, signature, callable)
    }

    pub fn get(&self, name: &str) -> Result<Arc<RegisteredFunction>, ConstructionError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| ConstructionError::UnknownFunction(name.to_string()))
    }

    pub fn list_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Resolved arguments handed to a function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionArgs {
    values: Outputs,
}

impl FunctionArgs {
    pub fn new(values: Outputs) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow!("missing argument '{}'", name))
    }

    pub fn optional(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn number(&self, name: &str) -> anyhow::Result<f64> {
        let value = self.get(name)?;
        value
            .as_f64()
            .with_context(|| format!("argument '{}' is a {}, expected number", name, value.kind()))
    }

    pub fn string(&self, name: &str) -> anyhow::Result<&str> {
        let value = self.get(name)?;
        value
            .as_str()
            .with_context(|| format!("argument '{}' is a {}, expected string", name, value.kind()))
    }

    pub fn path(&self, name: &str) -> anyhow::Result<&Path> {
        let value = self.get(name)?;
        value
            .as_path()
            .with_context(|| format!("argument '{}' is a {}, expected path", name, value.kind()))
    }

    pub fn sequence(&self, name: &str) -> anyhow::Result<&[Value]> {
        let value = self.get(name)?;
        value
            .as_array()
            .with_context(|| format!("argument '{}' is a {}, expected sequence", name, value.kind()))
    }

    pub fn values(&self) -> &Outputs {
        &self.values
    }
}
