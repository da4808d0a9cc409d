use pipecore::{
    ConstructionError, FunctionArgs, FunctionRegistry, FunctionSignature, Outputs, Port, Value,
};

/// Register the standard functions: `merge2`, `merge3`, `merge4` and `length`.
pub fn register_builtins(registry: &mut FunctionRegistry) -> Result<(), ConstructionError> {
    for arity in 2..=4 {
        register_merge(registry, arity)?;
    }

    registry.register(
        "length",
        FunctionSignature::new()
            .sequence_param("items")
            .returns("length"),
        |args| {
            let items = args.sequence("items")?;
            Ok(Outputs::from([(
                "length".to_string(),
                Value::from(items.len()),
            )]))
        },
    )?;

    Ok(())
}

/// `mergeN`: collect `in1..inN` into one sequence `out`.
///
/// Inputs take either arity. Sequences are flattened and scalars appended, in
/// port order; unset inputs are skipped. Downstream selection is literal: `Selector::first()` on a merged list
/// of per-image transforms picks the first transform only, it does not compose
/// them.
fn register_merge(registry: &mut FunctionRegistry, arity: usize) -> Result<(), ConstructionError> {
    let ports: Vec<String> = (1..=arity).map(|i| format!("in{}", i)).collect();
    let signature = ports
        .iter()
        .fold(FunctionSignature::new(), |sig, port| {
            sig.optional_param(Port::any(port.as_str()))
        })
        .returns_sequence("out");

    registry.register(format!("merge{}", arity), signature, move |args| {
        Ok(Outputs::from([(
            "out".to_string(),
            Value::Array(merge(args, &ports)),
        )]))
    })
}

fn merge(args: &FunctionArgs, ports: &[String]) -> Vec<Value> {
    let mut merged = Vec::new();
    for value in ports.iter().filter_map(|port| args.optional(port)) {
        match value {
            Value::Array(items) => merged.extend(items.iter().cloned()),
            Value::Null => {}
            other => merged.push(other.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(registry: &FunctionRegistry, name: &str, args: Outputs) -> Outputs {
        registry
            .get(name)
            .unwrap()
            .call(&FunctionArgs::new(args))
            .unwrap()
    }

    #[test]
    fn merge_flattens_in_port_order() {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry).unwrap();

        let out = call(
            &registry,
            "merge3",
            Outputs::from([
                ("in1".to_string(), Value::from(vec!["affine_a", "affine_b"])),
                ("in3".to_string(), Value::from("warp")),
            ]),
        );
        assert_eq!(out["out"], Value::from(vec!["affine_a", "affine_b", "warp"]));
    }

    #[test]
    fn length_counts_items() {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry).unwrap();

        let out = call(
            &registry,
            "length",
            Outputs::from([("items".to_string(), Value::from(vec![1, 2, 3]))]),
        );
        assert_eq!(out["length"], Value::from(3));
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry).unwrap();
        assert_eq!(
            register_builtins(&mut registry).unwrap_err(),
            ConstructionError::DuplicateFunction("merge2".into())
        );
    }
}
