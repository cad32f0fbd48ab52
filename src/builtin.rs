//! Elementary function-backed operators.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builder::Library;
use crate::definition::{OperatorDef, ServiceDef};
use crate::operator::{Operator, OperatorFunction};
use crate::port::PortError;
use crate::types::TypeDescriptor;
use crate::value::Value;

pub const VALUE: &str = "data.value";
pub const ADD: &str = "math.add";
pub const REDUCE: &str = "control.reduce";

/// Installs every builtin into `library`.
pub fn register(library: &Library) {
    library.register_builtin(VALUE, value_def(), Arc::new(value) as OperatorFunction);
    library.register_builtin(ADD, add_def(), Arc::new(add) as OperatorFunction);
    library.register_builtin(REDUCE, reduce_def(), Arc::new(reduce) as OperatorFunction);
}

fn value_def() -> OperatorDef {
    let mut def = OperatorDef::with_main(TypeDescriptor::Trigger, TypeDescriptor::generic("valueType"));
    def.properties
        .insert("value".into(), TypeDescriptor::generic("valueType"));
    def
}

/// Emits the `value` property once per trigger.
fn value(op: &Operator) -> Result<(), PortError> {
    let input = op.main().in_port();
    let output = op.main().out_port();
    let value = op.property("value").cloned().unwrap_or(Value::Null);
    while !op.stopped() {
        let trigger = input.pull()?;
        if trigger.is_marker() {
            output.push(trigger)?;
        } else {
            output.push(value.clone())?;
        }
    }
    Ok(())
}

fn add_def() -> OperatorDef {
    OperatorDef::with_main(
        TypeDescriptor::map([("a", TypeDescriptor::Number), ("b", TypeDescriptor::Number)]),
        TypeDescriptor::Number,
    )
}

fn add(op: &Operator) -> Result<(), PortError> {
    let input = op.main().in_port();
    let output = op.main().out_port();
    while !op.stopped() {
        match input.pull()? {
            Value::Map(values) => {
                let operand = |name: &str| {
                    values.get(name).and_then(Value::as_number).ok_or_else(|| {
                        PortError::UnexpectedValue {
                            port: input.to_string(),
                            expected: "number",
                            actual: values.get(name).map_or("null", Value::type_name),
                        }
                    })
                };
                output.push(Value::Number(operand("a")? + operand("b")?))?;
            }
            marker => output.push(marker)?,
        }
    }
    Ok(())
}

fn reduce_def() -> OperatorDef {
    let item = || TypeDescriptor::generic("itemType");
    let mut def = OperatorDef::with_main(TypeDescriptor::stream(item()), item());
    def.delegates.insert(
        "reducer".into(),
        ServiceDef::new(item(), TypeDescriptor::map([("a", item()), ("b", item())])),
    );
    def.properties.insert("emptyValue".into(), item());
    def
}

/// Folds each incoming stream through the `reducer` delegate, left to right.
/// An empty stream yields `emptyValue`.
fn reduce(op: &Operator) -> Result<(), PortError> {
    let input = op.main().in_port();
    let output = op.main().out_port();
    let empty = op.property("emptyValue").cloned().unwrap_or(Value::Null);
    let Some(reducer) = op.delegate("reducer") else {
        return Ok(());
    };

    while !op.stopped() {
        let items = match input.pull()? {
            Value::List(items) => items,
            marker => {
                output.push(marker)?;
                continue;
            }
        };
        let mut acc: Option<Value> = None;
        for item in items {
            acc = Some(match acc {
                None => item,
                Some(a) => {
                    let pair = HashMap::from([("a".to_string(), a), ("b".to_string(), item)]);
                    reducer.out_port().push(Value::Map(pair))?;
                    reducer.in_port().pull()?
                }
            });
        }
        output.push(acc.unwrap_or_else(|| empty.clone()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Properties;
    use crate::types::Generics;

    #[test]
    fn test_register_installs_definitions() {
        let library = Library::new();
        register(&library);
        for name in [VALUE, ADD, REDUCE] {
            assert!(library.contains(name), "{name}");
            library.builtin(name).unwrap().def.validate().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_passes_markers() {
        let root = Operator::new("root", None, &add_def(), &Generics::new(), Properties::new()).unwrap();
        let leaf = Operator::new("add", Some(Arc::new(add) as OperatorFunction), &add_def(), &Generics::new(), Properties::new()).unwrap();
        leaf.set_parent(&root).unwrap();
        root.main().in_port().connect(leaf.main().in_port()).unwrap();
        leaf.main().out_port().connect(root.main().out_port()).unwrap();
        root.main().out_port().bufferize();
        root.start().unwrap();

        let pair = HashMap::from([("a".to_string(), Value::Number(2.0)), ("b".to_string(), Value::Number(5.0))]);
        root.main().in_port().push(Value::Map(pair)).unwrap();
        assert_eq!(root.main().out_port().pull_number().unwrap(), 7.0);

        let marker = Value::Bos(crate::port::PortId::from_raw(0));
        root.main().in_port().push(marker.clone()).unwrap();
        assert_eq!(root.main().out_port().pull().unwrap(), marker);

        root.stop();
        root.wait().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_value_emits_property() {
        let mut generics = Generics::new();
        generics.insert("valueType".into(), TypeDescriptor::String);
        let mut props = Properties::new();
        props.insert("value".into(), Value::from("hi"));
        let outer = OperatorDef::with_main(TypeDescriptor::Trigger, TypeDescriptor::String);
        let root = Operator::new("root", None, &outer, &Generics::new(), Properties::new()).unwrap();
        let leaf = Operator::new("v", Some(Arc::new(value) as OperatorFunction), &value_def(), &generics, props).unwrap();
        leaf.set_parent(&root).unwrap();
        root.main().in_port().connect(leaf.main().in_port()).unwrap();
        leaf.main().out_port().connect(root.main().out_port()).unwrap();
        root.main().out_port().bufferize();
        root.start().unwrap();

        root.main().in_port().push(Value::Number(1.0)).unwrap();
        root.main().in_port().push(Value::Null).unwrap();
        assert_eq!(root.main().out_port().pull_string().unwrap(), "hi");
        assert_eq!(root.main().out_port().pull_string().unwrap(), "hi");

        root.stop();
        root.wait().await;
    }
}
