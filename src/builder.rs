use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::definition::{DefinitionError, OperatorDef};
use crate::operator::{ConnectFunction, Operator, OperatorError, OperatorFunction, Properties};
use crate::port::PortError;
use crate::reference::{PortReference, ReferenceError};
use crate::types::{Generics, TypeError};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Operator(#[from] OperatorError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("unknown operator {0}")]
    UnknownOperator(String),

    #[error("operator {0} contains itself")]
    Recursion(String),

    #[error("instance {instance}: unknown parent property {property}")]
    UnknownProperty { instance: String, property: String },

    #[error("cannot connect {from} to {to}: {cause}")]
    Connection {
        from: String,
        to: String,
        cause: PortError,
    },
}

/// A function-backed operator: its interface plus its body.
#[derive(Clone)]
pub struct Builtin {
    pub def: OperatorDef,
    pub function: OperatorFunction,
    pub on_connect: Option<ConnectFunction>,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("def", &self.def)
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}

/// Operators available to `build`, by name: builtins (function table) and
/// composed definitions.
#[derive(Debug, Default)]
pub struct Library {
    builtins: DashMap<String, Builtin>,
    definitions: DashMap<String, OperatorDef>,
}

impl Library {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_builtin(&self, name: impl Into<String>, def: OperatorDef, function: OperatorFunction) {
        self.builtins.insert(
            name.into(),
            Builtin {
                def,
                function,
                on_connect: None,
            },
        );
    }

    /// Like `register_builtin`, with a hook run for every edge into the
    /// operator's ports while it is wired.
    pub fn register_builtin_with_connect(
        &self,
        name: impl Into<String>,
        def: OperatorDef,
        function: OperatorFunction,
        on_connect: ConnectFunction,
    ) {
        self.builtins.insert(
            name.into(),
            Builtin {
                def,
                function,
                on_connect: Some(on_connect),
            },
        );
    }

    pub fn register_definition(&self, name: impl Into<String>, def: OperatorDef) {
        self.definitions.insert(name.into(), def);
    }

    pub fn builtin(&self, name: &str) -> Option<Builtin> {
        self.builtins.get(name).map(|b| b.value().clone())
    }

    pub fn definition(&self, name: &str) -> Option<OperatorDef> {
        self.definitions.get(name).map(|d| d.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builtins.contains_key(name) || self.definitions.contains_key(name)
    }

    /// Registers every definition file in `dir` under its file stem.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, DefinitionError> {
        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let supported = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json" | "yaml" | "yml")
            );
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !path.is_file() || !supported {
                continue;
            }
            let def = OperatorDef::load(&path)?;
            info!(name = %stem, path = %path.display(), "loaded definition");
            self.register_definition(stem, def);
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// Builds the runnable operator tree of `def`.
///
/// Children come from `library`; connections are wired but the tree is not
/// compiled.
#[tracing::instrument(skip(def, generics, properties, library))]
pub fn build(
    name: &str,
    def: &OperatorDef,
    generics: &Generics,
    properties: Properties,
    library: &Library,
) -> Result<Arc<Operator>, BuildError> {
    let mut stack = Vec::new();
    build_operator(name, def, generics, properties, library, &mut stack)
}

fn build_operator(
    name: &str,
    def: &OperatorDef,
    generics: &Generics,
    properties: Properties,
    library: &Library,
    stack: &mut Vec<String>,
) -> Result<Arc<Operator>, BuildError> {
    let container = Operator::new(name, None, def, generics, properties)?;

    let mut instances: Vec<_> = def.operators.iter().collect();
    instances.sort_by(|a, b| a.0.cmp(b.0));
    for (instance_name, instance) in instances {
        let mut instance_generics = Generics::with_capacity(instance.generics.len());
        for (generic, binding) in &instance.generics {
            instance_generics.insert(generic.clone(), binding.specify_generics(generics)?);
        }
        let mut instance_properties = Properties::with_capacity(instance.properties.len());
        for (property, value) in &instance.properties {
            instance_properties.insert(
                property.clone(),
                substitute_properties(value, &container, instance_name)?,
            );
        }

        let child = if let Some(builtin) = library.builtin(&instance.operator) {
            let child = Operator::new(
                instance_name.as_str(),
                Some(builtin.function),
                &builtin.def,
                &instance_generics,
                instance_properties,
            )?;
            if let Some(on_connect) = builtin.on_connect {
                child.set_connect_function(on_connect);
            }
            child
        } else if let Some(child_def) = library.definition(&instance.operator) {
            if stack.contains(&instance.operator) {
                return Err(BuildError::Recursion(instance.operator.clone()));
            }
            stack.push(instance.operator.clone());
            let child = build_operator(
                instance_name,
                &child_def,
                &instance_generics,
                instance_properties,
                library,
                stack,
            )?;
            stack.pop();
            child
        } else {
            return Err(BuildError::UnknownOperator(instance.operator.clone()));
        };
        child.set_parent(&container)?;
        debug!(parent = %name, child = %instance_name, operator = %instance.operator, "instantiated");
    }

    connect_all(&container, def)?;
    Ok(container)
}

/// Replaces `"$name"` strings by the parent's property `name`.
fn substitute_properties(value: &Value, parent: &Operator, instance: &str) -> Result<Value, BuildError> {
    match value {
        Value::String(s) if s.starts_with('$') => {
            let property = &s[1..];
            parent
                .property(property)
                .cloned()
                .ok_or_else(|| BuildError::UnknownProperty {
                    instance: instance.to_string(),
                    property: property.to_string(),
                })
        }
        Value::List(items) => items
            .iter()
            .map(|item| substitute_properties(item, parent, instance))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| -> Result<_, BuildError> {
                Ok((k.clone(), substitute_properties(v, parent, instance)?))
            })
            .collect::<Result<HashMap<_, _>, _>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

/// Wires the connection list breadth-first from the container, so an
/// operator's inputs are connected before its outputs are used as sources.
fn connect_all(container: &Arc<Operator>, def: &OperatorDef) -> Result<(), BuildError> {
    let mut connections = Vec::with_capacity(def.connections.len());
    for (source, destinations) in &def.connections {
        let source: PortReference = source.parse()?;
        let destinations = destinations
            .iter()
            .map(|d| d.parse::<PortReference>())
            .collect::<Result<Vec<_>, _>>()?;
        connections.push((source, destinations));
    }
    connections.sort_by_key(|(source, _)| source.to_string());

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
    let root = graph.add_node(String::new());
    index_of.insert(String::new(), root);
    for child in container.children() {
        let name = child.name();
        index_of.insert(name.clone(), graph.add_node(name));
    }

    let node = |instance: &str| {
        index_of
            .get(instance)
            .copied()
            .ok_or_else(|| BuildError::Reference(ReferenceError::UnknownOperator(instance.to_string())))
    };
    for (source, destinations) in &connections {
        let from = node(&source.instance)?;
        for destination in destinations {
            graph.add_edge(from, node(&destination.instance)?, ());
        }
    }

    let mut order = Vec::with_capacity(graph.node_count());
    let mut bfs = Bfs::new(&graph, root);
    while let Some(index) = bfs.next(&graph) {
        order.push(graph[index].clone());
    }
    let mut unreached: Vec<String> = graph
        .node_indices()
        .map(|i| graph[i].clone())
        .filter(|n| !order.contains(n) && connections.iter().any(|(s, _)| &s.instance == n))
        .collect();
    if !unreached.is_empty() {
        unreached.sort();
        warn!(operator = %container.name(), unreached = ?unreached, "operators not reachable from the container inputs");
        order.extend(unreached);
    }

    for instance in order {
        for (source, destinations) in connections.iter().filter(|(s, _)| s.instance == instance) {
            let from = source.resolve(container)?;
            for destination in destinations {
                let to = destination.resolve(container)?;
                from.connect(&to).map_err(|cause| BuildError::Connection {
                    from: source.to_string(),
                    to: destination.to_string(),
                    cause,
                })?;
            }
        }
    }
    Ok(())
}
