use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::definition::{DefinitionError, OperatorDef};
use crate::port::{Port, PortError};
use crate::types::{Generics, TypeError};
use crate::value::Value;

mod service;

pub use service::{Delegate, Service};

/// Name of the service every operator has.
pub const MAIN_SERVICE: &str = "main";

/// Resolved property values of an operator instance.
pub type Properties = HashMap<String, Value>;

/// Body of a function-backed operator. It runs on a blocking thread until it
/// returns; `PortError::Closed` is the normal way out after `stop`.
pub type OperatorFunction = Arc<dyn Fn(&Operator) -> Result<(), PortError> + Send + Sync>;

/// Called whenever a port of the operator becomes the destination of an edge,
/// with the operator, that port and its new source. An error aborts the
/// connection.
pub type ConnectFunction =
    Arc<dyn Fn(&Operator, &Arc<Port>, &Arc<Port>) -> Result<(), PortError> + Send + Sync>;

static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorId(u64);

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("operator {operator}: property {property} missing")]
    MissingProperty { operator: String, property: String },

    #[error("operator {operator}: property {property} invalid: {cause}")]
    InvalidProperty {
        operator: String,
        property: String,
        cause: TypeError,
    },

    #[error("{parent} already has a child named {child}")]
    DuplicateChild { parent: String, child: String },

    #[error("{0} not flat")]
    NotFlat(String),

    #[error("operators can only be started inside a tokio runtime")]
    NoRuntime,
}

/// A node of the operator tree.
///
/// Leaf operators carry a function and run it on their own task. Containers
/// carry children and only exist until `compile` flattens them away.
pub struct Operator {
    id: OperatorId,
    name: RwLock<String>,
    parent: RwLock<Weak<Operator>>,
    children: RwLock<BTreeMap<String, Arc<Operator>>>,
    services: BTreeMap<String, Service>,
    delegates: BTreeMap<String, Delegate>,
    function: Option<OperatorFunction>,
    on_connect: RwLock<Option<ConnectFunction>>,
    properties: Properties,
    base_port: RwLock<Weak<Port>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Operator {
    /// Specializes `def` with `generics`, checks `properties` against the
    /// declared property types and builds the service and delegate ports.
    pub fn new(
        name: impl Into<String>,
        function: Option<OperatorFunction>,
        def: &OperatorDef,
        generics: &Generics,
        properties: Properties,
    ) -> Result<Arc<Operator>, OperatorError> {
        let name = name.into();
        def.validate()?;
        let mut def = def.clone();
        def.specify_generics(generics)?;
        def.generics_specified()?;

        for (property, property_def) in &def.properties {
            let value = properties
                .get(property)
                .ok_or_else(|| OperatorError::MissingProperty {
                    operator: name.clone(),
                    property: property.clone(),
                })?;
            property_def
                .verify_data(value)
                .map_err(|cause| OperatorError::InvalidProperty {
                    operator: name.clone(),
                    property: property.clone(),
                    cause,
                })?;
        }

        let buffered = function.is_some();
        let operator = Arc::new_cyclic(|me: &Weak<Operator>| Operator {
            id: OperatorId(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed)),
            name: RwLock::new(name),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(BTreeMap::new()),
            services: def
                .services
                .iter()
                .map(|(n, d)| (n.clone(), Service::new(n, d, me, buffered)))
                .collect(),
            delegates: def
                .delegates
                .iter()
                .map(|(n, d)| (n.clone(), Delegate::new(n, d, me, buffered)))
                .collect(),
            function,
            on_connect: RwLock::new(None),
            properties,
            base_port: RwLock::new(Weak::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        Ok(operator)
    }

    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_builtin(&self) -> bool {
        self.function.is_some()
    }

    pub fn main(&self) -> &Service {
        // validated in `new`
        &self.services[MAIN_SERVICE]
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn delegate(&self, name: &str) -> Option<&Delegate> {
        self.delegates.get(name)
    }

    pub fn delegates(&self) -> impl Iterator<Item = &Delegate> {
        self.delegates.values()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn parent(&self) -> Option<Arc<Operator>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// Registers `self` as a child of `parent` under its current name.
    pub fn set_parent(self: &Arc<Self>, parent: &Arc<Operator>) -> Result<(), OperatorError> {
        let name = self.name();
        {
            let mut children = parent.children.write().unwrap_or_else(PoisonError::into_inner);
            if children.contains_key(&name) {
                return Err(OperatorError::DuplicateChild {
                    parent: parent.name(),
                    child: name,
                });
            }
            children.insert(name, self.clone());
        }
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(parent);
        Ok(())
    }

    pub fn children(&self) -> Vec<Arc<Operator>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Operator>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set_connect_function(&self, hook: ConnectFunction) {
        *self.on_connect.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub(crate) fn connect_function(&self) -> Option<ConnectFunction> {
        self.on_connect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn base_port(&self) -> Option<Arc<Port>> {
        self.base_port
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    pub(crate) fn set_base_port(&self, port: Option<&Arc<Port>>) {
        *self.base_port.write().unwrap_or_else(PoisonError::into_inner) =
            port.map(Arc::downgrade).unwrap_or_default();
    }

    /// True once `stop` was called; function bodies poll it between items.
    pub fn stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.services
            .values()
            .flat_map(|s| [s.in_port(), s.out_port()])
            .chain(self.delegates.values().flat_map(|d| [d.in_port(), d.out_port()]))
    }

    /// Runs the function of every leaf in this tree on its own blocking task.
    pub fn start(self: &Arc<Self>) -> Result<(), OperatorError> {
        let Some(function) = &self.function else {
            for child in self.children() {
                child.start()?;
            }
            return Ok(());
        };
        let runtime = Handle::try_current().map_err(|_| OperatorError::NoRuntime)?;
        let function = function.clone();
        let operator = self.clone();
        info!(operator = %self.name(), "starting");
        let handle = runtime.spawn_blocking(move || match function(&operator) {
            Ok(()) | Err(PortError::Closed) => {
                debug!(operator = %operator.name(), "stopped");
            }
            Err(e) => {
                error!(operator = %operator.name(), error = %e, "operator terminated");
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Flags the whole tree as stopped and closes every queue so blocked
    /// function bodies wake up.
    pub fn stop(&self) {
        self.cancel.cancel();
        for port in self.ports() {
            port.close();
        }
        for child in self.children() {
            child.stop();
        }
    }

    fn collect_tasks(&self, tasks: &mut Vec<JoinHandle<()>>) {
        tasks.append(&mut self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for child in self.children() {
            child.collect_tasks(tasks);
        }
    }

    /// Waits for every task started in this tree to finish.
    pub async fn wait(&self) {
        let mut tasks = Vec::new();
        self.collect_tasks(&mut tasks);
        for task in tasks {
            if let Err(e) = task.await {
                error!(operator = %self.name(), error = %e, "operator task panicked");
            }
        }
    }

    /// Flattens nested containers into their parents and returns how many
    /// operators were eliminated. The root itself is never eliminated.
    #[tracing::instrument(skip(self), fields(operator = %self.name()))]
    pub fn compile(self: &Arc<Self>) -> usize {
        if self.is_builtin() {
            return 0;
        }

        let mut compiled = 0;
        for child in self.children() {
            compiled += child.compile();
        }

        let Some(parent) = self.parent() else {
            info!(eliminated = compiled, "compiled");
            return compiled;
        };

        for port in self.ports() {
            port.merge();
        }

        let own_name = self.name();
        let children =
            std::mem::take(&mut *self.children.write().unwrap_or_else(PoisonError::into_inner));
        {
            let mut siblings = parent.children.write().unwrap_or_else(PoisonError::into_inner);
            for (child_name, child) in children {
                let qualified = format!("{own_name}.{child_name}");
                *child.name.write().unwrap_or_else(PoisonError::into_inner) = qualified.clone();
                *child.parent.write().unwrap_or_else(PoisonError::into_inner) =
                    Arc::downgrade(&parent);
                siblings.insert(qualified, child);
            }
            siblings.remove(&own_name);
        }
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Weak::new();
        debug!("eliminated");

        compiled + 1
    }

    /// Checks that the tree is flat and every input is fed without intermediate hops.
    pub fn correctly_compiled(&self) -> Result<(), OperatorError> {
        for child in self.children() {
            if !child.children().is_empty() {
                return Err(OperatorError::NotFlat(child.name()));
            }
            for service in child.services() {
                service.in_port().directly_connected()?;
            }
            for delegate in child.delegates() {
                delegate.in_port().directly_connected()?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name())
            .field("builtin", &self.is_builtin())
            .field("children", &self.children().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ServiceDef;
    use crate::types::TypeDescriptor;
    use serde_json::json;

    fn passthrough() -> OperatorFunction {
        Arc::new(|op: &Operator| {
            let input = op.main().in_port();
            let output = op.main().out_port();
            while !op.stopped() {
                output.push(input.pull()?)?;
            }
            Ok(())
        })
    }

    fn number_def() -> OperatorDef {
        OperatorDef::with_main(TypeDescriptor::Number, TypeDescriptor::Number)
    }

    #[test]
    fn test_new_specializes_and_checks_properties() {
        let mut def = OperatorDef::with_main(TypeDescriptor::Trigger, TypeDescriptor::generic("T"));
        def.properties.insert("value".into(), TypeDescriptor::generic("T"));
        let mut generics = Generics::new();
        generics.insert("T".into(), TypeDescriptor::Number);

        let missing = Operator::new("v", None, &def, &generics, Properties::new());
        assert!(matches!(missing, Err(OperatorError::MissingProperty { .. })));

        let mut props = Properties::new();
        props.insert("value".into(), Value::from("nope"));
        let invalid = Operator::new("v", None, &def, &generics, props);
        assert!(matches!(invalid, Err(OperatorError::InvalidProperty { .. })));

        let mut props = Properties::new();
        props.insert("value".into(), Value::Number(3.0));
        let op = Operator::new("v", None, &def, &generics, props).unwrap();
        assert_eq!(op.main().out_port().define(), TypeDescriptor::Number);
        assert_eq!(op.property("value"), Some(&Value::Number(3.0)));

        let unresolved = Operator::new("v", None, &def, &Generics::new(), Properties::new());
        assert!(matches!(unresolved, Err(OperatorError::Type(TypeError::UnresolvedGeneric(_)))));
    }

    #[test]
    fn test_connect_function_sees_each_new_edge() {
        let root = Operator::new("root", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let leaf = Operator::new("leaf", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        leaf.set_parent(&root).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        leaf.set_connect_function(Arc::new(move |op: &Operator, dest: &Arc<Port>, src: &Arc<Port>| -> Result<(), PortError> {
            record.lock().unwrap().push(format!("{}: {src} -> {dest}", op.name()));
            Ok(())
        }));
        root.main().in_port().connect(leaf.main().in_port()).unwrap();
        // only edges ending at the operator's own ports
        leaf.main().out_port().connect(root.main().out_port()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["leaf: (root -> (leaf".to_string()]);

        let picky = Operator::new("picky", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        picky.set_parent(&root).unwrap();
        picky.set_connect_function(Arc::new(|_: &Operator, dest: &Arc<Port>, src: &Arc<Port>| -> Result<(), PortError> {
            Err(PortError::TypeMismatch {
                from: src.to_string(),
                to: dest.to_string(),
            })
        }));
        let refused = root.main().in_port().connect(picky.main().in_port());
        assert!(matches!(refused, Err(PortError::TypeMismatch { .. })));
        assert!(picky.main().in_port().source().is_none());
        assert_eq!(root.main().in_port().destinations().len(), 1);
    }

    #[test]
    fn test_only_leaf_inputs_are_buffered() {
        let leaf = Operator::new("leaf", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        assert!(leaf.main().in_port().is_buffered());
        assert!(!leaf.main().out_port().is_buffered());

        let container = Operator::new("c", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        assert!(!container.main().in_port().is_buffered());
        assert!(leaf.is_builtin());
        assert!(!container.is_builtin());
    }

    #[test]
    fn test_port_names_follow_surfaces() {
        let mut def = OperatorDef::with_main(TypeDescriptor::map([("a", TypeDescriptor::Number)]), TypeDescriptor::Number);
        def.services.insert("aux".into(), ServiceDef::new(TypeDescriptor::Trigger, TypeDescriptor::Trigger));
        def.delegates.insert("cb".into(), ServiceDef::new(TypeDescriptor::Number, TypeDescriptor::Number));
        let op = Operator::new("op", None, &def, &Generics::new(), Properties::new()).unwrap();

        assert_eq!(op.main().in_port().entry("a").unwrap().to_string(), "a(op");
        assert_eq!(op.main().out_port().to_string(), "op)");
        assert_eq!(op.service("aux").unwrap().in_port().to_string(), "(aux@op");
        assert_eq!(op.delegate("cb").unwrap().out_port().to_string(), "op.cb)");
    }

    #[test]
    fn test_set_parent_rejects_duplicates() {
        let parent = Operator::new("p", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let a = Operator::new("x", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let b = Operator::new("x", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        a.set_parent(&parent).unwrap();
        assert!(matches!(b.set_parent(&parent), Err(OperatorError::DuplicateChild { .. })));
        assert!(Arc::ptr_eq(&a.parent().unwrap(), &parent));
        assert_eq!(parent.children().len(), 1);
    }

    #[test]
    fn test_nesting_rule() {
        let parent = Operator::new("p", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let a = Operator::new("a", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        let b = Operator::new("b", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        a.set_parent(&parent).unwrap();
        b.set_parent(&parent).unwrap();

        // in to child in, sibling out to in, child out to parent out
        parent.main().in_port().connect(a.main().in_port()).unwrap();
        a.main().out_port().connect(b.main().in_port()).unwrap();
        b.main().out_port().connect(parent.main().out_port()).unwrap();

        let other = Operator::new("o", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let stranger = Operator::new("s", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        stranger.set_parent(&other).unwrap();
        let err = a.main().out_port().connect(stranger.main().in_port()).unwrap_err();
        assert!(matches!(err, PortError::InvalidNesting { .. }));
        let err = parent.main().in_port().connect(b.main().out_port()).unwrap_err();
        assert!(matches!(err, PortError::InvalidNesting { .. }));
    }

    #[test]
    fn test_compile_flat_graph_is_noop() {
        let root = Operator::new("root", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let a = Operator::new("a", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        a.set_parent(&root).unwrap();
        root.main().in_port().connect(a.main().in_port()).unwrap();
        a.main().out_port().connect(root.main().out_port()).unwrap();

        assert_eq!(root.compile(), 0);
        root.correctly_compiled().unwrap();
        assert_eq!(root.compile(), 0);
        assert_eq!(a.compile(), 0);
    }

    #[test]
    fn test_compile_renames_and_reparents() {
        let root = Operator::new("root", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let mid = Operator::new("mid", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let leaf = Operator::new("leaf", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        mid.set_parent(&root).unwrap();
        leaf.set_parent(&mid).unwrap();

        root.main().in_port().connect(mid.main().in_port()).unwrap();
        mid.main().in_port().connect(leaf.main().in_port()).unwrap();
        leaf.main().out_port().connect(mid.main().out_port()).unwrap();
        mid.main().out_port().connect(root.main().out_port()).unwrap();
        assert!(matches!(root.correctly_compiled(), Err(OperatorError::NotFlat(_))));

        assert_eq!(root.compile(), 1);
        assert_eq!(leaf.name(), "mid.leaf");
        assert!(root.child("mid").is_none());
        assert!(Arc::ptr_eq(&root.child("mid.leaf").unwrap(), &leaf));
        assert!(Arc::ptr_eq(&leaf.parent().unwrap(), &root));
        assert!(root.main().in_port().connected(leaf.main().in_port()));
        assert!(leaf.main().out_port().connected(root.main().out_port()));
        root.correctly_compiled().unwrap();
    }

    #[test]
    fn test_start_requires_runtime() {
        let leaf = Operator::new("leaf", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        assert!(matches!(leaf.start(), Err(OperatorError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_stop() {
        let root = Operator::new("root", None, &number_def(), &Generics::new(), Properties::new()).unwrap();
        let leaf = Operator::new("leaf", Some(passthrough()), &number_def(), &Generics::new(), Properties::new()).unwrap();
        leaf.set_parent(&root).unwrap();
        root.main().in_port().connect(leaf.main().in_port()).unwrap();
        leaf.main().out_port().connect(root.main().out_port()).unwrap();
        root.main().out_port().bufferize();

        root.start().unwrap();
        root.main().in_port().push(Value::from(json!(7))).unwrap();
        assert_eq!(root.main().out_port().pull().unwrap(), Value::Number(7.0));

        root.stop();
        assert!(leaf.stopped());
        root.wait().await;
    }
}
