use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use thiserror::Error;
use tracing::debug;

use crate::operator::{Operator, OperatorId, MAIN_SERVICE};
use crate::types::{TypeDescriptor, TypeError};
use crate::value::Value;

mod buffer;

use buffer::Buffer;

/// Capacity of the queue attached to a leaf input port.
pub const QUEUE_CAPACITY: usize = 100;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    fn next() -> Self {
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        PortId(raw)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortKind {
    Generic(String),
    Primitive,
    Trigger,
    Number,
    String,
    Binary,
    Boolean,
    Stream,
    Map,
}

impl PortKind {
    fn of(def: &TypeDescriptor) -> Self {
        match def {
            TypeDescriptor::Generic { generic } => PortKind::Generic(generic.clone()),
            TypeDescriptor::Primitive => PortKind::Primitive,
            TypeDescriptor::Trigger => PortKind::Trigger,
            TypeDescriptor::Number => PortKind::Number,
            TypeDescriptor::String => PortKind::String,
            TypeDescriptor::Binary => PortKind::Binary,
            TypeDescriptor::Boolean => PortKind::Boolean,
            TypeDescriptor::Stream { .. } => PortKind::Stream,
            TypeDescriptor::Map { .. } => PortKind::Map,
        }
    }

    pub fn is_primitive_class(&self) -> bool {
        !matches!(self, PortKind::Generic(_) | PortKind::Stream | PortKind::Map)
    }
}

/// Which surface of its operator a port tree belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Surface {
    Service(String),
    Delegate(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Owner {
    pub(crate) operator: Weak<Operator>,
    pub(crate) surface: Surface,
}

#[derive(Default)]
struct Links {
    source: Weak<Port>,
    destinations: Vec<Weak<Port>>,
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("cannot connect generic port {0}")]
    CannotConnectGeneric(String),

    #[error("{0} is already connected")]
    AlreadyConnected(String),

    #[error("type mismatch connecting {from} to {to}")]
    TypeMismatch { from: String, to: String },

    #[error("incompatible maps connecting {from} to {to}")]
    IncompatibleMap { from: String, to: String },

    #[error("invalid nesting connecting {from} to {to}")]
    InvalidNesting { from: String, to: String },

    #[error("{0} not connected")]
    NotConnected(String),

    #[error("{port} has connected source {source_name}")]
    IndirectSource { port: String, source_name: String },

    #[error("{port} not connected back from {source_name}")]
    NotConnectedBack { port: String, source_name: String },

    #[error("can only check in ports, got {0}")]
    NotAnInPort(String),

    #[error("cannot pull generic port {0}")]
    CannotPullGeneric(String),

    #[error("cannot push to generic port {0}")]
    CannotPushGeneric(String),

    #[error("{0} has no buffer")]
    NoBuffer(String),

    #[error("{0} is not a stream")]
    NotAStream(String),

    #[error("marker mismatch on {0}")]
    MarkerMismatch(String),

    #[error("{port} expected {expected}, got {actual}")]
    UnexpectedValue {
        port: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("port closed")]
    Closed,
}

/// One node of a port tree.
///
/// The tree mirrors a `TypeDescriptor`. Structural children are owned, every
/// other relation (ancestors, owner, connections) is weak.
pub struct Port {
    id: PortId,
    kind: PortKind,
    direction: Direction,
    element: Option<Arc<Port>>,
    entries: BTreeMap<String, Arc<Port>>,
    key: Option<String>,
    parent: Weak<Port>,
    parent_stream: Weak<Port>,
    parent_map: Weak<Port>,
    owner: Option<Owner>,
    links: RwLock<Links>,
    buffer: RwLock<Option<Arc<Buffer>>>,
}

struct Ancestry {
    parent: Weak<Port>,
    parent_stream: Weak<Port>,
    parent_map: Weak<Port>,
    key: Option<String>,
}

impl Port {
    /// Builds a port tree owned by no operator.
    pub fn new(def: &TypeDescriptor, direction: Direction) -> Result<Arc<Port>, PortError> {
        def.validate()?;
        Ok(Self::build(def, direction, None, false, Ancestry::root()))
    }

    /// Builds the tree of an operator surface from an already validated descriptor.
    pub(crate) fn with_owner(
        def: &TypeDescriptor,
        direction: Direction,
        owner: Owner,
        buffered: bool,
    ) -> Arc<Port> {
        Self::build(def, direction, Some(&owner), buffered, Ancestry::root())
    }

    fn build(
        def: &TypeDescriptor,
        direction: Direction,
        owner: Option<&Owner>,
        buffered: bool,
        ancestry: Ancestry,
    ) -> Arc<Port> {
        Arc::new_cyclic(|me: &Weak<Port>| {
            let kind = PortKind::of(def);
            let mut element = None;
            let mut entries = BTreeMap::new();
            match def {
                TypeDescriptor::Stream { stream } => {
                    element = Some(Self::build(
                        stream,
                        direction,
                        owner,
                        buffered,
                        Ancestry {
                            parent: me.clone(),
                            parent_stream: me.clone(),
                            parent_map: ancestry.parent_map.clone(),
                            key: None,
                        },
                    ));
                }
                TypeDescriptor::Map { map } => {
                    for (name, entry) in map {
                        let port = Self::build(
                            entry,
                            direction,
                            owner,
                            buffered,
                            Ancestry {
                                parent: me.clone(),
                                parent_stream: ancestry.parent_stream.clone(),
                                parent_map: me.clone(),
                                key: Some(name.clone()),
                            },
                        );
                        entries.insert(name.clone(), port);
                    }
                }
                _ => {}
            }
            let buffer = (buffered && direction == Direction::In && kind.is_primitive_class())
                .then(|| Arc::new(Buffer::new(QUEUE_CAPACITY)));
            Port {
                id: PortId::next(),
                kind,
                direction,
                element,
                entries,
                key: ancestry.key,
                parent: ancestry.parent,
                parent_stream: ancestry.parent_stream,
                parent_map: ancestry.parent_map,
                owner: owner.cloned(),
                links: RwLock::new(Links::default()),
                buffer: RwLock::new(buffer),
            }
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_primitive_class(&self) -> bool {
        self.kind.is_primitive_class()
    }

    /// Element port of a stream.
    pub fn element(&self) -> Option<&Arc<Port>> {
        self.element.as_ref()
    }

    /// Named entry of a map.
    pub fn entry(&self, name: &str) -> Option<&Arc<Port>> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> &BTreeMap<String, Arc<Port>> {
        &self.entries
    }

    pub fn parent_stream(&self) -> Option<Arc<Port>> {
        self.parent_stream.upgrade()
    }

    pub fn parent_map(&self) -> Option<Arc<Port>> {
        self.parent_map.upgrade()
    }

    pub fn operator(&self) -> Option<Arc<Operator>> {
        self.owner.as_ref().and_then(|o| o.operator.upgrade())
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.owner.as_ref().map(|o| &o.surface)
    }

    pub fn source(&self) -> Option<Arc<Port>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .source
            .upgrade()
    }

    pub fn destinations(&self) -> Vec<Arc<Port>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .destinations
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Rebuilds the type descriptor this tree was constructed from.
    pub fn define(&self) -> TypeDescriptor {
        match &self.kind {
            PortKind::Generic(name) => TypeDescriptor::generic(name.clone()),
            PortKind::Primitive => TypeDescriptor::Primitive,
            PortKind::Trigger => TypeDescriptor::Trigger,
            PortKind::Number => TypeDescriptor::Number,
            PortKind::String => TypeDescriptor::String,
            PortKind::Binary => TypeDescriptor::Binary,
            PortKind::Boolean => TypeDescriptor::Boolean,
            PortKind::Stream => match &self.element {
                Some(element) => TypeDescriptor::stream(element.define()),
                None => TypeDescriptor::Primitive,
            },
            PortKind::Map => TypeDescriptor::Map {
                map: self
                    .entries
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.define()))
                    .collect::<HashMap<_, _>>(),
            },
        }
    }

    fn operator_id(&self) -> Option<OperatorId> {
        self.operator().map(|op| op.id())
    }

    fn operator_parent_id(&self) -> Option<OperatorId> {
        self.operator()
            .and_then(|op| op.parent())
            .map(|parent| parent.id())
    }

    // -- connections --

    fn wire(self: &Arc<Self>, q: &Arc<Port>) {
        q.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .source = Arc::downgrade(self);
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if !links.destinations.iter().any(|d| ptr_eq(d, q)) {
            links.destinations.push(Arc::downgrade(q));
        }
    }

    fn unwire(&self, q: &Arc<Port>) -> bool {
        let mut linked = false;
        {
            let mut q_links = q.links.write().unwrap_or_else(PoisonError::into_inner);
            if std::ptr::eq(q_links.source.as_ptr(), self) {
                q_links.source = Weak::new();
                linked = true;
            }
        }
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        let before = links.destinations.len();
        links.destinations.retain(|d| !ptr_eq(d, q));
        linked || before != links.destinations.len()
    }

    fn lists_destination(&self, q: &Arc<Port>) -> bool {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .destinations
            .iter()
            .any(|d| ptr_eq(d, q))
    }

    /// Connects `self` to `q`, recursing through maps and streams.
    pub fn connect(self: &Arc<Self>, q: &Arc<Port>) -> Result<(), PortError> {
        if matches!(self.kind, PortKind::Generic(_)) {
            return Err(PortError::CannotConnectGeneric(self.to_string()));
        }
        if matches!(q.kind, PortKind::Generic(_)) {
            return Err(PortError::CannotConnectGeneric(q.to_string()));
        }
        if let Some(src) = q.source() {
            if Arc::ptr_eq(&src, self) {
                return Ok(());
            }
            return Err(PortError::AlreadyConnected(q.to_string()));
        }

        match q.kind {
            PortKind::Primitive => return self.connect_direct(q),
            PortKind::Trigger => {
                if self.kind == PortKind::Map {
                    if let Some(first) = self.entries.values().next() {
                        return first.connect(q);
                    }
                }
                return self.connect_direct(q);
            }
            _ => {}
        }

        if self.kind != q.kind && !(self.kind == PortKind::Primitive && q.is_primitive_class()) {
            return Err(PortError::TypeMismatch {
                from: self.to_string(),
                to: q.to_string(),
            });
        }

        match self.kind {
            PortKind::Map => {
                if !self.entries.keys().eq(q.entries.keys()) {
                    return Err(PortError::IncompatibleMap {
                        from: self.to_string(),
                        to: q.to_string(),
                    });
                }
                for (name, entry) in &self.entries {
                    entry.connect(&q.entries[name])?;
                }
                Ok(())
            }
            PortKind::Stream => match (&self.element, &q.element) {
                (Some(a), Some(b)) => a.connect(b),
                _ => Err(PortError::TypeMismatch {
                    from: self.to_string(),
                    to: q.to_string(),
                }),
            },
            _ => self.connect_direct(q),
        }
    }

    /// Records the edge after checking the nesting rule, then links the
    /// enclosing streams so that marker ownership survives flattening.
    fn connect_direct(self: &Arc<Self>, q: &Arc<Port>) -> Result<(), PortError> {
        let nested = match (self.direction, q.direction) {
            (Direction::In, Direction::In) => self.operator_id() == q.operator_parent_id(),
            (Direction::In, Direction::Out) => self.operator_id() == q.operator_id(),
            (Direction::Out, Direction::In) => self.operator_parent_id() == q.operator_parent_id(),
            (Direction::Out, Direction::Out) => self.operator_parent_id() == q.operator_id(),
        };
        if !nested {
            return Err(PortError::InvalidNesting {
                from: self.to_string(),
                to: q.to_string(),
            });
        }

        self.wire(q);
        if let Some(op) = q.operator() {
            if let Some(on_connect) = op.connect_function() {
                if let Err(e) = on_connect(&*op, q, self) {
                    self.unwire(q);
                    return Err(e);
                }
            }
        }
        debug!(from = %self, to = %q, "connected");

        let own_stream = self.parent_stream();
        let q_stream = q.parent_stream();
        match (self.direction, q.direction) {
            (Direction::In, Direction::In) => match q_stream {
                None => {
                    if let Some(op) = q.operator() {
                        op.set_base_port(own_stream.as_ref());
                    }
                }
                Some(q_stream) => {
                    if let Some(own_stream) = own_stream {
                        own_stream.connect_direct(&q_stream)?;
                    }
                }
            },
            (Direction::In, Direction::Out) => {
                if let (Some(own_stream), Some(q_stream)) = (own_stream, q_stream) {
                    own_stream.connect_direct(&q_stream)?;
                }
            }
            (Direction::Out, Direction::In) => {
                let base = own_stream.or_else(|| self.operator().and_then(|op| op.base_port()));
                match q_stream {
                    None => {
                        if let Some(op) = q.operator() {
                            op.set_base_port(base.as_ref());
                        }
                    }
                    Some(q_stream) => {
                        if let Some(base) = base {
                            base.connect_direct(&q_stream)?;
                        }
                    }
                }
            }
            (Direction::Out, Direction::Out) => {
                let base = own_stream.or_else(|| self.operator().and_then(|op| op.base_port()));
                if let (Some(base), Some(q_stream)) = (base, q_stream) {
                    base.connect_direct(&q_stream)?;
                }
            }
        }
        Ok(())
    }

    /// Removes the edge `self -> q`, including the edges between their sub-ports.
    pub fn disconnect(&self, q: &Arc<Port>) -> Result<(), PortError> {
        let mut removed = self.unwire(q);
        if let (Some(a), Some(b)) = (&self.element, &q.element) {
            removed |= a.disconnect(b).is_ok();
        }
        for (name, entry) in &self.entries {
            if let Some(other) = q.entries.get(name) {
                removed |= entry.disconnect(other).is_ok();
            }
        }
        if q.kind == PortKind::Trigger && self.kind == PortKind::Map {
            if let Some(first) = self.entries.values().next() {
                removed |= first.unwire(q);
            }
        }
        if removed {
            Ok(())
        } else {
            Err(PortError::NotConnected(q.to_string()))
        }
    }

    /// True iff every leaf edge between `self` and `q` is recorded on both ends.
    pub fn connected(&self, q: &Arc<Port>) -> bool {
        if q.kind == PortKind::Trigger && self.kind == PortKind::Map {
            return self
                .entries
                .values()
                .next()
                .is_some_and(|first| first.connected(q));
        }
        if self.is_primitive_class() || q.is_primitive_class() {
            return q.source().is_some_and(|src| std::ptr::eq(Arc::as_ptr(&src), self))
                && self.lists_destination(q);
        }
        match self.kind {
            PortKind::Stream => match (&self.element, &q.element) {
                (Some(a), Some(b)) => a.connected(b),
                _ => false,
            },
            PortKind::Map => {
                self.entries.keys().eq(q.entries.keys())
                    && self
                        .entries
                        .iter()
                        .all(|(name, entry)| entry.connected(&q.entries[name]))
            }
            _ => false,
        }
    }

    /// Splices this port out of its chain: every destination is re-pointed to
    /// the source. Returns whether any destination was re-pointed in the subtree.
    pub fn merge(self: &Arc<Self>) -> bool {
        let mut merged = false;
        if let Some(src) = self.source() {
            for dest in self.destinations() {
                src.wire(&dest);
                merged = true;
            }
            src.unwire(self);
            self.links
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .destinations
                .clear();
            if merged {
                debug!(port = %self, source = %src, "merged");
            }
        }
        if let Some(element) = &self.element {
            merged |= element.merge();
        }
        for entry in self.entries.values() {
            merged |= entry.merge();
        }
        merged
    }

    /// Checks that every leaf of this input port is fed straight from its
    /// final source, with no intermediate hop left.
    pub fn directly_connected(&self) -> Result<(), PortError> {
        if self.direction != Direction::In {
            return Err(PortError::NotAnInPort(self.to_string()));
        }
        if self.is_primitive_class() {
            let src = self
                .source()
                .ok_or_else(|| PortError::NotConnected(self.to_string()))?;
            let nested_in = src.direction == Direction::In
                && src.operator().is_some_and(|op| op.parent().is_some());
            if nested_in || src.source().is_some() {
                return Err(PortError::IndirectSource {
                    port: self.to_string(),
                    source_name: src.to_string(),
                });
            }
            let back = src
                .destinations()
                .iter()
                .any(|d| std::ptr::eq(Arc::as_ptr(d), self));
            if !back {
                return Err(PortError::NotConnectedBack {
                    port: self.to_string(),
                    source_name: src.to_string(),
                });
            }
            return Ok(());
        }
        if let Some(element) = &self.element {
            return element.directly_connected();
        }
        self.entries
            .values()
            .try_for_each(|entry| entry.directly_connected())
    }

    // -- buffers --

    fn buffer(&self) -> Option<Arc<Buffer>> {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer().is_some()
    }

    /// Attaches a queue to every leaf of this tree that lacks one.
    pub fn bufferize(&self) {
        if self.is_primitive_class() {
            let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
            if buffer.is_none() {
                *buffer = Some(Arc::new(Buffer::new(QUEUE_CAPACITY)));
            }
            return;
        }
        self.for_each_child(Port::bufferize);
    }

    /// Closes every queue in this tree, waking blocked pushers and pullers.
    pub fn close(&self) {
        if let Some(buffer) = self.buffer() {
            buffer.close();
        }
        self.for_each_child(Port::close);
    }

    /// Replaces every closed queue in this tree with a fresh one.
    pub fn open(&self) {
        {
            let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
            if buffer.as_ref().is_some_and(|b| b.is_closed()) {
                *buffer = Some(Arc::new(Buffer::new(QUEUE_CAPACITY)));
            }
        }
        self.for_each_child(Port::open);
    }

    pub fn is_closed(&self) -> bool {
        self.buffer().is_some_and(|b| b.is_closed())
    }

    /// Number of values waiting in this port's queue.
    pub fn queued(&self) -> usize {
        self.buffer().map_or(0, |b| b.len())
    }

    fn for_each_child(&self, f: fn(&Port)) {
        if let Some(element) = &self.element {
            f(element);
        }
        for entry in self.entries.values() {
            f(entry);
        }
    }

    pub fn walk_primitive_ports(self: &Arc<Self>, f: &mut dyn FnMut(&Arc<Port>)) {
        if self.is_primitive_class() {
            f(self);
            return;
        }
        if let Some(element) = &self.element {
            element.walk_primitive_ports(f);
        }
        for entry in self.entries.values() {
            entry.walk_primitive_ports(f);
        }
    }

    // -- data --

    pub fn push(&self, value: Value) -> Result<(), PortError> {
        if matches!(self.kind, PortKind::Generic(_)) {
            return Err(PortError::CannotPushGeneric(self.to_string()));
        }
        if let Some(buffer) = self.buffer() {
            return buffer.push(value);
        }

        let primitive = self.is_primitive_class();
        for dest in self.destinations() {
            if primitive || dest.kind == PortKind::Trigger {
                dest.push(value.clone())?;
            }
        }
        if primitive {
            return Ok(());
        }

        match (&self.kind, value) {
            (PortKind::Map, Value::Map(mut values)) => {
                for (name, entry) in &self.entries {
                    if let Some(v) = values.remove(name) {
                        entry.push(v)?;
                    }
                }
                Ok(())
            }
            (PortKind::Map, other) => {
                for entry in self.entries.values() {
                    entry.push(other.clone())?;
                }
                Ok(())
            }
            (PortKind::Stream, value) => {
                let Some(element) = &self.element else {
                    return Ok(());
                };
                match value {
                    Value::List(items) => {
                        element.push(Value::Bos(self.id))?;
                        for item in items {
                            element.push(item)?;
                        }
                        element.push(Value::Eos(self.id))
                    }
                    other => element.push(other),
                }
            }
            _ => Ok(()),
        }
    }

    pub fn pull(&self) -> Result<Value, PortError> {
        if let Some(buffer) = self.buffer() {
            return buffer.pull();
        }
        match &self.kind {
            PortKind::Generic(_) => Err(PortError::CannotPullGeneric(self.to_string())),
            PortKind::Map => self.pull_map(),
            PortKind::Stream => self.pull_stream(),
            _ => Err(PortError::NoBuffer(self.to_string())),
        }
    }

    fn pull_map(&self) -> Result<Value, PortError> {
        let mut values = HashMap::with_capacity(self.entries.len());
        let mut marker: Option<Value> = None;
        for (name, entry) in &self.entries {
            let value = entry.pull()?;
            match (&marker, value.is_marker()) {
                (None, true) if values.is_empty() => marker = Some(value),
                (Some(m), true) if *m == value => {}
                (None, false) => {
                    values.insert(name.clone(), value);
                }
                _ => return Err(PortError::MarkerMismatch(self.to_string())),
            }
        }
        Ok(marker.unwrap_or(Value::Map(values)))
    }

    fn pull_stream(&self) -> Result<Value, PortError> {
        let Some(element) = &self.element else {
            return Err(PortError::NoBuffer(self.to_string()));
        };
        let first = element.pull()?;
        if !self.owns_bos(&first) {
            return Ok(first);
        }
        let mut items = Vec::new();
        loop {
            let value = element.pull()?;
            if self.owns_eos(&value) {
                return Ok(Value::List(items));
            }
            items.push(value);
        }
    }

    /// Non-blocking pull from a queued leaf.
    pub fn poll(&self) -> Result<Option<Value>, PortError> {
        match self.buffer() {
            Some(buffer) => Ok(buffer.try_pull()),
            None => Err(PortError::NoBuffer(self.to_string())),
        }
    }

    pub fn pull_number(&self) -> Result<f64, PortError> {
        let value = self.pull()?;
        value.as_number().ok_or_else(|| self.unexpected("number", &value))
    }

    pub fn pull_string(&self) -> Result<String, PortError> {
        match self.pull()? {
            Value::String(s) => Ok(s),
            other => Err(self.unexpected("string", &other)),
        }
    }

    pub fn pull_boolean(&self) -> Result<bool, PortError> {
        let value = self.pull()?;
        value.as_bool().ok_or_else(|| self.unexpected("boolean", &value))
    }

    pub fn pull_binary(&self) -> Result<Vec<u8>, PortError> {
        match self.pull()? {
            Value::Binary(b) => Ok(b),
            other => Err(self.unexpected("binary", &other)),
        }
    }

    fn unexpected(&self, expected: &'static str, value: &Value) -> PortError {
        PortError::UnexpectedValue {
            port: self.to_string(),
            expected,
            actual: value.type_name(),
        }
    }

    // -- markers --

    fn stream_element(&self) -> Result<&Arc<Port>, PortError> {
        match (&self.kind, &self.element) {
            (PortKind::Stream, Some(element)) => Ok(element),
            _ => Err(PortError::NotAStream(self.to_string())),
        }
    }

    /// Marker opening a substream of this port.
    pub fn new_bos(&self) -> Value {
        Value::Bos(self.id)
    }

    /// Marker closing a substream of this port.
    pub fn new_eos(&self) -> Value {
        Value::Eos(self.id)
    }

    /// Opens a substream that is then pushed item by item into `element()`.
    /// Trigger destinations fire once, as they would for a whole list.
    pub fn push_bos(&self) -> Result<(), PortError> {
        let element = self.stream_element()?;
        for dest in self.destinations() {
            if dest.kind == PortKind::Trigger {
                dest.push(Value::Null)?;
            }
        }
        element.push(self.new_bos())
    }

    pub fn push_eos(&self) -> Result<(), PortError> {
        self.stream_element()?.push(self.new_eos())
    }

    /// Consumes the marker opening a substream of this port; the items are
    /// then pulled from `element()` until `owns_eos` holds.
    pub fn pull_bos(&self) -> Result<(), PortError> {
        let value = self.stream_element()?.pull()?;
        if self.owns_bos(&value) {
            Ok(())
        } else {
            Err(self.unexpected("own BOS", &value))
        }
    }

    pub fn pull_eos(&self) -> Result<(), PortError> {
        let value = self.stream_element()?.pull()?;
        if self.owns_eos(&value) {
            Ok(())
        } else {
            Err(self.unexpected("own EOS", &value))
        }
    }

    fn owns(&self, origin: PortId) -> bool {
        origin == self.id || self.source().is_some_and(|src| src.id == origin)
    }

    pub fn owns_bos(&self, value: &Value) -> bool {
        matches!(value, Value::Bos(origin) if self.owns(*origin))
    }

    pub fn owns_eos(&self, value: &Value) -> bool {
        matches!(value, Value::Eos(origin) if self.owns(*origin))
    }

    // -- naming --

    fn path(&self) -> String {
        let mut segments = Vec::new();
        let mut key = self.key.clone();
        let mut parent = self.parent.upgrade();
        while let Some(port) = parent {
            segments.push(key.unwrap_or_else(|| "~".to_string()));
            key = port.key.clone();
            parent = port.parent.upgrade();
        }
        segments.reverse();
        segments.join(".")
    }

    fn operator_label(&self) -> String {
        let Some(owner) = &self.owner else {
            return String::new();
        };
        let name = owner
            .operator
            .upgrade()
            .map(|op| op.name())
            .unwrap_or_default();
        match &owner.surface {
            Surface::Service(service) if service == MAIN_SERVICE => name,
            Surface::Service(service) => format!("{service}@{name}"),
            Surface::Delegate(delegate) => format!("{name}.{delegate}"),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::In => write!(f, "{}({}", self.path(), self.operator_label()),
            Direction::Out => write!(f, "{}){}", self.operator_label(), self.path()),
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("name", &self.to_string())
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .finish()
    }
}

impl Ancestry {
    fn root() -> Self {
        Ancestry {
            parent: Weak::new(),
            parent_stream: Weak::new(),
            parent_map: Weak::new(),
            key: None,
        }
    }
}

fn ptr_eq(weak: &Weak<Port>, port: &Arc<Port>) -> bool {
    std::ptr::eq(weak.as_ptr(), Arc::as_ptr(port))
}
