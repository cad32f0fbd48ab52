use std::sync::{Arc, Weak};

use crate::definition::ServiceDef;
use crate::port::{Direction, Owner, Port, Surface};

use super::Operator;

/// An operator's request/response surface.
#[derive(Debug)]
pub struct Service {
    name: String,
    input: Arc<Port>,
    output: Arc<Port>,
}

/// Inverted surface: `out` carries what the operator hands to a collaborator,
/// `in` carries the collaborator's reply.
#[derive(Debug)]
pub struct Delegate {
    name: String,
    input: Arc<Port>,
    output: Arc<Port>,
}

fn port_pair(
    def: &ServiceDef,
    operator: &Weak<Operator>,
    surface: Surface,
    buffered: bool,
) -> (Arc<Port>, Arc<Port>) {
    let owner = Owner {
        operator: operator.clone(),
        surface,
    };
    let input = Port::with_owner(&def.input, Direction::In, owner.clone(), buffered);
    let output = Port::with_owner(&def.output, Direction::Out, owner, buffered);
    (input, output)
}

impl Service {
    pub(crate) fn new(name: &str, def: &ServiceDef, operator: &Weak<Operator>, buffered: bool) -> Self {
        let (input, output) = port_pair(def, operator, Surface::Service(name.to_string()), buffered);
        Self {
            name: name.to_string(),
            input,
            output,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_port(&self) -> &Arc<Port> {
        &self.input
    }

    pub fn out_port(&self) -> &Arc<Port> {
        &self.output
    }
}

impl Delegate {
    pub(crate) fn new(name: &str, def: &ServiceDef, operator: &Weak<Operator>, buffered: bool) -> Self {
        let (input, output) = port_pair(def, operator, Surface::Delegate(name.to_string()), buffered);
        Self {
            name: name.to_string(),
            input,
            output,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_port(&self) -> &Arc<Port> {
        &self.input
    }

    pub fn out_port(&self) -> &Arc<Port> {
        &self.output
    }
}
