//! Textual port references used in connection lists.
//!
//! `path(op` addresses an input port, `op)path` an output port. `op` is empty
//! for the enclosing operator, `child` for its main service, `svc@child` for
//! another service and `child.dlg` for a delegate. Path segments are joined by
//! `.`; `~` steps into a stream element, anything else into a map entry.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::operator::{Operator, MAIN_SERVICE};
use crate::port::{Direction, Port};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("malformed port reference {0:?}")]
    Malformed(String),

    #[error("unknown operator {0}")]
    UnknownOperator(String),

    #[error("unknown service {service} on {operator:?}")]
    UnknownService { operator: String, service: String },

    #[error("unknown delegate {delegate} on {operator:?}")]
    UnknownDelegate { operator: String, delegate: String },

    #[error("unknown port {0}")]
    UnknownPort(String),

    #[error("descending too deep in {0}")]
    TooDeep(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Service(String),
    Delegate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReference {
    /// Child instance name, empty for the enclosing operator.
    pub instance: String,
    pub target: Target,
    pub direction: Direction,
    pub path: Vec<String>,
}

impl FromStr for PortReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (direction, operator, path) = match (s.find('('), s.find(')')) {
            (Some(i), None) => (Direction::In, &s[i + 1..], &s[..i]),
            (None, Some(i)) => (Direction::Out, &s[..i], &s[i + 1..]),
            _ => return Err(ReferenceError::Malformed(s.to_string())),
        };

        let (instance, target) = if let Some((service, instance)) = operator.split_once('@') {
            (instance, Target::Service(service.to_string()))
        } else if let Some((instance, delegate)) = operator.split_once('.') {
            (instance, Target::Delegate(delegate.to_string()))
        } else {
            (operator, Target::Service(MAIN_SERVICE.to_string()))
        };
        if matches!(&target, Target::Service(n) | Target::Delegate(n) if n.is_empty()) {
            return Err(ReferenceError::Malformed(s.to_string()));
        }

        let path = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').map(str::to_string).collect()
        };
        if path.iter().any(String::is_empty) {
            return Err(ReferenceError::Malformed(s.to_string()));
        }

        Ok(PortReference {
            instance: instance.to_string(),
            target,
            direction,
            path,
        })
    }
}

impl PortReference {
    /// Resolves the reference against `container` and its direct children.
    pub fn resolve(&self, container: &Arc<Operator>) -> Result<Arc<Port>, ReferenceError> {
        let operator = if self.instance.is_empty() {
            container.clone()
        } else {
            container
                .child(&self.instance)
                .ok_or_else(|| ReferenceError::UnknownOperator(self.instance.clone()))?
        };

        let (input, output) = match &self.target {
            Target::Service(name) => {
                let service = operator.service(name).ok_or_else(|| ReferenceError::UnknownService {
                    operator: self.instance.clone(),
                    service: name.clone(),
                })?;
                (service.in_port(), service.out_port())
            }
            Target::Delegate(name) => {
                let delegate = operator.delegate(name).ok_or_else(|| ReferenceError::UnknownDelegate {
                    operator: self.instance.clone(),
                    delegate: name.clone(),
                })?;
                (delegate.in_port(), delegate.out_port())
            }
        };
        let mut port = match self.direction {
            Direction::In => input.clone(),
            Direction::Out => output.clone(),
        };

        for segment in &self.path {
            if port.is_primitive_class() {
                return Err(ReferenceError::TooDeep(self.to_string()));
            }
            let next = if segment == "~" {
                port.element()
            } else {
                port.entry(segment)
            };
            port = next
                .cloned()
                .ok_or_else(|| ReferenceError::UnknownPort(self.to_string()))?;
        }
        Ok(port)
    }
}

impl fmt::Display for PortReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operator = match &self.target {
            Target::Service(name) if name == MAIN_SERVICE => self.instance.clone(),
            Target::Service(name) => format!("{name}@{}", self.instance),
            Target::Delegate(name) => format!("{}.{name}", self.instance),
        };
        let path = self.path.join(".");
        match self.direction {
            Direction::In => write!(f, "{path}({operator}"),
            Direction::Out => write!(f, "{operator}){path}"),
        }
    }
}
