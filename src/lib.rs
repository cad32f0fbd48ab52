//! A flow-based programming engine.
//!
//! Operators exchange values through typed port trees. Composed operators are
//! built from declarative definitions, flattened by `Operator::compile` and run
//! as one task per function-backed leaf.

pub mod builder;
pub mod builtin;
pub mod config;
pub mod definition;
pub mod logger;
pub mod operator;
pub mod port;
pub mod reference;
pub mod schema;
pub mod synchronizer;
pub mod types;
pub mod value;

pub use builder::{build, BuildError, Library};
pub use definition::OperatorDef;
pub use operator::{ConnectFunction, Operator, OperatorFunction, Properties};
pub use port::{Direction, Port, PortError};
pub use synchronizer::Synchronizer;
pub use types::{Generics, TypeDescriptor};
pub use value::Value;
