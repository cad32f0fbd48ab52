use std::collections::{BTreeSet, HashMap};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// Generic bindings: generic name to the descriptor replacing it.
pub type Generics = HashMap<String, TypeDescriptor>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeError {
    #[error("invalid type descriptor: {0}")]
    Invalid(String),

    #[error("generic not replaced: {0}")]
    UnresolvedGeneric(String),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

/// Shape of a value travelling through a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TypeDescriptor {
    Generic { generic: String },
    Primitive,
    Trigger,
    Number,
    String,
    Binary,
    Boolean,
    Stream { stream: Box<TypeDescriptor> },
    Map { map: HashMap<String, TypeDescriptor> },
}

impl TypeDescriptor {
    pub fn generic(name: impl Into<String>) -> Self {
        TypeDescriptor::Generic { generic: name.into() }
    }

    pub fn stream(element: TypeDescriptor) -> Self {
        TypeDescriptor::Stream {
            stream: Box::new(element),
        }
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, TypeDescriptor)>) -> Self {
        TypeDescriptor::Map {
            map: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TypeDescriptor::Generic { .. } => "generic",
            TypeDescriptor::Primitive => "primitive",
            TypeDescriptor::Trigger => "trigger",
            TypeDescriptor::Number => "number",
            TypeDescriptor::String => "string",
            TypeDescriptor::Binary => "binary",
            TypeDescriptor::Boolean => "boolean",
            TypeDescriptor::Stream { .. } => "stream",
            TypeDescriptor::Map { .. } => "map",
        }
    }

    /// Leaf kinds: everything except generic, stream and map.
    pub fn is_primitive_class(&self) -> bool {
        !matches!(
            self,
            TypeDescriptor::Generic { .. } | TypeDescriptor::Stream { .. } | TypeDescriptor::Map { .. }
        )
    }

    pub fn validate(&self) -> Result<(), TypeError> {
        match self {
            TypeDescriptor::Generic { generic } if generic.is_empty() => {
                Err(TypeError::Invalid("generic identifier missing".into()))
            }
            TypeDescriptor::Stream { stream } => stream.validate(),
            TypeDescriptor::Map { map } => {
                if map.is_empty() {
                    return Err(TypeError::Invalid("map missing or empty".into()));
                }
                for (name, entry) in map {
                    entry
                        .validate()
                        .map_err(|e| TypeError::Invalid(format!("entry {name}: {e}")))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns a copy where every generic bound in `generics` is replaced by a
    /// copy of its binding.
    ///
    /// A binding may itself contain generics. The substituted copy is not
    /// specialized again, so `T -> map{x: U}` can be followed by `U -> number`.
    pub fn specify_generics(&self, generics: &Generics) -> Result<TypeDescriptor, TypeError> {
        match self {
            TypeDescriptor::Generic { generic } => match generics.get(generic) {
                Some(binding) => Ok(binding.clone()),
                None => Ok(self.clone()),
            },
            TypeDescriptor::Stream { stream } => {
                Ok(TypeDescriptor::stream(stream.specify_generics(generics)?))
            }
            TypeDescriptor::Map { map } => {
                let mut specified = HashMap::with_capacity(map.len());
                for (name, entry) in map {
                    specified.insert(name.clone(), entry.specify_generics(generics)?);
                }
                Ok(TypeDescriptor::Map { map: specified })
            }
            _ => Ok(self.clone()),
        }
    }

    pub fn generics_specified(&self) -> Result<(), TypeError> {
        match self {
            TypeDescriptor::Generic { generic } => {
                Err(TypeError::UnresolvedGeneric(generic.clone()))
            }
            TypeDescriptor::Stream { stream } => stream.generics_specified(),
            TypeDescriptor::Map { map } => {
                map.values().try_for_each(TypeDescriptor::generics_specified)
            }
            _ => Ok(()),
        }
    }

    /// Names of all generics still present, sorted.
    pub fn generic_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_generics(&mut names);
        names
    }

    fn collect_generics(&self, names: &mut BTreeSet<String>) {
        match self {
            TypeDescriptor::Generic { generic } => {
                names.insert(generic.clone());
            }
            TypeDescriptor::Stream { stream } => stream.collect_generics(names),
            TypeDescriptor::Map { map } => {
                for entry in map.values() {
                    entry.collect_generics(names);
                }
            }
            _ => {}
        }
    }

    pub fn verify_data(&self, value: &Value) -> Result<(), TypeError> {
        let ok = match (self, value) {
            (TypeDescriptor::Generic { .. }, _) => true,
            (TypeDescriptor::Primitive | TypeDescriptor::Trigger, v) => !matches!(
                v,
                Value::List(_) | Value::Map(_) | Value::Bos(_) | Value::Eos(_)
            ),
            (TypeDescriptor::Number, Value::Number(_)) => true,
            (TypeDescriptor::String, Value::String(_)) => true,
            (TypeDescriptor::Binary, Value::Binary(_)) => true,
            (TypeDescriptor::Boolean, Value::Boolean(_)) => true,
            (TypeDescriptor::Stream { stream }, Value::List(items)) => {
                return items.iter().try_for_each(|item| stream.verify_data(item));
            }
            (TypeDescriptor::Map { map }, Value::Map(values)) => {
                for (name, entry) in map {
                    match values.get(name) {
                        Some(v) => entry.verify_data(v)?,
                        None => {
                            return Err(TypeError::TypeMismatch {
                                expected: format!("entry {name}"),
                                actual: "missing".into(),
                            });
                        }
                    }
                }
                return Ok(());
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(TypeError::TypeMismatch {
                expected: self.to_string(),
                actual: value.type_name().to_string(),
            })
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Generic { generic } => write!(f, "${generic}"),
            TypeDescriptor::Stream { stream } => write!(f, "stream<{stream}>"),
            TypeDescriptor::Map { map } => {
                let mut names: Vec<&String> = map.keys().collect();
                names.sort();
                write!(f, "map{{")?;
                for (i, name) in names.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {}", map[name])?;
                }
                write!(f, "}}")
            }
            other => f.write_str(other.kind()),
        }
    }
}
