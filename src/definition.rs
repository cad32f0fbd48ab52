use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operator::{Properties, MAIN_SERVICE};
use crate::types::{Generics, TypeDescriptor, TypeError};

// characters with a meaning in port references
const RESERVED_NAME_CHARS: [char; 5] = [' ', '.', '@', '(', ')'];

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}: {1}")]
    Port(String, TypeError),

    #[error("operator has no main service")]
    MissingMainService,

    #[error("delegate must not be called main")]
    ReservedDelegateName,

    #[error("invalid instance name {0:?}")]
    InvalidInstanceName(String),

    #[error("instance {0} has no operator")]
    MissingOperator(String),

    #[error("unsupported definition file {0}")]
    UnsupportedFormat(PathBuf),
}

/// In/out descriptor pair of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceDef {
    #[serde(rename = "in")]
    pub input: TypeDescriptor,
    #[serde(rename = "out")]
    pub output: TypeDescriptor,
}

/// Delegates share the service layout; only their role differs.
pub type DelegateDef = ServiceDef;

/// A child operator inside a composed definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceDef {
    pub operator: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub generics: Generics,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[schemars(with = "HashMap<String, serde_json::Value>")]
    pub properties: Properties,
}

/// Declarative description of an operator.
///
/// A definition without `operators` describes the interface of a
/// function-backed operator; with them it describes a container whose
/// `connections` map a source port reference to its destinations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperatorDef {
    #[serde(default)]
    pub services: HashMap<String, ServiceDef>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub delegates: HashMap<String, DelegateDef>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operators: HashMap<String, InstanceDef>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, TypeDescriptor>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub connections: HashMap<String, Vec<String>>,
}

impl ServiceDef {
    pub fn new(input: TypeDescriptor, output: TypeDescriptor) -> Self {
        Self { input, output }
    }

    fn validate(&self, label: &str) -> Result<(), DefinitionError> {
        self.input
            .validate()
            .map_err(|e| DefinitionError::Port(format!("{label} in"), e))?;
        self.output
            .validate()
            .map_err(|e| DefinitionError::Port(format!("{label} out"), e))
    }

    fn specify_generics(&mut self, generics: &Generics) -> Result<(), TypeError> {
        self.input = self.input.specify_generics(generics)?;
        self.output = self.output.specify_generics(generics)?;
        Ok(())
    }

    pub fn generics_specified(&self) -> Result<(), TypeError> {
        self.input.generics_specified()?;
        self.output.generics_specified()
    }
}

impl OperatorDef {
    /// Definition with a single `main` service.
    pub fn with_main(input: TypeDescriptor, output: TypeDescriptor) -> Self {
        let mut def = OperatorDef::default();
        def.services
            .insert(MAIN_SERVICE.to_string(), ServiceDef::new(input, output));
        def
    }

    pub fn from_json_str(s: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml_bw::from_str(s)?)
    }

    /// Reads a `.json`, `.yaml` or `.yml` definition file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            _ => Err(DefinitionError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !self.services.contains_key(MAIN_SERVICE) {
            return Err(DefinitionError::MissingMainService);
        }
        for (name, service) in &self.services {
            service.validate(&format!("service {name}"))?;
        }
        for (name, delegate) in &self.delegates {
            if name == MAIN_SERVICE {
                return Err(DefinitionError::ReservedDelegateName);
            }
            delegate.validate(&format!("delegate {name}"))?;
        }
        for (name, property) in &self.properties {
            property
                .validate()
                .map_err(|e| DefinitionError::Port(format!("property {name}"), e))?;
        }
        for (name, instance) in &self.operators {
            if name.is_empty() || name.contains(RESERVED_NAME_CHARS) {
                return Err(DefinitionError::InvalidInstanceName(name.clone()));
            }
            if instance.operator.is_empty() {
                return Err(DefinitionError::MissingOperator(name.clone()));
            }
            for binding in instance.generics.values() {
                binding.validate()?;
            }
        }
        Ok(())
    }

    /// Specializes every descriptor of this definition, instance bindings included.
    pub fn specify_generics(&mut self, generics: &Generics) -> Result<(), TypeError> {
        for service in self.services.values_mut() {
            service.specify_generics(generics)?;
        }
        for delegate in self.delegates.values_mut() {
            delegate.specify_generics(generics)?;
        }
        for property in self.properties.values_mut() {
            *property = property.specify_generics(generics)?;
        }
        for instance in self.operators.values_mut() {
            for binding in instance.generics.values_mut() {
                *binding = binding.specify_generics(generics)?;
            }
        }
        Ok(())
    }

    /// Fails on the first service or delegate type that still holds a generic.
    pub fn generics_specified(&self) -> Result<(), TypeError> {
        self.services
            .values()
            .chain(self.delegates.values())
            .try_for_each(ServiceDef::generics_specified)
    }
}
