use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::port::PortId;

/// Dynamic payload flowing through ports.
///
/// `Bos`/`Eos` frame one stream instance inline with its elements. They carry the
/// id of the port that emitted them and never leave the engine: serializing a
/// marker yields `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Json", into = "Json")]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Bos(PortId),
    Eos(PortId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        if let Value::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        if let Value::Binary(b) = self {
            Some(b)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        if let Value::List(l) = self {
            Some(l)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        if let Value::Map(m) = self {
            Some(m)
        } else {
            None
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Value::Bos(_) | Value::Eos(_))
    }

    pub fn is_bos(&self) -> bool {
        matches!(self, Value::Bos(_))
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Value::Eos(_))
    }

    /// Short name of the variant, used in mismatch reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::List(_) => "stream",
            Value::Map(_) => "map",
            Value::Bos(_) => "BOS",
            Value::Eos(_) => "EOS",
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null | Value::Bos(_) | Value::Eos(_) => Json::Null,
            Value::Boolean(b) => json!(b),
            Value::Number(n) => json!(n),
            Value::String(s) => json!(s),
            Value::Binary(b) => json!(b),
            Value::List(l) => Json::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => Json::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bos(origin) => write!(f, "BOS({origin})"),
            Value::Eos(origin) => write!(f, "EOS({origin})"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let number = Value::Number(4.0);
        assert_eq!(number.as_number(), Some(4.0));
        assert_eq!(number.as_str(), None);

        let string = Value::from("hi");
        assert_eq!(string.as_str(), Some("hi"));

        let list = Value::from(vec![1.0, 2.0]);
        assert_eq!(list.as_list().map(Vec::len), Some(2));
        assert!(!list.is_marker());
    }

    #[test]
    fn test_value_from_json() {
        let value = Value::from(json!({"a": [1, 2], "b": true, "c": null}));
        let map = value.as_map().unwrap();
        assert_eq!(map["a"], Value::List(vec![Value::Number(1.0), Value::Number(2.0)]));
        assert_eq!(map["b"], Value::Boolean(true));
        assert_eq!(map["c"], Value::Null);
    }

    #[test]
    fn test_markers_serialize_as_null() {
        let marker = Value::Bos(PortId::from_raw(7));
        assert!(marker.is_marker());
        assert!(marker.is_bos());
        assert_eq!(serde_json::to_value(&marker).unwrap(), Json::Null);
    }

    #[test]
    fn test_value_deserialize() {
        let value: Value = serde_json::from_str(r#"[[1], []]"#).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::List(vec![Value::Number(1.0)]), Value::List(vec![])])
        );
    }
}
