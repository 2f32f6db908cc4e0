//! The dynamic value representation every resolved request produces.
//!
//! The engine never needs compile-time knowledge of a node's result type: all
//! results travel as [`Value`] and are converted to concrete Rust types at the
//! edges through [`FromValue`] / [`IntoValue`].

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use base64::Engine;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const OPTIONAL_SOME: &str = "some";
const OPTIONAL_NONE: &str = "none";

/// A generic, self-describing value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, used in type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Blob(_) => "blob",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Wraps a value as a present optional.
    pub fn some(value: Value) -> Value {
        Value::Map(BTreeMap::from([(OPTIONAL_SOME.to_string(), value)]))
    }

    /// The absent optional.
    pub fn none() -> Value {
        Value::Map(BTreeMap::from([(OPTIONAL_NONE.to_string(), Value::Nil)]))
    }

    /// Builds a union value with a single active member.
    pub fn union(member: impl Into<String>, value: Value) -> Value {
        Value::Map(BTreeMap::from([(member.into(), value)]))
    }

    /// Interprets `self` as an optional, consuming it.
    pub fn into_optional(self) -> Result<Option<Value>, TypeError> {
        match self {
            Value::Map(mut map) if map.len() == 1 => {
                if let Some(value) = map.remove(OPTIONAL_SOME) {
                    Ok(Some(value))
                } else if map.contains_key(OPTIONAL_NONE) {
                    Ok(None)
                } else {
                    Err(TypeError::Mismatch {
                        expected: "optional",
                        found: "map",
                    })
                }
            }
            other => Err(TypeError::Mismatch {
                expected: "optional",
                found: other.type_name(),
            }),
        }
    }

    /// Removes and returns a field of a map value.
    pub fn take_field(self, field: &str) -> Result<Value, TypeError> {
        match self {
            Value::Map(mut map) => map
                .remove(field)
                .ok_or_else(|| TypeError::MissingField(field.to_string())),
            other => Err(TypeError::Mismatch {
                expected: "map",
                found: other.type_name(),
            }),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders the value as JSON. Blobs become base64 strings and non-finite
    /// floats become `null`, so the mapping is lossy in those two cases.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Blob(bytes) => {
                serde_json::Value::String(general_purpose::STANDARD.encode(bytes))
            }
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Blob(bytes) => bytes.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Map(fields) => fields.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// ******************************
// *        Conversions         *
// ******************************

/// Conversion of a concrete Rust type into the generic representation.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Conversion of the generic representation back into a concrete type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, TypeError>;
}

fn mismatch(expected: &'static str, found: &Value) -> TypeError {
    TypeError::Mismatch {
        expected,
        found: found.type_name(),
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        Ok(value)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Boolean(b) => Ok(b),
            other => Err(mismatch("boolean", &other)),
        }
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Integer(self)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Integer(i) => Ok(i),
            other => Err(mismatch("integer", &other)),
        }
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Integer(self.into())
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| TypeError::OutOfRange(wide))
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Integer(i) => Ok(i as f64),
            other => Err(mismatch("float", &other)),
        }
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

/// Raw binary data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Blob(pub Vec<u8>);

impl IntoValue for Blob {
    fn into_value(self) -> Value {
        Value::Blob(self.0)
    }
}

impl FromValue for Blob {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Blob(bytes) => Ok(Blob(bytes)),
            other => Err(mismatch("blob", &other)),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::Array(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch("array", &other)),
        }
    }
}

impl<T: IntoValue> IntoValue for BTreeMap<String, T> {
    fn into_value(self) -> Value {
        Value::Map(self.into_iter().map(|(k, v)| (k, v.into_value())).collect())
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        match value {
            Value::Map(fields) => fields
                .into_iter()
                .map(|(k, v)| Ok((k, T::from_value(v)?)))
                .collect(),
            other => Err(mismatch("map", &other)),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(value) => Value::some(value.into_value()),
            None => Value::none(),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, TypeError> {
        value.into_optional()?.map(T::from_value).transpose()
    }
}
