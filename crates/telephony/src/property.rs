//! Typed property bags for engine configuration.
//!
//! Page script passes a loose name/value map. Only names declared in the
//! schema reach the engine; everything else is dropped without an error.

use serde_json::{Map, Value};
use std::fmt;

/// Primitive type the engine expects for a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// Integer carried as a string (ports, version).
    IntegerString,
    Boolean,
}

/// A typed property value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s.as_str()),
            PropertyValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Text(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => f.write_str(s),
            PropertyValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Ordered collection of typed properties handed to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyBag {
    entries: Vec<(String, PropertyValue)>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value for the name.
    pub fn set(&mut self, name: &str, value: PropertyValue) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Property names the engine understands.
pub const PROPERTY_SCHEMA: &[(&str, PropertyKind)] = &[
    ("localvoipport", PropertyKind::IntegerString),
    ("remotevoipport", PropertyKind::IntegerString),
    ("version", PropertyKind::IntegerString),
    ("udp", PropertyKind::Boolean),
    ("tcp", PropertyKind::Boolean),
];

/// Marshals page-supplied property maps into engine property bags.
#[derive(Clone, Debug)]
pub struct PropertyCodec {
    schema: &'static [(&'static str, PropertyKind)],
}

impl PropertyCodec {
    pub fn new() -> Self {
        Self {
            schema: PROPERTY_SCHEMA,
        }
    }

    /// Kind declared for `name`, if it is a recognized property.
    pub fn kind_of(&self, name: &str) -> Option<PropertyKind> {
        self.schema
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, kind)| *kind)
    }

    /// Build a bag from the recognized keys of `map`, in schema order.
    pub fn encode(&self, map: &Map<String, Value>) -> PropertyBag {
        let mut bag = PropertyBag::new();

        for (name, kind) in self.schema {
            let Some(raw) = map.get(*name) else {
                continue;
            };
            match coerce(*kind, raw) {
                Some(value) => bag.set(name, value),
                None => tracing::debug!("Dropping property {} with unusable value {}", name, raw),
            }
        }

        for name in map.keys().filter(|name| self.kind_of(name).is_none()) {
            tracing::trace!("Dropping unrecognized property {}", name);
        }

        bag
    }
}

impl Default for PropertyCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn coerce(kind: PropertyKind, raw: &Value) -> Option<PropertyValue> {
    match kind {
        PropertyKind::IntegerString => match raw {
            Value::String(s) => Some(PropertyValue::Text(s.clone())),
            Value::Number(n) => Some(PropertyValue::Text(n.to_string())),
            Value::Bool(b) => Some(PropertyValue::Text(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        },
        PropertyKind::Boolean => Some(PropertyValue::Bool(truthy(raw))),
    }
}

/// Script truthiness of a JSON value.
fn truthy(raw: &Value) -> bool {
    match raw {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
