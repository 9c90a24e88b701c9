//! Secret bundle - the key/value mapping carried inside a rumor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::WireError;

/// A mapping from secret names to JSON values.
///
/// Keys are unique and their order carries no meaning. The backing
/// `BTreeMap` gives a canonical (sorted, compact) JSON serialization.
/// An empty bundle is a tombstone.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretBundle(BTreeMap<String, serde_json::Value>);

impl SecretBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for this key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bundle is empty (a tombstone).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over secret names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Unwrap into the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, serde_json::Value> {
        self.0
    }

    /// Canonical compact JSON with sorted keys.
    pub fn to_canonical_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Parse a JSON document that must be an object.
    ///
    /// Arrays and primitives are rejected with [`WireError::InvalidData`].
    pub fn from_json_object(json: &str) -> Result<Self, WireError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Convert any serializable value, provided it serializes to an object.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, WireError> {
        Self::from_value(serde_json::to_value(value)?)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, WireError> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(WireError::InvalidData(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// Values are secrets; only names are shown.
impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for SecretBundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for SecretBundle {
    type Item = (String, serde_json::Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, serde_json::Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<BTreeMap<String, serde_json::Value>> for SecretBundle {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}
