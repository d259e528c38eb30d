use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// An ordered key/value record extracted by a spider.
///
/// Fields keep their insertion order. Items are moved from one pipeline
/// stage to the next and never shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Item {
    /// Create an empty item
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an item from any value that serializes to a JSON object
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(fields) => Ok(Self { fields }),
            _ => Err(Error::item("Item is not an object")),
        }
    }

    /// Set a field value, keeping the position of an existing key
    pub fn set<K: Into<String>, V: Into<serde_json::Value>>(&mut self, key: K, value: V) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builder form of [`Item::set`]
    pub fn with<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Remove a field, returning its value
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.fields.remove(key)
    }

    /// Check if a field exists
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Field names in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Borrow the underlying JSON object
    pub fn as_map(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields
    }

    /// Convert the item to a JSON value
    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.fields)
    }

    /// Convert the item to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.fields),
        }
    }
}
