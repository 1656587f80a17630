use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::BatchError;

/// Key/value state scoped to one job or step execution.
///
/// Values are stored as JSON so that any serde type can be saved and the whole context
/// can be persisted alongside an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Stores any serializable value under `key`.
    pub fn put_serialized<V: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &V,
    ) -> Result<(), BatchError> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|error| BatchError::Configuration(format!("context key {key}: {error}")))?;
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Reads the value under `key` back into `V`. Returns `Ok(None)` when the key is absent.
    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, BatchError> {
        match self.entries.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|error| BatchError::Configuration(format!("context key {key}: {error}"))),
            None => Ok(None),
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.entries.get(key).and_then(Value::as_u64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
