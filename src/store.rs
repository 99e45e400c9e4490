//! Flat key/value store shared by every node of a flow

use crate::error::{FlowError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Serialized values keyed by string.
///
/// Values are held as JSON and only ever decoded through typed accessors.
/// Keys are ordered so that a persisted store encodes deterministically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataStore {
    entries: BTreeMap<String, Value>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `value` and store it under `key`, replacing any earlier value
    pub fn put<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)?;
        self.entries.insert(key.into(), encoded);
        Ok(())
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Decode the value stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .entries
            .get(key)
            .ok_or_else(|| FlowError::DataNotFound(key.to_string()))?;
        T::deserialize(value).map_err(FlowError::Serialization)
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
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

    /// Merge a completed node's output buffer, last writer wins
    pub fn merge(&mut self, outputs: BTreeMap<String, Value>) {
        self.entries.extend(outputs);
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }
}

impl From<BTreeMap<String, Value>> for DataStore {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Artifact {
        id: String,
        size: u64,
    }

    #[test]
    fn test_put_and_get_typed() {
        let mut store = DataStore::new();
        let artifact = Artifact {
            id: "build-233".to_string(),
            size: 42,
        };
        store.put("artifact", &artifact).unwrap();

        let got: Artifact = store.get("artifact").unwrap();
        assert_eq!(got, artifact);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing_key() {
        let store = DataStore::new();
        let result = store.get::<String>("nope");
        assert!(matches!(result, Err(FlowError::DataNotFound(key)) if key == "nope"));
    }

    #[test]
    fn test_get_wrong_shape() {
        let mut store = DataStore::new();
        store.put("count", &"not a number").unwrap();

        let result = store.get::<u32>("count");
        assert!(matches!(result, Err(FlowError::Serialization(_))));
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut store = DataStore::new();
        store.put("host", &"host1").unwrap();

        let mut outputs = BTreeMap::new();
        outputs.insert("host".to_string(), Value::from("host2"));
        outputs.insert("port".to_string(), Value::from(8080));
        store.merge(outputs);

        assert_eq!(store.get::<String>("host").unwrap(), "host2");
        assert_eq!(store.get::<u16>("port").unwrap(), 8080);
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["host", "port"]);
    }
}
