use std::{collections::BTreeMap, convert::Infallible};

use serde::{Deserialize, Serialize};

/// Namespaced durable key-value storage, shaped after the NVS API.
pub trait KeyValueStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get_u8(&mut self, namespace: &str, key: &str) -> Result<Option<u8>, Self::Error>;
    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), Self::Error>;
    fn get_str(&mut self, namespace: &str, key: &str) -> Result<Option<String>, Self::Error>;
    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), Self::Error>;
    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), Self::Error>;

    fn get_bool(&mut self, namespace: &str, key: &str) -> Result<Option<bool>, Self::Error> {
        Ok(self.get_u8(namespace, key)?.map(|v| v != 0))
    }

    fn set_bool(&mut self, namespace: &str, key: &str, value: bool) -> Result<(), Self::Error> {
        self.set_u8(namespace, key, u8::from(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    U8(u8),
    Str(String),
}

/// In-memory backend. Also the serialized image of the host's file store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    namespaces: BTreeMap<String, BTreeMap<String, StoredValue>>,
    #[serde(skip)]
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of mutating calls since creation.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, StoredValue>> {
        self.namespaces.get(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    fn value(&self, namespace: &str, key: &str) -> Option<&StoredValue> {
        self.namespaces.get(namespace)?.get(key)
    }

    fn put(&mut self, namespace: &str, key: &str, value: StoredValue) {
        self.writes += 1;
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

impl KeyValueStore for MemoryStore {
    type Error = Infallible;

    fn get_u8(&mut self, namespace: &str, key: &str) -> Result<Option<u8>, Self::Error> {
        Ok(match self.value(namespace, key) {
            Some(StoredValue::U8(v)) => Some(*v),
            _ => None,
        })
    }

    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), Self::Error> {
        self.put(namespace, key, StoredValue::U8(value));
        Ok(())
    }

    fn get_str(&mut self, namespace: &str, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(match self.value(namespace, key) {
            Some(StoredValue::Str(v)) => Some(v.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), Self::Error> {
        self.put(namespace, key, StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), Self::Error> {
        self.writes += 1;
        if let Some(entries) = self.namespaces.get_mut(namespace) {
            entries.remove(key);
            if entries.is_empty() {
                self.namespaces.remove(namespace);
            }
        }
        Ok(())
    }
}
