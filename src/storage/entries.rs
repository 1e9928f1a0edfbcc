//! Insertion-ordered entries of one store.
//!
//! Shared by the in-memory backend (committed state) and by transactions
//! (their private copy of a store once they iterate or poll it).

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub(crate) struct Entries {
    next_seq: u64,
    version: u64,
    values: HashMap<String, (u64, Value)>,
    order: BTreeMap<u64, String>,
}

impl Entries {
    pub(crate) fn from_ordered(version: u64, entries: Vec<(String, Value)>) -> Self {
        let mut built = Self::default();
        for (key, value) in entries {
            built.append(key, value);
        }
        built.version = version;
        built
    }

    /// Bumped by every mutation.
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|(_, value)| value)
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    /// Replaces the value of an existing key in place, or appends a new key.
    pub(crate) fn upsert(&mut self, key: &str, value: Value) {
        match self.values.get_mut(key) {
            Some((_, existing)) => *existing = value,
            None => self.append(key.to_string(), value),
        }
        self.version += 1;
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Value> {
        let (seq, value) = self.values.remove(key)?;
        self.order.remove(&seq);
        self.version += 1;
        Some(value)
    }

    pub(crate) fn first_key(&self) -> Option<&str> {
        self.order.values().next().map(String::as_str)
    }

    pub(crate) fn pop_first(&mut self) -> Option<(String, Value)> {
        let key = self.first_key()?.to_string();
        let value = self.remove(&key)?;
        Some((key, value))
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.order.clear();
        self.version += 1;
    }

    pub(crate) fn to_vec(&self) -> Vec<(String, Value)> {
        self.order
            .values()
            .filter_map(|key| self.values.get(key).map(|(_, value)| (key.clone(), value.clone())))
            .collect()
    }

    fn append(&mut self, key: String, value: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.values.insert(key, (seq, value));
    }
}
