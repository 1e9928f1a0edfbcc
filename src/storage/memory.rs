//! In-process storage backend.
//!
//! Stores live in a `DashMap` keyed by name; each store guards its ordered
//! entries with its own mutex. A commit locks every store it reads or writes,
//! in name order, so commits touching the same stores apply one after the
//! other and readers never see half of one.

use super::backend::{CommitBatch, PutMode, ReadCheck, StorageBackend, StoreKind, StoreSnapshot};
use super::entries::Entries;
use crate::error::{GridError, GridResult};

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

struct Store {
    kind: StoreKind,
    data: Mutex<Entries>,
}

#[derive(Default)]
pub struct MemoryStorage {
    stores: DashMap<String, Arc<Store>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn store(&self, name: &str) -> GridResult<Arc<Store>> {
        self.stores
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GridError::Internal(format!("store '{}' does not exist", name)))
    }
}

fn check(guards: &HashMap<&str, MutexGuard<'_, Entries>>, read: &ReadCheck) -> Option<String> {
    let entries = guards.get(read.store())?;
    match read {
        ReadCheck::Key { store, key, value } => (entries.get(key) != value.as_ref())
            .then(|| format!("key '{}' of store '{}' changed", key, store)),
        ReadCheck::Store { store, version } => (entries.version() != *version)
            .then(|| format!("store '{}' changed", store)),
    }
}

impl StorageBackend for MemoryStorage {
    fn open_store(&self, name: &str, kind: StoreKind) -> GridResult<()> {
        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating {} store '{}'", kind.as_str(), name);
                Arc::new(Store {
                    kind,
                    data: Mutex::new(Entries::default()),
                })
            })
            .value()
            .clone();

        if store.kind != kind {
            return Err(GridError::StoreKind {
                name: name.to_string(),
                existing: store.kind.as_str(),
                requested: kind.as_str(),
            });
        }
        Ok(())
    }

    fn get(&self, store: &str, key: &str) -> GridResult<Option<Value>> {
        let store = self.store(store)?;
        let data = store.data.lock()?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, store_name: &str, key: &str, value: Value, mode: PutMode) -> GridResult<bool> {
        let store = self.store(store_name)?;
        let mut data = store.data.lock()?;

        if let Some(existing) = data.get(key)
            && (mode == PutMode::InsertOnly || *existing == value)
        {
            return Ok(false);
        }
        data.upsert(key, value);
        Ok(true)
    }

    fn update(
        &self,
        store_name: &str,
        key: &str,
        f: &mut dyn FnMut(Option<Value>) -> GridResult<Value>,
    ) -> GridResult<bool> {
        let store = self.store(store_name)?;
        let mut data = store.data.lock()?;

        let value = f(data.get(key).cloned())?;
        data.upsert(key, value);
        Ok(true)
    }

    fn delete(&self, store_name: &str, key: &str) -> GridResult<bool> {
        let store = self.store(store_name)?;
        let mut data = store.data.lock()?;
        Ok(data.remove(key).is_some())
    }

    fn poll(&self, store_name: &str) -> GridResult<Option<(String, Value)>> {
        let store = self.store(store_name)?;
        let mut data = store.data.lock()?;
        Ok(data.pop_first())
    }

    fn for_each(
        &self,
        store: &str,
        visitor: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> GridResult<bool> {
        // Copy first so visitors may use storage freely.
        let snapshot = {
            let store = self.store(store)?;
            let data = store.data.lock()?;
            data.to_vec()
        };

        for (key, value) in &snapshot {
            if !visitor(key, value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn size(&self, store: &str) -> GridResult<usize> {
        let store = self.store(store)?;
        let data = store.data.lock()?;
        Ok(data.len())
    }

    fn clear(&self, store_name: &str) -> GridResult<()> {
        let store = self.store(store_name)?;
        store.data.lock()?.clear();
        Ok(())
    }

    fn store_names(&self) -> GridResult<Vec<String>> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn store_exists(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    fn destroy(&self) -> GridResult<()> {
        tracing::info!("Destroying {} store(s)", self.stores.len());
        self.stores.clear();
        Ok(())
    }

    fn snapshot(&self, store: &str) -> GridResult<StoreSnapshot> {
        let store = self.store(store)?;
        let data = store.data.lock()?;
        Ok(StoreSnapshot {
            version: data.version(),
            entries: data.to_vec(),
        })
    }

    fn commit(&self, batch: CommitBatch) -> GridResult<()> {
        let names: BTreeSet<&str> = batch
            .reads
            .iter()
            .map(ReadCheck::store)
            .chain(batch.writes.iter().map(|w| w.store()))
            .collect();

        let stores = names
            .into_iter()
            .map(|name| Ok((name, self.store(name)?)))
            .collect::<GridResult<Vec<_>>>()?;

        let mut guards = HashMap::new();
        for (name, store) in &stores {
            guards.insert(*name, store.data.lock()?);
        }

        if let Some(reason) = batch.reads.iter().find_map(|read| check(&guards, read)) {
            return Err(GridError::Conflict(reason));
        }

        for write in &batch.writes {
            if let Some(entries) = guards.get_mut(write.store()) {
                write.apply(entries);
            }
        }
        tracing::trace!("Committed {} write(s) over {} store(s)", batch.writes.len(), guards.len());
        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
