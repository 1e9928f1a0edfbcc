//! Typed store handles.
//!
//! Handles are cheap to clone and only hold the store name plus a reference to
//! the backend, so the same store can be opened from any node of the grid.

use super::backend::{PutMode, StorageBackend, StoreKind};
use crate::error::{GridError, GridResult};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

fn decode<T: DeserializeOwned>(value: Value) -> GridResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(value: &T) -> GridResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Visits the backend store and decodes each value, surfacing the first
/// decoding error after iteration stops.
fn typed_for_each<T, F>(backend: &dyn StorageBackend, store: &str, mut f: F) -> GridResult<bool>
where
    T: DeserializeOwned,
    F: FnMut(&str, T) -> bool,
{
    let mut failure: Option<GridError> = None;
    let completed = backend.for_each(store, &mut |key, value| {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(decoded) => f(key, decoded),
            Err(e) => {
                failure = Some(e.into());
                false
            }
        }
    })?;

    match failure {
        Some(e) => Err(e),
        None => Ok(completed),
    }
}

// ============================================================
// MAP
// ============================================================

/// Key/value store with insertion-ordered iteration.
pub struct GridMap<T> {
    name: String,
    backend: Arc<dyn StorageBackend>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GridMap<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> GridMap<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn open(backend: Arc<dyn StorageBackend>, name: &str) -> GridResult<Self> {
        backend.open_store(name, StoreKind::Map)?;
        Ok(Self {
            name: name.to_string(),
            backend,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> GridResult<Option<T>> {
        self.backend
            .get(&self.name, key)?
            .map(decode)
            .transpose()
    }

    pub fn contains(&self, key: &str) -> GridResult<bool> {
        Ok(self.backend.get(&self.name, key)?.is_some())
    }

    /// Stores `value` under `key`. Returns `true` if the key was new or the
    /// stored value changed.
    pub fn put(&self, key: &str, value: &T) -> GridResult<bool> {
        self.backend
            .put(&self.name, key, encode(value)?, PutMode::Upsert)
    }

    /// Atomically replaces the value under `key` with `f(current)`.
    /// Always returns `true`.
    pub fn update<F>(&self, key: &str, f: F) -> GridResult<bool>
    where
        F: FnOnce(Option<T>) -> T,
    {
        let mut f = Some(f);
        self.backend.update(&self.name, key, &mut |current| {
            let current = current.map(decode::<T>).transpose()?;
            let f = f
                .take()
                .ok_or_else(|| GridError::Internal("update function applied twice".into()))?;
            encode(&f(current))
        })
    }

    pub fn delete(&self, key: &str) -> GridResult<bool> {
        self.backend.delete(&self.name, key)
    }

    /// Visits entries in insertion order. Returns `false` if `f` stopped early.
    pub fn for_each<F>(&self, f: F) -> GridResult<bool>
    where
        F: FnMut(&str, T) -> bool,
    {
        typed_for_each(self.backend.as_ref(), &self.name, f)
    }

    pub fn keys(&self) -> GridResult<Vec<String>> {
        let mut keys = Vec::new();
        self.backend.for_each(&self.name, &mut |key, _| {
            keys.push(key.to_string());
            true
        })?;
        Ok(keys)
    }

    pub fn size(&self) -> GridResult<usize> {
        self.backend.size(&self.name)
    }

    pub fn is_empty(&self) -> GridResult<bool> {
        Ok(self.size()? == 0)
    }

    pub fn clear(&self) -> GridResult<()> {
        self.backend.clear(&self.name)
    }
}

// ============================================================
// QUEUE
// ============================================================

/// FIFO store of keyed values. Putting an existing key is a no-op and keeps
/// the entry's position.
pub struct GridQueue<T> {
    name: String,
    backend: Arc<dyn StorageBackend>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GridQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> GridQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn open(backend: Arc<dyn StorageBackend>, name: &str) -> GridResult<Self> {
        backend.open_store(name, StoreKind::Queue)?;
        Ok(Self {
            name: name.to_string(),
            backend,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `value` under `key`. Returns `false` if the key is already queued.
    pub fn put(&self, key: &str, value: &T) -> GridResult<bool> {
        self.backend
            .put(&self.name, key, encode(value)?, PutMode::InsertOnly)
    }

    /// Removes and returns the oldest value.
    pub fn poll(&self) -> GridResult<Option<T>> {
        self.backend
            .poll(&self.name)?
            .map(|(_, value)| decode(value))
            .transpose()
    }

    pub fn get(&self, key: &str) -> GridResult<Option<T>> {
        self.backend
            .get(&self.name, key)?
            .map(decode)
            .transpose()
    }

    pub fn contains(&self, key: &str) -> GridResult<bool> {
        Ok(self.backend.get(&self.name, key)?.is_some())
    }

    pub fn delete(&self, key: &str) -> GridResult<bool> {
        self.backend.delete(&self.name, key)
    }

    pub fn for_each<F>(&self, f: F) -> GridResult<bool>
    where
        F: FnMut(&str, T) -> bool,
    {
        typed_for_each(self.backend.as_ref(), &self.name, f)
    }

    pub fn size(&self) -> GridResult<usize> {
        self.backend.size(&self.name)
    }

    pub fn is_empty(&self) -> GridResult<bool> {
        Ok(self.size()? == 0)
    }

    pub fn clear(&self) -> GridResult<()> {
        self.backend.clear(&self.name)
    }
}

// ============================================================
// SET
// ============================================================

/// Set of typed members, keyed by their JSON encoding.
pub struct GridSet<T> {
    name: String,
    backend: Arc<dyn StorageBackend>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GridSet<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            _marker: PhantomData,
        }
    }
}

fn member_key(member: &Value) -> GridResult<String> {
    Ok(serde_json::to_string(member)?)
}

impl<T> GridSet<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn open(backend: Arc<dyn StorageBackend>, name: &str) -> GridResult<Self> {
        backend.open_store(name, StoreKind::Set)?;
        Ok(Self {
            name: name.to_string(),
            backend,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if `member` was not already present.
    pub fn add(&self, member: &T) -> GridResult<bool> {
        let member = encode(member)?;
        self.backend
            .put(&self.name, &member_key(&member)?, member, PutMode::InsertOnly)
    }

    pub fn contains(&self, member: &T) -> GridResult<bool> {
        let key = member_key(&encode(member)?)?;
        Ok(self.backend.get(&self.name, &key)?.is_some())
    }

    pub fn remove(&self, member: &T) -> GridResult<bool> {
        let key = member_key(&encode(member)?)?;
        self.backend.delete(&self.name, &key)
    }

    /// Visits members in insertion order. Returns `false` if `f` stopped early.
    pub fn for_each<F>(&self, mut f: F) -> GridResult<bool>
    where
        F: FnMut(T) -> bool,
    {
        typed_for_each(self.backend.as_ref(), &self.name, |_, member| f(member))
    }

    pub fn size(&self) -> GridResult<usize> {
        self.backend.size(&self.name)
    }

    pub fn is_empty(&self) -> GridResult<bool> {
        Ok(self.size()? == 0)
    }

    pub fn clear(&self) -> GridResult<()> {
        self.backend.clear(&self.name)
    }
}
