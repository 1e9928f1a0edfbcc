//! Transactions.
//!
//! A [`Transaction`] is itself a [`StorageBackend`]: handles opened from a
//! transaction's `GridStorage` read through it and buffer their writes in it.
//! Nothing reaches the underlying backend before [`Transaction::commit`],
//! which confirms everything the transaction read and applies its writes as
//! one step.
//!
//! Point operations (`get`, `put`, `update`, `delete`) remember the committed
//! value they observed per key. Operations over a whole store (`for_each`,
//! `size`, `poll`, `clear`) take a private copy of the store and remember its
//! mutation counter instead.

use super::backend::{CommitBatch, PutMode, ReadCheck, StorageBackend, StoreKind, StoreSnapshot, WriteOp};
use super::entries::Entries;
use crate::error::{GridError, GridResult};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct StoreCopy {
    base_version: u64,
    entries: Entries,
}

#[derive(Default)]
struct StoreView {
    reads: HashMap<String, Option<Value>>,
    /// `None` marks a delete.
    pending: HashMap<String, Option<Value>>,
    copy: Option<StoreCopy>,
}

#[derive(Default)]
struct TxState {
    views: HashMap<String, StoreView>,
    writes: Vec<WriteOp>,
}

impl TxState {
    /// Value of `key` as this transaction sees it.
    fn value(&mut self, base: &dyn StorageBackend, store: &str, key: &str) -> GridResult<Option<Value>> {
        let view = self.views.entry(store.to_string()).or_default();
        if let Some(copy) = &view.copy {
            return Ok(copy.entries.get(key).cloned());
        }
        if let Some(value) = view.pending.get(key).or_else(|| view.reads.get(key)) {
            return Ok(value.clone());
        }

        let value = base.get(store, key)?;
        view.reads.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Private copy of `store` with this transaction's writes applied.
    fn copy(&mut self, base: &dyn StorageBackend, store: &str) -> GridResult<&mut Entries> {
        let view = self.views.entry(store.to_string()).or_default();
        if view.copy.is_none() {
            let snapshot = base.snapshot(store)?;
            let mut entries = Entries::from_ordered(snapshot.version, snapshot.entries);
            for write in self.writes.iter().filter(|w| w.store() == store) {
                write.apply(&mut entries);
            }
            view.copy = Some(StoreCopy {
                base_version: snapshot.version,
                entries,
            });
        }

        view.copy
            .as_mut()
            .map(|copy| &mut copy.entries)
            .ok_or_else(|| GridError::Internal(format!("no copy of store '{}'", store)))
    }

    fn write(&mut self, op: WriteOp) {
        if let Some(view) = self.views.get_mut(op.store()) {
            match (&mut view.copy, &op) {
                (Some(copy), _) => op.apply(&mut copy.entries),
                (None, WriteOp::Upsert { key, value, .. }) => {
                    view.pending.insert(key.clone(), Some(value.clone()));
                }
                (None, WriteOp::Delete { key, .. }) => {
                    view.pending.insert(key.clone(), None);
                }
                (None, WriteOp::Clear { .. }) => {}
            }
        }
        self.writes.push(op);
    }

    fn into_batch(self) -> CommitBatch {
        let mut reads = Vec::new();
        for (store, view) in self.views {
            if let Some(copy) = &view.copy {
                reads.push(ReadCheck::Store {
                    store: store.clone(),
                    version: copy.base_version,
                });
            }
            for (key, value) in view.reads {
                reads.push(ReadCheck::Key {
                    store: store.clone(),
                    key,
                    value,
                });
            }
        }
        CommitBatch {
            reads,
            writes: self.writes,
        }
    }
}

fn ended() -> GridError {
    GridError::Transaction(anyhow::anyhow!("transaction has already ended"))
}

pub(crate) struct Transaction {
    base: Arc<dyn StorageBackend>,
    state: Mutex<Option<TxState>>,
}

impl Transaction {
    pub(crate) fn new(base: Arc<dyn StorageBackend>) -> Self {
        Self {
            base,
            state: Mutex::new(Some(TxState::default())),
        }
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut TxState, &dyn StorageBackend) -> GridResult<R>,
    ) -> GridResult<R> {
        let mut guard = self.state.lock()?;
        let state = guard.as_mut().ok_or_else(ended)?;
        f(state, self.base.as_ref())
    }

    /// Ends the transaction and hands its writes to the backend. A read-only
    /// transaction has nothing to confirm.
    pub(crate) fn commit(&self) -> GridResult<()> {
        let state = self.state.lock()?.take().ok_or_else(ended)?;
        if state.writes.is_empty() {
            return Ok(());
        }
        self.base.commit(state.into_batch())
    }

    /// Ends the transaction without applying anything. Later use fails.
    pub(crate) fn end(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.take();
        }
    }
}

impl StorageBackend for Transaction {
    fn open_store(&self, name: &str, kind: StoreKind) -> GridResult<()> {
        self.base.open_store(name, kind)
    }

    fn get(&self, store: &str, key: &str) -> GridResult<Option<Value>> {
        self.with_state(|state, base| state.value(base, store, key))
    }

    fn put(&self, store: &str, key: &str, value: Value, mode: PutMode) -> GridResult<bool> {
        self.with_state(|state, base| {
            if let Some(existing) = state.value(base, store, key)?
                && (mode == PutMode::InsertOnly || existing == value)
            {
                return Ok(false);
            }
            state.write(WriteOp::Upsert {
                store: store.to_string(),
                key: key.to_string(),
                value,
            });
            Ok(true)
        })
    }

    fn update(
        &self,
        store: &str,
        key: &str,
        f: &mut dyn FnMut(Option<Value>) -> GridResult<Value>,
    ) -> GridResult<bool> {
        self.with_state(|state, base| {
            let value = f(state.value(base, store, key)?)?;
            state.write(WriteOp::Upsert {
                store: store.to_string(),
                key: key.to_string(),
                value,
            });
            Ok(true)
        })
    }

    fn delete(&self, store: &str, key: &str) -> GridResult<bool> {
        self.with_state(|state, base| {
            if state.value(base, store, key)?.is_none() {
                return Ok(false);
            }
            state.write(WriteOp::Delete {
                store: store.to_string(),
                key: key.to_string(),
            });
            Ok(true)
        })
    }

    fn poll(&self, store: &str) -> GridResult<Option<(String, Value)>> {
        self.with_state(|state, base| {
            let popped = state.copy(base, store)?.pop_first();
            if let Some((key, _)) = &popped {
                state.writes.push(WriteOp::Delete {
                    store: store.to_string(),
                    key: key.clone(),
                });
            }
            Ok(popped)
        })
    }

    fn for_each(
        &self,
        store: &str,
        visitor: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> GridResult<bool> {
        let entries = self.with_state(|state, base| Ok(state.copy(base, store)?.to_vec()))?;
        for (key, value) in &entries {
            if !visitor(key, value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn size(&self, store: &str) -> GridResult<usize> {
        self.with_state(|state, base| Ok(state.copy(base, store)?.len()))
    }

    fn clear(&self, store: &str) -> GridResult<()> {
        self.with_state(|state, base| {
            state.copy(base, store)?;
            state.write(WriteOp::Clear {
                store: store.to_string(),
            });
            Ok(())
        })
    }

    fn store_names(&self) -> GridResult<Vec<String>> {
        self.base.store_names()
    }

    fn store_exists(&self, name: &str) -> bool {
        self.base.store_exists(name)
    }

    fn destroy(&self) -> GridResult<()> {
        Err(GridError::Transaction(anyhow::anyhow!(
            "storage cannot be destroyed inside a transaction"
        )))
    }

    fn snapshot(&self, store: &str) -> GridResult<StoreSnapshot> {
        self.with_state(|state, base| {
            let entries = state.copy(base, store)?;
            Ok(StoreSnapshot {
                version: entries.version(),
                entries: entries.to_vec(),
            })
        })
    }

    fn commit(&self, _batch: CommitBatch) -> GridResult<()> {
        Err(GridError::Internal(
            "a transaction commits through the storage that started it".into(),
        ))
    }
}
