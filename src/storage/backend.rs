use super::entries::Entries;
use crate::error::GridResult;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three store shapes a backend knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    Map,
    Queue,
    Set,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Map => "map",
            StoreKind::Queue => "queue",
            StoreKind::Set => "set",
        }
    }
}

/// How `put` treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Replace the value if it differs. Position is kept.
    Upsert,
    /// Leave an existing key untouched.
    InsertOnly,
}

/// Untyped storage contract. Values travel as JSON; the typed handles in
/// [`super::store`] do the (de)serialization.
///
/// Entries of a store are kept in insertion order. Closures passed to
/// `update` must not touch storage; visitors passed to `for_each` may.
///
/// Transactions are built on top of `snapshot` and `commit`: a transaction
/// buffers its writes and commits them together with what it read.
pub trait StorageBackend: Send + Sync {
    /// Creates the store if missing. Opening an existing name as another kind fails.
    fn open_store(&self, name: &str, kind: StoreKind) -> GridResult<()>;

    fn get(&self, store: &str, key: &str) -> GridResult<Option<Value>>;

    /// Returns `true` when visible state changed.
    fn put(&self, store: &str, key: &str, value: Value, mode: PutMode) -> GridResult<bool>;

    /// Applies `f` to the current value (if any) and stores its output.
    fn update(
        &self,
        store: &str,
        key: &str,
        f: &mut dyn FnMut(Option<Value>) -> GridResult<Value>,
    ) -> GridResult<bool>;

    fn delete(&self, store: &str, key: &str) -> GridResult<bool>;

    /// Removes and returns the oldest entry.
    fn poll(&self, store: &str) -> GridResult<Option<(String, Value)>>;

    /// Visits entries in insertion order until the visitor returns `false`.
    /// Returns `false` if iteration was stopped early.
    fn for_each(&self, store: &str, visitor: &mut dyn FnMut(&str, &Value) -> bool)
    -> GridResult<bool>;

    fn size(&self, store: &str) -> GridResult<usize>;

    fn clear(&self, store: &str) -> GridResult<()>;

    fn store_names(&self) -> GridResult<Vec<String>>;

    fn store_exists(&self, name: &str) -> bool;

    /// Drops every store.
    fn destroy(&self) -> GridResult<()>;

    /// Current entries of a store together with its mutation counter, read
    /// as one step.
    fn snapshot(&self, store: &str) -> GridResult<StoreSnapshot>;

    /// Checks every read of `batch` against the current state and, if none
    /// changed, applies its writes as one step. Fails with
    /// `GridError::Conflict` otherwise, leaving the stores untouched.
    fn commit(&self, batch: CommitBatch) -> GridResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub version: u64,
    pub entries: Vec<(String, Value)>,
}

/// Something a transaction observed, to be confirmed at commit.
#[derive(Debug, Clone)]
pub enum ReadCheck {
    /// The committed value of one key.
    Key {
        store: String,
        key: String,
        value: Option<Value>,
    },
    /// The mutation counter of a whole store.
    Store { store: String, version: u64 },
}

impl ReadCheck {
    pub fn store(&self) -> &str {
        match self {
            ReadCheck::Key { store, .. } | ReadCheck::Store { store, .. } => store,
        }
    }
}

/// A buffered transaction write, replayed in order at commit.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Replaces an existing value in place or appends a new key.
    Upsert {
        store: String,
        key: String,
        value: Value,
    },
    Delete { store: String, key: String },
    Clear { store: String },
}

impl WriteOp {
    pub fn store(&self) -> &str {
        match self {
            WriteOp::Upsert { store, .. } | WriteOp::Delete { store, .. } | WriteOp::Clear { store } => {
                store
            }
        }
    }

    pub(crate) fn apply(&self, entries: &mut Entries) {
        match self {
            WriteOp::Upsert { key, value, .. } => entries.upsert(key, value.clone()),
            WriteOp::Delete { key, .. } => {
                entries.remove(key);
            }
            WriteOp::Clear { .. } => entries.clear(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub reads: Vec<ReadCheck>,
    pub writes: Vec<WriteOp>,
}
