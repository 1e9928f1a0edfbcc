//! Grid Storage Module
//!
//! Named stores shared by every node of a grid: key/value maps, FIFO queues
//! and sets, plus transactions spanning any of them.
//!
//! ## Core Concepts
//! - **Backend**: `StorageBackend` is the pluggable, untyped contract. Values
//!   travel as JSON. `MemoryStorage` is the bundled in-process backend.
//! - **Typed handles**: `GridMap<T>`, `GridQueue<T>` and `GridSet<T>` wrap a
//!   store name and serialize values with serde.
//! - **Change reporting**: `put`/`add` return `true` only when visible state
//!   changed, `update` always returns `true`, `delete` returns whether a key
//!   was removed.
//! - **Transactions**: the body receives a transactional `GridStorage`.
//!   Handles opened from it buffer their writes, which become visible all at
//!   once on commit and are dropped if the body fails. A commit that finds
//!   data it read changed by someone else reruns the body.

pub mod backend;
mod entries;
pub mod memory;
pub mod store;
mod transaction;

pub use backend::{CommitBatch, PutMode, ReadCheck, StorageBackend, StoreKind, StoreSnapshot, WriteOp};
pub use memory::MemoryStorage;
pub use store::{GridMap, GridQueue, GridSet};

use crate::error::{GridError, GridResult};
use crate::util::wait::Backoff;
use memory::panic_message;
use transaction::Transaction;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Reserved map holding grid-wide string settings.
pub const GLOBALS_STORE: &str = "globals";

/// Times a transaction body runs before a commit conflict is returned.
pub const MAX_COMMIT_ATTEMPTS: u32 = 32;

fn commit_backoff() -> Backoff {
    Backoff::exponential(Duration::from_millis(1), Duration::from_millis(32))
}

/// Ends a transaction when dropped, so storage clones that outlive the body
/// cannot keep writing into it.
struct Ending(Arc<Transaction>);

impl Drop for Ending {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Entry point to the stores of one grid.
#[derive(Clone)]
pub struct GridStorage {
    backend: Arc<dyn StorageBackend>,
    transaction: Option<Arc<Transaction>>,
}

impl GridStorage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            transaction: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    pub fn map<T>(&self, name: &str) -> GridResult<GridMap<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        GridMap::open(self.backend.clone(), name)
    }

    pub fn queue<T>(&self, name: &str) -> GridResult<GridQueue<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        GridQueue::open(self.backend.clone(), name)
    }

    pub fn set<T>(&self, name: &str) -> GridResult<GridSet<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        GridSet::open(self.backend.clone(), name)
    }

    pub fn globals(&self) -> GridResult<GridMap<String>> {
        self.map(GLOBALS_STORE)
    }

    pub fn store_names(&self) -> GridResult<Vec<String>> {
        self.backend.store_names()
    }

    pub fn store_exists(&self, name: &str) -> bool {
        self.backend.store_exists(name)
    }

    pub fn destroy(&self) -> GridResult<()> {
        self.backend.destroy()
    }

    /// Whether handles opened from this storage write into a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn begin(&self) -> (GridStorage, Ending) {
        let transaction = Arc::new(Transaction::new(self.backend.clone()));
        let storage = GridStorage {
            backend: transaction.clone(),
            transaction: Some(transaction.clone()),
        };
        (storage, Ending(transaction))
    }

    /// Runs `body` as one transaction and returns its value.
    ///
    /// Only handles opened from the storage passed to `body` take part in the
    /// transaction. A body error (or panic) discards every buffered write and
    /// is returned as `GridError::Transaction`. When the commit finds that
    /// data the body read was changed meanwhile, the body runs again, up to
    /// [`MAX_COMMIT_ATTEMPTS`] times before `GridError::Conflict` is returned.
    ///
    /// Called on a transactional storage, `body` joins that transaction.
    pub fn run_in_transaction<R, F>(&self, mut body: F) -> GridResult<R>
    where
        F: FnMut(&GridStorage) -> anyhow::Result<R>,
    {
        if self.in_transaction() {
            return body(self).map_err(GridError::Transaction);
        }

        let mut backoff = commit_backoff();
        let mut attempt = 1;
        loop {
            let (storage, ending) = self.begin();
            let value = match std::panic::catch_unwind(AssertUnwindSafe(|| body(&storage))) {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => return Err(GridError::Transaction(e)),
                Err(panic) => {
                    return Err(GridError::Transaction(anyhow::anyhow!(
                        "transaction body panicked: {}",
                        panic_message(panic.as_ref())
                    )));
                }
            };

            match ending.0.commit() {
                Err(GridError::Conflict(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!("Transaction attempt {} conflicted: {}", attempt, reason);
                    attempt += 1;
                    std::thread::sleep(backoff.next_delay());
                }
                outcome => return outcome.map(|()| value),
            }
        }
    }

    /// Async form of [`run_in_transaction`](Self::run_in_transaction). The
    /// transactional storage is owned by the body's future, so it may be
    /// cloned into spawned work that finishes before the body does.
    pub async fn run_in_transaction_async<R, F, Fut>(&self, mut body: F) -> GridResult<R>
    where
        F: FnMut(GridStorage) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        if self.in_transaction() {
            return body(self.clone()).await.map_err(GridError::Transaction);
        }

        let mut backoff = commit_backoff();
        let mut attempt = 1;
        loop {
            let (storage, ending) = self.begin();
            let value = body(storage).await.map_err(GridError::Transaction)?;

            match ending.0.commit() {
                Err(GridError::Conflict(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!("Transaction attempt {} conflicted: {}", attempt, reason);
                    attempt += 1;
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                outcome => return outcome.map(|()| value),
            }
        }
    }
}
