//! Library-level error type.
//!
//! Task bodies and the binary work with `anyhow`; everything crossing a grid
//! seam (storage, transport, coordination) reports a `GridError`.

use thiserror::Error;

pub type GridResult<T> = std::result::Result<T, GridError>;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    Poisoned(String),

    #[error("store '{name}' already exists as a {existing}, cannot open it as a {requested}")]
    StoreKind {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("transaction failed: {0}")]
    Transaction(anyhow::Error),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Expired(String),

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown task kind: {0}")]
    UnknownTask(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl<T> From<std::sync::PoisonError<T>> for GridError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GridError::Poisoned(err.to_string())
    }
}
