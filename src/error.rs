//! Error types shared across the archive engine.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FramedexError>;

#[derive(Debug, Error)]
pub enum FramedexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("keys out of order: {reason}")]
    OutOfOrder { reason: String },

    #[error("corrupt record in {path}: {reason}", path = .path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("invalid tree trailer in {path}: {reason}", path = .path.display())]
    InvalidTrailer { path: PathBuf, reason: String },

    #[error("invalid archive layout at {path}: {reason}", path = .path.display())]
    InvalidLayout { path: PathBuf, reason: String },

    #[error("archive at {path} is locked for compaction", path = .path.display())]
    Lock { path: PathBuf },

    #[error("operation requires a writable session")]
    ReadOnly,

    #[error("tombstone values cannot be written directly (key {key})")]
    TombstoneWrite { key: String },

    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("invalid entry: {reason}")]
    InvalidEntry { reason: String },

    #[error("query matched too many candidates to evaluate without an index restriction")]
    QueryOverflow,

    #[error("attribute catalog conflict: {reason}")]
    Catalog { reason: String },

    #[error("filesystem surrogate failed on {path}: {reason}", path = .path.display())]
    Surrogate { path: PathBuf, reason: String },

    #[error("scatter sort failed: {reason}")]
    Scatter { reason: String },

    #[error("self check failed: {reason}")]
    SelfCheck { reason: String },

    #[error("unknown index {name}")]
    UnknownIndex { name: String },
}

impl FramedexError {
    pub fn out_of_order(reason: impl Into<String>) -> Self {
        Self::OutOfOrder {
            reason: reason.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    pub fn invalid_entry(reason: impl Into<String>) -> Self {
        Self::InvalidEntry {
            reason: reason.into(),
        }
    }

    pub fn catalog(reason: impl Into<String>) -> Self {
        Self::Catalog {
            reason: reason.into(),
        }
    }

    pub fn layout(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidLayout {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the error signals compaction lock contention.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Lock { .. })
    }
}
