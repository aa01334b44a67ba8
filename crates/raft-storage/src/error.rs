//! # error
//!
//! why: give every storage operation one result type with a meaningful kind
//! relations: returned by log, stable and snapshot stores and the registry
//! what: StorageError enum, Result alias

use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Persisted state is unreadable or inconsistent; the owner must not start.
    #[error("Corrupted storage: {reason}")]
    Corruption { reason: String },

    /// I/O error from the backing medium.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// The caller broke an operation's precondition.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A snapshot writer is already open on this store.
    #[error("Snapshot writer already open at {path}")]
    WriterBusy { path: String },

    /// The backend does not implement an optional capability.
    #[error("{backend} doesn't support {capability}")]
    Unsupported {
        backend: &'static str,
        capability: &'static str,
    },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    #[error("Malformed uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// No prototype is registered for the uri's scheme.
    #[error("No storage registered for scheme `{scheme}`")]
    UnknownScheme { scheme: String },

    /// A snapshot copy job terminated with an error.
    #[error("Snapshot copy failed: {reason}")]
    CopyFailed { reason: String },

    #[error("Snapshot copy cancelled")]
    Cancelled,
}

impl StorageError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// True for errors that mean persisted state cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, StorageError>;
