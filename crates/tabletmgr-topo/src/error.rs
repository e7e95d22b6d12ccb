//! Error types for the topology subsystem.

use thiserror::Error;

/// Errors returned by the coordination store and the typed topology layer.
#[derive(Debug, Error)]
pub enum TopoError {
    /// The node does not exist.
    #[error("node not found: {path}")]
    NotFound {
        /// Path that was looked up.
        path: String,
    },

    /// The node already exists.
    #[error("node already exists: {path}")]
    NodeExists {
        /// Path that was being created.
        path: String,
    },

    /// Compare-and-set failed because the node changed underneath the caller.
    #[error("bad version for {path}: expected {expected}, found {found}")]
    BadVersion {
        /// Path being updated.
        path: String,
        /// Version the caller expected.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// The node still has children.
    #[error("node not empty: {path}")]
    NotEmpty {
        /// Path being deleted.
        path: String,
    },

    /// The store cannot be reached (network partition, closed connection).
    #[error("coordination store unreachable: {msg}")]
    Unreachable {
        /// Description of the failure.
        msg: String,
    },

    /// A bounded wait (lock acquisition, watch) ran out of time.
    #[error("deadline exceeded: {what}")]
    DeadlineExceeded {
        /// What was being waited on.
        what: String,
    },

    /// The client session was closed; ephemeral state is gone.
    #[error("session closed")]
    NoSession,

    /// The caller passed something that cannot be a valid path or record.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored record failed to encode or decode.
    #[error("codec error for {path}: {msg}")]
    Codec {
        /// Path of the record.
        path: String,
        /// Underlying error text.
        msg: String,
    },

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TopoError {
    /// Returns true when the error means "the node is not there".
    pub fn is_not_found(&self) -> bool {
        matches!(self, TopoError::NotFound { .. })
    }

    /// Returns true when the store itself could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TopoError::Unreachable { .. })
    }

    pub(crate) fn not_found(path: &str) -> Self {
        TopoError::NotFound {
            path: path.to_string(),
        }
    }

    pub(crate) fn codec(path: &str, err: impl std::fmt::Display) -> Self {
        TopoError::Codec {
            path: path.to_string(),
            msg: err.to_string(),
        }
    }
}
