//! Storage-layer error taxonomy.

/// Errors surfaced by [`crate::KvStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key {key} already exists")]
    AlreadyExists { key: String },

    #[error("compare-and-set on {key} failed: expected revision {expected}, found {actual}")]
    CasConflict { key: String, expected: i64, actual: i64 },

    #[error("key {key} not found")]
    NotFound { key: String },

    #[error("lease {lease_id} not found or expired")]
    LeaseNotFound { lease_id: i64 },

    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {reason}")]
    Serialization { reason: String },
}
