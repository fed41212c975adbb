//! Error taxonomy for `sitekeeper-core`.
//!
//! Each subsystem gets its own enum; cross-subsystem errors compose via
//! `#[from]` rather than a single flat error type, matching the way the
//! underlying storage crate separates its own [`sitekeeper_storage::StorageError`].

use sitekeeper_storage::StorageError;

/// Errors from AES-GCM-128 secrets encryption/decryption.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    #[error("secretsEncryptionKey must decode to exactly 16 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    #[error("secretsEncryptionKey is not valid base64: {reason}")]
    InvalidKeyEncoding { reason: String },
}

/// Errors from the state store (single-file or distributed KV backend).
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state store backend is unreachable")]
    Unavailable,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("could not obtain lock {name} within timeout")]
    LockTimeout { name: String },

    #[error("lock {name} is already held")]
    LockHeld { name: String },

    #[error("no such lock held: {lease_id}")]
    NoSuchLock { lease_id: i64 },

    #[error("optimistic concurrency conflict: state changed underneath the write")]
    ConcurrencyConflict,

    #[error("domain or alias already exists: {value}")]
    DuplicateDomain { value: String },

    #[error("'_default' is a reserved domain name")]
    ReservedDomain,

    #[error("site not found: {domain}")]
    SiteNotFound { domain: String },

    #[error("serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("job not found: {id}")]
    JobNotFound { id: String },
}

/// Errors from the object store abstraction.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("key already exists: {key}")]
    FileExists { key: String },

    #[error("key does not exist: {key}")]
    NotExist { key: String },

    #[error("key {key} is reserved for metadata sidecars")]
    ReservedKey { key: String },

    #[error("backend I/O error: {reason}")]
    Io { reason: String },

    #[error("backend error: {reason}")]
    Backend { reason: String },
}

/// Errors from the certificates service.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate not found: {id}")]
    NotFound { id: String },

    #[error("certificate {id} is still referenced by at least one site")]
    StillReferenced { id: String },

    #[error("certificate {id} is of type {actual:?}, expected IMPORTED or not present for this operation")]
    WrongType { id: String, actual: String },

    #[error("invalid certificate data for {id}: {reason}")]
    InvalidData { id: String, reason: String },

    #[error("certificate generation failed: {reason}")]
    Generation { reason: String },

    #[error("azure key vault lookup failed for {name}: {reason}")]
    KeyVault { name: String, reason: String },

    #[error("acme error: {reason}")]
    Acme { reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

/// Errors surfaced on the controller<->agent gRPC channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("node {node_id} is not registered")]
    NotRegistered { node_id: String },

    #[error("registration rejected: {reason}")]
    RegistrationRejected { reason: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Errors from the agent reconciliation engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to initialize app root at {path}: {reason}")]
    InitAppRoot { path: String, reason: String },

    #[error("failed to stage bundle {bundle}: {reason}")]
    StageApp { bundle: String, reason: String },

    #[error("bundle {bundle} failed hash verification")]
    HashMismatch { bundle: String },

    #[error("bundle {bundle} failed signature verification")]
    SignatureMismatch { bundle: String },

    #[error("bundle {bundle} has no signature but code signing is required")]
    MissingSignature { bundle: String },

    #[error("unsupported archive format: {format}")]
    UnsupportedArchive { format: String },

    #[error("archive entry {entry} escapes the extraction root")]
    ZipSlip { entry: String },

    #[error("proxy configuration test failed for {domain}: {reason}")]
    ProxyConfigInvalid { domain: String, reason: String },

    #[error("proxy reload failed: {reason}")]
    ProxyReload { reason: String },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Errors from the persistent job queue.
#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job {id} not found")]
    NotFound { id: String },

    #[error("serialization failed: {reason}")]
    Serialization { reason: String },
}
