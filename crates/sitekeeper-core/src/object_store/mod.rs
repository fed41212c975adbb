//! The object store abstraction for app bundles: a capability interface
//! (`Get`/`Set`/`List`/`Metadata`/`Delete`) with three backends — local
//! directory, Azure Blob, and S3.

pub mod azure;
pub mod local;
pub mod s3;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::ObjectStoreError;

pub use azure::AzureBlobObjectStore;
pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

/// Metadata key carrying the base64 SHA-256 content hash (32 bytes decoded).
pub const META_HASH: &str = "hash";
/// Metadata key carrying the base64 RSA-PKCS1v15-SHA256 signature (512 bytes decoded).
pub const META_SIGNATURE: &str = "signature";
/// Metadata key carrying the archive format tag.
pub const META_TYPE: &str = "type";

/// Free-form per-object metadata.
pub type Metadata = HashMap<String, String>;

/// A single entry from [`ObjectStore::list`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// A byte stream paired with the object's metadata. Callers must consume or
/// drop `reader` on every exit path — it may hold backend resources open.
pub struct ObjectStream {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub metadata: Metadata,
}

/// A pluggable blob backend for app bundles.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object's content and metadata. `Ok(None)` if absent.
    async fn get(&self, name: &str) -> Result<Option<ObjectStream>, ObjectStoreError>;

    /// List every object currently stored.
    async fn list(&self) -> Result<Vec<FileInfo>, ObjectStoreError>;

    /// Store a new object. Fails with [`ObjectStoreError::FileExists`] if
    /// `name` is already present.
    async fn set(
        &self,
        name: &str,
        reader: Pin<Box<dyn AsyncRead + Send + '_>>,
        metadata: Metadata,
    ) -> Result<(), ObjectStoreError>;

    async fn get_metadata(&self, name: &str) -> Result<Option<Metadata>, ObjectStoreError>;

    async fn set_metadata(&self, name: &str, metadata: Metadata) -> Result<(), ObjectStoreError>;

    /// Delete an object. Fails with [`ObjectStoreError::NotExist`] if
    /// absent.
    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError>;
}

/// Keys under this prefix are reserved for the local backend's metadata
/// sidecar files and must never be used as a bundle name.
pub const METADATA_SIDECAR_PREFIX: &str = ".metadata.";

pub(crate) fn reject_reserved_key(name: &str) -> Result<(), ObjectStoreError> {
    if name.starts_with(METADATA_SIDECAR_PREFIX) {
        return Err(ObjectStoreError::ReservedKey {
            key: name.to_owned(),
        });
    }
    Ok(())
}
