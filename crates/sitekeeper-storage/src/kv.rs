//! The [`KvStore`] trait: the distributed-backend primitives the state store
//! builds on — revisioned gets/puts, compare-and-set, prefix watch, and
//! lease-bound keys. A single-file deployment never needs this trait; it is
//! implemented only by backends that can offer real CAS and watch semantics
//! (today, [`crate::EtcdKvStore`] and, for tests, [`crate::MemoryKvStore`]).

use async_trait::async_trait;

use crate::error::StorageError;

/// A lease identifier returned by [`KvStore::lease_grant`].
pub type LeaseId = i64;

/// A stored value together with the backend's revision at the time of read.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub revision: i64,
}

/// A change observed on a watched prefix.
#[derive(Debug, Clone)]
pub enum KvEvent {
    Put {
        key: String,
        value: Vec<u8>,
        revision: i64,
    },
    Delete {
        key: String,
        revision: i64,
    },
}

/// Distributed key-value primitives with lease and compare-and-set support.
///
/// Keys are opaque UTF-8 strings namespaced by the caller (the state store
/// uses prefixes like `state`, `locks/`, `nodes/`, `leader`, `jobs/`,
/// `secrets/`, `certificates/`, `dhparams`).
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Fetch a single key along with its revision.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StorageError>;

    /// List all keys under a prefix, each with its value and revision.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StorageError>;

    /// Unconditional put. Returns the new revision.
    async fn put(&self, key: &str, value: &[u8]) -> Result<i64, StorageError>;

    /// Put only if `key` is currently absent (CAS on "create revision == 0").
    ///
    /// Used for lock and leadership acquisition, where exactly one writer
    /// must win.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<i64, StorageError>;

    /// Put only if the key's current revision equals `expected_revision`.
    ///
    /// Used so that writing an unchanged value does not create a new
    /// revision (the state document write path).
    async fn put_cas(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: i64,
    ) -> Result<i64, StorageError>;

    /// Put only if `key` is currently absent, binding it to `lease_id` in
    /// the same atomic operation. Used for locks and leadership, where the
    /// winner's claim must expire automatically if it stops renewing the
    /// lease.
    async fn put_if_absent_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease_id: LeaseId,
    ) -> Result<i64, StorageError>;

    /// Delete a key unconditionally. No error if absent.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Grant a lease with the given TTL, in seconds.
    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId, StorageError>;

    /// Keep a lease alive for another full TTL window.
    async fn lease_keep_alive(&self, lease_id: LeaseId) -> Result<(), StorageError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StorageError>;

    /// Put a key bound to a lease; the key disappears when the lease expires
    /// or is revoked.
    async fn put_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease_id: LeaseId,
    ) -> Result<i64, StorageError>;

    /// Subscribe to changes under a prefix starting after `start_revision`
    /// (0 to receive everything from the current state onward).
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<tokio_stream::wrappers::ReceiverStream<KvEvent>, StorageError>;

    /// Whether the backend currently answers requests.
    async fn healthy(&self) -> bool;
}
