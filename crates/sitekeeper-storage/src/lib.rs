//! Pluggable key-value storage primitives for the sitekeeper state store.
//!
//! [`KvStore`] is the distributed-backend abstraction: revisioned gets and
//! puts, compare-and-set, leases, and prefix watches. [`MemoryKvStore`] is an
//! in-process implementation for tests and single-binary demos;
//! [`EtcdKvStore`] is the production backend a multi-node controller runs
//! against.

pub mod error;
pub mod etcd;
pub mod kv;
pub mod memory;

pub use error::StorageError;
pub use etcd::EtcdKvStore;
pub use kv::{KvEvent, KvStore, LeaseId, VersionedValue};
pub use memory::MemoryKvStore;
