//! In-memory [`KvStore`] — a test double for the etcd-backed distributed
//! state store. Not durable; every revision, lease, and value lives in a
//! single process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::StorageError;
use crate::kv::{KvEvent, KvStore, LeaseId, VersionedValue};

struct Entry {
    value: Vec<u8>,
    revision: i64,
    lease: Option<LeaseId>,
}

struct Lease {
    expires_at: Instant,
    ttl: Duration,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: BTreeMap<LeaseId, Lease>,
    next_revision: i64,
    next_lease_id: i64,
}

/// An in-memory, single-process [`KvStore`].
///
/// # Examples
///
/// ```
/// # use sitekeeper_storage::MemoryKvStore;
/// let store = MemoryKvStore::new();
/// ```
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<KvEvent>,
    healthy: std::sync::atomic::AtomicBool,
    watch_seq: AtomicI64,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                leases: BTreeMap::new(),
                next_revision: 1,
                next_lease_id: 1,
            }),
            events,
            healthy: std::sync::atomic::AtomicBool::new(true),
            watch_seq: AtomicI64::new(0),
        }
    }

    /// Force the backend to report unhealthy, simulating connectivity loss.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    async fn expire_leases(inner: &mut Inner) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut removed_keys = Vec::new();
        for lease_id in expired {
            inner.leases.remove(&lease_id);
            let dead: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.lease == Some(lease_id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead {
                inner.entries.remove(&key);
                removed_keys.push(key);
            }
        }
        removed_keys
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StorageError> {
        let mut inner = self.inner.lock().await;
        Self::expire_leases(&mut inner).await;
        Ok(inner.entries.get(key).map(|e| VersionedValue {
            value: e.value.clone(),
            revision: e.revision,
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StorageError> {
        let mut inner = self.inner.lock().await;
        Self::expire_leases(&mut inner).await;
        Ok(inner
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| {
                (
                    k.clone(),
                    VersionedValue {
                        value: e.value.clone(),
                        revision: e.revision,
                    },
                )
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        let revision = inner.next_revision;
        inner.next_revision = inner.next_revision.saturating_add(1);
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                revision,
                lease: None,
            },
        );
        let _ = self.events.send(KvEvent::Put {
            key: key.to_owned(),
            value: value.to_vec(),
            revision,
        });
        Ok(revision)
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        Self::expire_leases(&mut inner).await;
        if inner.entries.contains_key(key) {
            return Err(StorageError::AlreadyExists {
                key: key.to_owned(),
            });
        }
        let revision = inner.next_revision;
        inner.next_revision = inner.next_revision.saturating_add(1);
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                revision,
                lease: None,
            },
        );
        let _ = self.events.send(KvEvent::Put {
            key: key.to_owned(),
            value: value.to_vec(),
            revision,
        });
        Ok(revision)
    }

    async fn put_cas(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        let actual = inner.entries.get(key).map_or(0, |e| e.revision);
        if actual != expected_revision {
            return Err(StorageError::CasConflict {
                key: key.to_owned(),
                expected: expected_revision,
                actual,
            });
        }
        let revision = inner.next_revision;
        inner.next_revision = inner.next_revision.saturating_add(1);
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                revision,
                lease: None,
            },
        );
        let _ = self.events.send(KvEvent::Put {
            key: key.to_owned(),
            value: value.to_vec(),
            revision,
        });
        Ok(revision)
    }

    async fn put_if_absent_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease_id: LeaseId,
    ) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        Self::expire_leases(&mut inner).await;
        if inner.entries.contains_key(key) {
            return Err(StorageError::AlreadyExists {
                key: key.to_owned(),
            });
        }
        if !inner.leases.contains_key(&lease_id) {
            return Err(StorageError::LeaseNotFound { lease_id });
        }
        let revision = inner.next_revision;
        inner.next_revision = inner.next_revision.saturating_add(1);
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                revision,
                lease: Some(lease_id),
            },
        );
        let _ = self.events.send(KvEvent::Put {
            key: key.to_owned(),
            value: value.to_vec(),
            revision,
        });
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(key).is_some() {
            let revision = inner.next_revision;
            inner.next_revision = inner.next_revision.saturating_add(1);
            let _ = self.events.send(KvEvent::Delete {
                key: key.to_owned(),
                revision,
            });
        }
        Ok(())
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId, StorageError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_lease_id;
        inner.next_lease_id = inner.next_lease_id.saturating_add(1);
        let ttl = Duration::from_secs(ttl_secs.max(1).unsigned_abs());
        inner.leases.insert(
            id,
            Lease {
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease_id: LeaseId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let ttl = inner
            .leases
            .get(&lease_id)
            .map(|l| l.ttl)
            .ok_or(StorageError::LeaseNotFound { lease_id })?;
        if let Some(lease) = inner.leases.get_mut(&lease_id) {
            lease.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.leases.remove(&lease_id);
        let dead: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.lease == Some(lease_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            inner.entries.remove(&key);
        }
        Ok(())
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease_id: LeaseId,
    ) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        if !inner.leases.contains_key(&lease_id) {
            return Err(StorageError::LeaseNotFound { lease_id });
        }
        let revision = inner.next_revision;
        inner.next_revision = inner.next_revision.saturating_add(1);
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                revision,
                lease: Some(lease_id),
            },
        );
        let _ = self.events.send(KvEvent::Put {
            key: key.to_owned(),
            value: value.to_vec(),
            revision,
        });
        Ok(revision)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        _start_revision: i64,
    ) -> Result<ReceiverStream<KvEvent>, StorageError> {
        let mut rx = self.events.subscribe();
        let (tx, out_rx) = tokio::sync::mpsc::channel(256);
        let prefix = prefix.to_owned();
        let id = self.watch_seq.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(watch_id = id, prefix = %prefix, "memory kv watch started");
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let key = match &event {
                            KvEvent::Put { key, .. } | KvEvent::Delete { key, .. } => key,
                        };
                        if key.starts_with(&prefix) && tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(ReceiverStream::new(out_rx))
    }

    async fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = MemoryKvStore::new();
        let rev = store.put("a", b"1").await.unwrap();
        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, b"1");
        assert_eq!(got.revision, rev);
    }

    #[tokio::test]
    async fn put_if_absent_rejects_existing() {
        let store = MemoryKvStore::new();
        store.put_if_absent("locks/a", b"owner").await.unwrap();
        let err = store.put_if_absent("locks/a", b"other").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn cas_rejects_stale_revision() {
        let store = MemoryKvStore::new();
        let rev = store.put("state", b"v1").await.unwrap();
        store.put_cas("state", b"v2", rev).await.unwrap();
        let err = store.put_cas("state", b"v3", rev).await.unwrap_err();
        assert!(matches!(err, StorageError::CasConflict { .. }));
    }

    #[tokio::test]
    async fn lease_revocation_removes_bound_keys() {
        let store = MemoryKvStore::new();
        let lease = store.lease_grant(30).await.unwrap();
        store.put_with_lease("nodes/1", b"agent-1", lease).await.unwrap();
        assert!(store.get("nodes/1").await.unwrap().is_some());
        store.lease_revoke(lease).await.unwrap();
        assert!(store.get("nodes/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_prefix_only_returns_matching_keys() {
        let store = MemoryKvStore::new();
        store.put("jobs/1", b"a").await.unwrap();
        store.put("jobs/2", b"b").await.unwrap();
        store.put("locks/state", b"c").await.unwrap();
        let jobs = store.list_prefix("jobs/").await.unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn watch_prefix_observes_puts() {
        let store = Arc::new(MemoryKvStore::new());
        let mut stream = store.watch_prefix("state", 0).await.unwrap();
        store.put("state", b"v1").await.unwrap();
        use tokio_stream::StreamExt;
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, KvEvent::Put { .. }));
    }
}
