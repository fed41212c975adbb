//! Distributed [`StateStore`] backend: every logical field lives under a key
//! prefix in a [`KvStore`] (etcd, or [`sitekeeper_storage::MemoryKvStore`]
//! for tests). Generic over the backend so the same code path exercises
//! both in unit tests and production.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use sitekeeper_storage::{KvEvent, KvStore, LeaseId as KvLeaseId};
use tokio::sync::{Mutex, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, WatchStream};

use super::{LEADERSHIP_LEASE_SECS, LOCK_LEASE_SECS, LOCK_RETRY_INTERVAL_SECS, LeaseId, StateStore, sites_changed, validate_sites};
use crate::error::StateStoreError;
use crate::model::{Job, StateDocument};

fn state_key(prefix: &str) -> String {
    format!("{prefix}/state")
}

fn lock_key(prefix: &str, name: &str) -> String {
    format!("{prefix}/locks/{name}")
}

fn leader_key(prefix: &str) -> String {
    format!("{prefix}/leader")
}

fn job_key(prefix: &str, id: &str) -> String {
    format!("{prefix}/jobs/{id}")
}

fn jobs_prefix(prefix: &str) -> String {
    format!("{prefix}/jobs/")
}

/// A [`StateStore`] backed by any [`KvStore`] implementation.
pub struct KvStateStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    /// Identifies this process in the `leader` key and lock ownership tags.
    member_id: String,
    state_tx: watch::Sender<StateDocument>,
    leadership_tx: watch::Sender<bool>,
    /// Maps our opaque [`LeaseId`] handles back to the underlying KV lease.
    active_locks: Mutex<std::collections::HashMap<LeaseId, (String, KvLeaseId)>>,
    next_handle: AtomicI64,
}

impl KvStateStore {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, member_id: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(StateDocument::new());
        let (leadership_tx, _) = watch::channel(false);
        Self {
            kv,
            prefix: prefix.into(),
            member_id: member_id.into(),
            state_tx,
            leadership_tx,
            active_locks: Mutex::new(std::collections::HashMap::new()),
            next_handle: AtomicI64::new(1),
        }
    }

    async fn spawn_state_watcher(&self) -> Result<(), StateStoreError> {
        let key = state_key(&self.prefix);
        let mut stream = self
            .kv
            .watch_prefix(&key, 0)
            .await
            .map_err(StateStoreError::Storage)?;
        let tx = self.state_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let KvEvent::Put { value, .. } = event {
                    if let Ok(doc) = serde_json::from_slice::<StateDocument>(&value) {
                        let _ = tx.send(doc);
                    }
                }
            }
        });
        Ok(())
    }

    async fn spawn_leadership_watcher(self: &Arc<Self>) {
        let tx = self.leadership_tx.clone();
        let member_id = self.member_id.clone();
        let kv = Arc::clone(&self.kv);
        let prefix = self.prefix.clone();
        tokio::spawn(async move {
            if let Ok(mut stream) = kv.watch_prefix(&leader_key(&prefix), 0).await {
                while let Some(event) = stream.next().await {
                    match event {
                        KvEvent::Put { value, .. } => {
                            let holds = String::from_utf8(value).ok().as_deref() == Some(member_id.as_str());
                            let _ = tx.send(holds);
                        }
                        KvEvent::Delete { .. } => {
                            let _ = tx.send(false);
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl StateStore for KvStateStore {
    async fn init(&self) -> Result<(), StateStoreError> {
        if self.kv.get(&state_key(&self.prefix)).await?.is_none() {
            let initial = StateDocument::new();
            let json = serde_json::to_vec(&initial).map_err(|e| StateStoreError::Serialization {
                reason: e.to_string(),
            })?;
            let _ = self.kv.put_if_absent(&state_key(&self.prefix), &json).await;
        }
        if let Ok(current) = self.get_state().await {
            let _ = self.state_tx.send(current);
        }
        self.spawn_state_watcher().await?;
        Ok(())
    }

    async fn get_state(&self) -> Result<StateDocument, StateStoreError> {
        let value = self
            .kv
            .get(&state_key(&self.prefix))
            .await?
            .ok_or(StateStoreError::Unavailable)?;
        serde_json::from_slice(&value.value).map_err(|e| StateStoreError::Serialization {
            reason: e.to_string(),
        })
    }

    async fn set_state(&self, mut doc: StateDocument) -> Result<StateDocument, StateStoreError> {
        validate_sites(&doc)?;
        let key = state_key(&self.prefix);
        loop {
            let current = self.kv.get(&key).await?.ok_or(StateStoreError::Unavailable)?;
            let old: StateDocument =
                serde_json::from_slice(&current.value).map_err(|e| StateStoreError::Serialization {
                    reason: e.to_string(),
                })?;
            doc.version = if sites_changed(&old, &doc) {
                old.version.saturating_add(1)
            } else {
                old.version
            };
            let json = serde_json::to_vec(&doc).map_err(|e| StateStoreError::Serialization {
                reason: e.to_string(),
            })?;
            match self.kv.put_cas(&key, &json, current.revision).await {
                Ok(_) => return Ok(doc),
                Err(sitekeeper_storage::StorageError::CasConflict { .. }) => continue,
                Err(e) => return Err(StateStoreError::Storage(e)),
            }
        }
    }

    async fn write_state(&self, doc: &StateDocument) -> Result<(), StateStoreError> {
        let json = serde_json::to_vec(doc).map_err(|e| StateStoreError::Serialization {
            reason: e.to_string(),
        })?;
        self.kv.put(&state_key(&self.prefix), &json).await?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.kv.healthy().await
    }

    async fn acquire_lock(&self, name: &str, timeout_enabled: bool) -> Result<LeaseId, StateStoreError> {
        let deadline = timeout_enabled.then(|| {
            tokio::time::Instant::now() + tokio::time::Duration::from_secs(2 * LOCK_LEASE_SECS as u64)
        });
        let key = lock_key(&self.prefix, name);
        loop {
            let lease = self.kv.lease_grant(LOCK_LEASE_SECS).await?;
            match self
                .kv
                .put_if_absent_with_lease(&key, self.member_id.as_bytes(), lease)
                .await
            {
                Ok(_) => {
                    let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                    self.active_locks
                        .lock()
                        .await
                        .insert(handle, (key, lease));
                    return Ok(handle);
                }
                Err(sitekeeper_storage::StorageError::AlreadyExists { .. }) => {
                    let _ = self.kv.lease_revoke(lease).await;
                }
                Err(e) => return Err(StateStoreError::Storage(e)),
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(StateStoreError::LockTimeout {
                        name: name.to_owned(),
                    });
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(LOCK_RETRY_INTERVAL_SECS)).await;
        }
    }

    async fn release_lock(&self, lease_id: LeaseId) -> Result<(), StateStoreError> {
        let entry = self.active_locks.lock().await.remove(&lease_id);
        if let Some((_, kv_lease)) = entry {
            self.kv.lease_revoke(kv_lease).await?;
        }
        Ok(())
    }

    async fn on_receive(&self) -> Result<watch::Receiver<StateDocument>, StateStoreError> {
        Ok(self.state_tx.subscribe())
    }

    async fn enqueue_job(&self, job: Job) -> Result<(), StateStoreError> {
        let json = serde_json::to_vec(&job).map_err(|e| StateStoreError::Serialization {
            reason: e.to_string(),
        })?;
        self.kv.put(&job_key(&self.prefix, &job.id), &json).await?;
        Ok(())
    }

    async fn watch_jobs(&self) -> Result<ReceiverStream<Job>, StateStoreError> {
        let mut stream = self
            .kv
            .watch_prefix(&jobs_prefix(&self.prefix), 0)
            .await
            .map_err(StateStoreError::Storage)?;
        let (tx, out_rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let KvEvent::Put { value, .. } = event {
                    if let Ok(job) = serde_json::from_slice::<Job>(&value) {
                        if tx.send(job).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(ReceiverStream::new(out_rx))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StateStoreError> {
        let entries = self.kv.list_prefix(&jobs_prefix(&self.prefix)).await?;
        entries
            .into_iter()
            .map(|(_, v)| {
                serde_json::from_slice(&v.value).map_err(|e| StateStoreError::Serialization {
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn delete_job(&self, id: &str) -> Result<(), StateStoreError> {
        self.kv.delete(&job_key(&self.prefix, id)).await?;
        Ok(())
    }

    async fn acquire_leadership(&self) -> Result<WatchStream<bool>, StateStoreError> {
        Ok(WatchStream::new(self.leadership_tx.subscribe()))
    }
}

/// Run the leadership campaign in the background: repeatedly try to grant a
/// lease and claim the `leader` key, keep it alive on success, and retry on
/// loss. Spawned once by the owning binary after `init`.
pub fn spawn_leadership_campaign(store: Arc<KvStateStore>) {
    tokio::spawn(async move {
        store.spawn_leadership_watcher().await;
        loop {
            let lease = match store.kv.lease_grant(LEADERSHIP_LEASE_SECS).await {
                Ok(id) => id,
                Err(_) => {
                    tokio::time::sleep(tokio::time::Duration::from_secs(LOCK_RETRY_INTERVAL_SECS)).await;
                    continue;
                }
            };
            let key = leader_key(&store.prefix);
            match store
                .kv
                .put_if_absent_with_lease(&key, store.member_id.as_bytes(), lease)
                .await
            {
                Ok(_) => {
                    let _ = store.leadership_tx.send(true);
                    loop {
                        tokio::time::sleep(tokio::time::Duration::from_secs(
                            (LEADERSHIP_LEASE_SECS / 3).max(1) as u64,
                        ))
                        .await;
                        if store.kv.lease_keep_alive(lease).await.is_err() {
                            let _ = store.leadership_tx.send(false);
                            break;
                        }
                    }
                }
                Err(_) => {
                    let _ = store.kv.lease_revoke(lease).await;
                    tokio::time::sleep(tokio::time::Duration::from_secs(LOCK_RETRY_INTERVAL_SECS)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekeeper_storage::MemoryKvStore;

    fn store() -> KvStateStore {
        KvStateStore::new(Arc::new(MemoryKvStore::new()), "sitekeeper", "member-a")
    }

    #[tokio::test]
    async fn init_seeds_empty_document() {
        let store = store();
        store.init().await.unwrap();
        let doc = store.get_state().await.unwrap();
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn set_state_uses_cas_and_bumps_version() {
        let store = store();
        store.init().await.unwrap();
        let mut doc = store.get_state().await.unwrap();
        doc.sites.push(crate::model::Site {
            domain: "ex.test".into(),
            aliases: vec![],
            client_caching: false,
            temporary: false,
            imported_tls_id: None,
            generated_tls_id: None,
            app: None,
        });
        let committed = store.set_state(doc).await.unwrap();
        assert_eq!(committed.version, 2);
    }

    #[tokio::test]
    async fn lock_round_trips_through_release() {
        let store = store();
        let lease = store.acquire_lock("state", false).await.unwrap();
        store.release_lock(lease).await.unwrap();
        // different caller can now acquire it
        let lease2 = store.acquire_lock("state", false).await.unwrap();
        store.release_lock(lease2).await.unwrap();
    }

    #[tokio::test]
    async fn job_enqueue_list_delete_round_trip() {
        let store = store();
        let job = Job {
            id: "job-1".into(),
            job_type: crate::model::JobType::DhparamsRegen,
            data: String::new(),
            created_at: chrono::Utc::now(),
        };
        store.enqueue_job(job.clone()).await.unwrap();
        let listed = store.list_jobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        store.delete_job(&job.id).await.unwrap();
        assert!(store.list_jobs().await.unwrap().is_empty());
    }
}
