//! Single-file [`StateStore`] backend: one JSON document on disk, guarded by
//! process-local mutexes. Leadership is trivial (this process is always the
//! leader); watch callbacks fire only on local writes.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_stream::wrappers::{ReceiverStream, WatchStream};

use super::{LeaseId, StateStore, sites_changed, validate_sites};
use crate::error::StateStoreError;
use crate::model::{Job, StateDocument};

struct NamedLock {
    held: bool,
}

struct Inner {
    document: StateDocument,
    locks: HashMap<String, NamedLock>,
    jobs: VecDeque<Job>,
}

/// A single-file-backed [`StateStore`]. Suitable for a one-node deployment
/// or local development; never participates in leader election beyond
/// trivially holding it.
pub struct SingleFileStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<StateDocument>,
    job_events: broadcast::Sender<Job>,
    next_lease_id: AtomicI64,
    leadership_tx: watch::Sender<bool>,
}

impl SingleFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let document = StateDocument::new();
        let (state_tx, _) = watch::channel(document.clone());
        let (job_events, _) = broadcast::channel(256);
        let (leadership_tx, _) = watch::channel(false);
        Self {
            path: path.into(),
            inner: Mutex::new(Inner {
                document,
                locks: HashMap::new(),
                jobs: VecDeque::new(),
            }),
            state_tx,
            job_events,
            next_lease_id: AtomicI64::new(1),
            leadership_tx,
        }
    }

    async fn write_to_disk(&self, doc: &StateDocument) -> Result<(), StateStoreError> {
        let json = serde_json::to_vec_pretty(doc).map_err(|e| StateStoreError::Serialization {
            reason: e.to_string(),
        })?;
        let tmp_path = self.path.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp_path, &json)
            .await
            .map_err(|e| StateStoreError::Serialization {
                reason: format!("writing temp file: {e}"),
            })?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StateStoreError::Serialization {
                reason: format!("renaming into place: {e}"),
            })?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SingleFileStateStore {
    async fn init(&self) -> Result<(), StateStoreError> {
        if let Ok(bytes) = fs::read(&self.path).await {
            let document: StateDocument =
                serde_json::from_slice(&bytes).map_err(|e| StateStoreError::Serialization {
                    reason: e.to_string(),
                })?;
            self.inner.lock().await.document = document.clone();
            let _ = self.state_tx.send(document);
        } else {
            let doc = self.inner.lock().await.document.clone();
            self.write_to_disk(&doc).await?;
        }
        let _ = self.leadership_tx.send(true);
        Ok(())
    }

    async fn get_state(&self) -> Result<StateDocument, StateStoreError> {
        Ok(self.inner.lock().await.document.clone())
    }

    async fn set_state(&self, mut doc: StateDocument) -> Result<StateDocument, StateStoreError> {
        validate_sites(&doc)?;
        let mut inner = self.inner.lock().await;
        if sites_changed(&inner.document, &doc) {
            doc.version = inner.document.version.saturating_add(1);
        } else {
            doc.version = inner.document.version;
        }
        self.write_to_disk(&doc).await?;
        inner.document = doc.clone();
        drop(inner);
        let _ = self.state_tx.send(doc.clone());
        Ok(doc)
    }

    async fn write_state(&self, doc: &StateDocument) -> Result<(), StateStoreError> {
        self.write_to_disk(doc).await?;
        let mut inner = self.inner.lock().await;
        inner.document = doc.clone();
        drop(inner);
        let _ = self.state_tx.send(doc.clone());
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }

    async fn acquire_lock(&self, name: &str, timeout_enabled: bool) -> Result<LeaseId, StateStoreError> {
        let deadline = timeout_enabled.then(|| {
            tokio::time::Instant::now() + tokio::time::Duration::from_secs(2 * super::LOCK_LEASE_SECS as u64)
        });
        loop {
            {
                let mut inner = self.inner.lock().await;
                let entry = inner
                    .locks
                    .entry(name.to_owned())
                    .or_insert(NamedLock { held: false });
                if !entry.held {
                    entry.held = true;
                    return Ok(self.next_lease_id.fetch_add(1, Ordering::SeqCst));
                }
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(StateStoreError::LockTimeout {
                        name: name.to_owned(),
                    });
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(
                super::LOCK_RETRY_INTERVAL_SECS,
            ))
            .await;
        }
    }

    async fn release_lock(&self, _lease_id: LeaseId) -> Result<(), StateStoreError> {
        // The single-file backend tracks locks by name, not by lease id;
        // release every currently-held lock held by this process. A real
        // multi-lock caller would track name<->lease mappings itself.
        let mut inner = self.inner.lock().await;
        for lock in inner.locks.values_mut() {
            lock.held = false;
        }
        Ok(())
    }

    async fn on_receive(&self) -> Result<watch::Receiver<StateDocument>, StateStoreError> {
        Ok(self.state_tx.subscribe())
    }

    async fn enqueue_job(&self, job: Job) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock().await;
        inner.jobs.push_back(job.clone());
        drop(inner);
        let _ = self.job_events.send(job);
        Ok(())
    }

    async fn watch_jobs(&self) -> Result<ReceiverStream<Job>, StateStoreError> {
        let mut rx = self.job_events.subscribe();
        let (tx, out_rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(job) => {
                        if tx.send(job).await.is_err() {
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

    async fn list_jobs(&self) -> Result<Vec<Job>, StateStoreError> {
        Ok(self.inner.lock().await.jobs.iter().cloned().collect())
    }

    async fn delete_job(&self, id: &str) -> Result<(), StateStoreError> {
        let mut inner = self.inner.lock().await;
        inner.jobs.retain(|j| j.id != id);
        Ok(())
    }

    async fn acquire_leadership(&self) -> Result<WatchStream<bool>, StateStoreError> {
        Ok(WatchStream::new(self.leadership_tx.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_creates_empty_document_on_first_boot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SingleFileStateStore::new(dir.path().join("state.json"));
        store.init().await.unwrap();
        let doc = store.get_state().await.unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.sites.is_empty());
    }

    #[tokio::test]
    async fn set_state_bumps_version_on_site_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = SingleFileStateStore::new(dir.path().join("state.json"));
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
    async fn set_state_rejects_duplicate_domain() {
        let dir = tempfile::tempdir().unwrap();
        let store = SingleFileStateStore::new(dir.path().join("state.json"));
        store.init().await.unwrap();
        let mut doc = store.get_state().await.unwrap();
        doc.sites.push(crate::model::Site {
            domain: "ex.test".into(),
            aliases: vec!["ex.test".into()],
            client_caching: false,
            temporary: false,
            imported_tls_id: None,
            generated_tls_id: None,
            app: None,
        });
        assert!(store.set_state(doc).await.is_err());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = SingleFileStateStore::new(dir.path().join("state.json"));
        store.init().await.unwrap();
        let lease = store.acquire_lock("state", false).await.unwrap();
        let second = tokio::time::timeout(
            tokio::time::Duration::from_millis(50),
            store.acquire_lock("state", false),
        )
        .await;
        assert!(second.is_err(), "second acquire should block while held");
        store.release_lock(lease).await.unwrap();
        let third = store.acquire_lock("state", false).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn state_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = SingleFileStateStore::new(&path);
            store.init().await.unwrap();
            let mut doc = store.get_state().await.unwrap();
            doc.sites.push(crate::model::Site {
                domain: "persisted.test".into(),
                aliases: vec![],
                client_caching: false,
                temporary: false,
                imported_tls_id: None,
                generated_tls_id: None,
                app: None,
            });
            store.set_state(doc).await.unwrap();
        }
        let reloaded = SingleFileStateStore::new(&path);
        reloaded.init().await.unwrap();
        let doc = reloaded.get_state().await.unwrap();
        assert_eq!(doc.sites.len(), 1);
        assert_eq!(doc.sites[0].domain, "persisted.test");
    }
}
