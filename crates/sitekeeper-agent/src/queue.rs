//! The sync queueing contract: at most one sync running, at most one
//! queued behind it. Modeled as the design notes prescribe — an explicit
//! `{Idle, Running, RunningWithQueued}` state machine built from a
//! single-slot channel plus a single-slot semaphore, rather than hand-rolled
//! atomics — the same shape the teacher uses for its lease-renewal
//! single-flight guard in `zvault-core::lease`.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

/// Coordinates `QueueRun`/`Run` against a single underlying sync function.
pub struct SyncQueue {
    pending_tx: mpsc::Sender<()>,
    pending_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    running: Arc<Semaphore>,
}

impl SyncQueue {
    #[must_use]
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(1);
        Self {
            pending_tx,
            pending_rx: tokio::sync::Mutex::new(pending_rx),
            running: Arc::new(Semaphore::new(1)),
        }
    }

    /// Non-blocking: drops the request if one is already queued. Spawns the
    /// sync on a background task once the running slot is free.
    pub fn queue_run<F, Fut>(self: &Arc<Self>, sync: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        if self.pending_tx.try_send(()).is_err() {
            info!("sync already queued, collapsing into the pending run");
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(permit) = queue.running.clone().acquire_owned().await else {
                return;
            };
            {
                let mut rx = queue.pending_rx.lock().await;
                let _ = rx.try_recv();
            }
            if let Err(e) = sync().await {
                warn!(error = %e, "queued sync failed");
            }
            drop(permit);
        });
    }

    /// Blocking variant used at startup: runs synchronously and returns the
    /// sync's own error.
    pub async fn run<F, Fut>(&self, sync: F) -> Result<(), anyhow::Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
    {
        let _permit = self.running.acquire().await?;
        sync().await
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn queue_run_collapses_rapid_calls() {
        let queue = Arc::new(SyncQueue::new());
        let count = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        // Occupy the running permit directly, simulating a sync already in
        // flight, so the calls below all land in the queueing path.
        let permit = queue.running.clone().acquire_owned().await.unwrap();
        let release_clone = Arc::clone(&release);
        tokio::spawn(async move {
            release_clone.notified().await;
            drop(permit);
        });

        for _ in 0..5 {
            let c = Arc::clone(&count);
            queue.queue_run(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tokio::task::yield_now().await;

        release.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Exactly one collapsed follow-up run, not five.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
