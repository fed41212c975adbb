//! The state store: leader election, optimistic concurrency, change
//! notification, and a persistent job queue, behind one trait with two
//! backends ([`single_file`] and [`kv_backed`]).

pub mod kv_backed;
pub mod single_file;

use async_trait::async_trait;
use tokio_stream::wrappers::{ReceiverStream, WatchStream};

use crate::error::StateStoreError;
use crate::model::{Job, StateDocument};

pub use kv_backed::KvStateStore;
pub use single_file::SingleFileStateStore;

/// Duration, in seconds, a lock lease is granted for. Matches the spec's
/// "fixed duration (≈20 s)".
pub const LOCK_LEASE_SECS: i64 = 20;

/// Duration, in seconds, a leadership lease is granted for. Matches the
/// spec's "≈30 s".
pub const LEADERSHIP_LEASE_SECS: i64 = 30;

/// Interval between lock-acquisition retries while contended.
pub const LOCK_RETRY_INTERVAL_SECS: u64 = 1;

/// An opaque handle returned by [`StateStore::acquire_lock`], passed back to
/// [`StateStore::release_lock`].
pub type LeaseId = i64;

/// The name of the lock guarding all state document mutations.
pub const STATE_LOCK: &str = "state";

/// Pluggable backend for the desired-state document, node registrations,
/// locks, leadership, and the job queue. Both concrete implementations
/// ([`SingleFileStateStore`], [`KvStateStore`]) honor the identical
/// contract described here.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Prepare the backend for use (create the file / verify connectivity).
    async fn init(&self) -> Result<(), StateStoreError>;

    /// The latest committed document.
    async fn get_state(&self) -> Result<StateDocument, StateStoreError>;

    /// Validate and commit a full document under the `"state"` lock,
    /// bumping `Version` only if a site field changed relative to the
    /// previous document (pure certificate-only changes leave `Version`
    /// untouched — see `Certificates::set_certificate`/`delete_certificate`,
    /// which call [`StateStore::write_state`] directly instead).
    async fn set_state(&self, doc: StateDocument) -> Result<StateDocument, StateStoreError>;

    /// Commit a full document unconditionally — the low-level primitive
    /// `set_state` and the certificates service build on. Does not perform
    /// site-invariant validation or decide whether to bump `Version`; the
    /// caller is responsible for both.
    async fn write_state(&self, doc: &StateDocument) -> Result<(), StateStoreError>;

    /// Whether the backend currently answers requests.
    async fn healthy(&self) -> bool;

    /// Acquire a named lock. With `timeout_enabled`, aborts after
    /// `2 * LOCK_LEASE_SECS` with [`StateStoreError::LockTimeout`].
    async fn acquire_lock(&self, name: &str, timeout_enabled: bool) -> Result<LeaseId, StateStoreError>;

    /// Release a previously acquired lock.
    async fn release_lock(&self, lease_id: LeaseId) -> Result<(), StateStoreError>;

    /// Subscribe to state document updates. "Latest wins": subscribers see
    /// only the newest value, never a backlog.
    async fn on_receive(&self) -> Result<tokio::sync::watch::Receiver<StateDocument>, StateStoreError>;

    /// Push a job onto the persistent queue.
    async fn enqueue_job(&self, job: Job) -> Result<(), StateStoreError>;

    /// Stream newly created jobs. Only the current leader should consume
    /// this; `last_seen_revision` is re-seeded from a full list on each
    /// leadership acquisition by the caller.
    async fn watch_jobs(&self) -> Result<ReceiverStream<Job>, StateStoreError>;

    /// List jobs currently queued (used to re-seed a freshly elected
    /// leader's processing loop).
    async fn list_jobs(&self) -> Result<Vec<Job>, StateStoreError>;

    /// Remove a completed job.
    async fn delete_job(&self, id: &str) -> Result<(), StateStoreError>;

    /// Contend for leadership. Emits `true` on acquisition, `false` on
    /// loss; the single-file backend emits `true` once and never again.
    async fn acquire_leadership(&self) -> Result<WatchStream<bool>, StateStoreError>;
}

/// Returns true if `new` differs from `old` in a way that should bump
/// `Version` — i.e. anything beyond the certificate/secrets/dhparams maps.
#[must_use]
pub fn sites_changed(old: &StateDocument, new: &StateDocument) -> bool {
    old.sites.len() != new.sites.len()
        || old
            .sites
            .iter()
            .zip(new.sites.iter())
            .any(|(a, b)| !sites_equal(a, b))
}

fn sites_equal(a: &crate::model::Site, b: &crate::model::Site) -> bool {
    a.domain == b.domain
        && a.aliases == b.aliases
        && a.client_caching == b.client_caching
        && a.temporary == b.temporary
        && a.imported_tls_id == b.imported_tls_id
        && a.generated_tls_id == b.generated_tls_id
        && a.app.as_ref().map(|x| &x.name) == b.app.as_ref().map(|x| &x.name)
}

/// Validate the cross-site invariants: no site names `_default`, and every
/// domain/alias is globally unique.
pub fn validate_sites(doc: &StateDocument) -> Result<(), StateStoreError> {
    use std::collections::HashSet;

    let mut seen: HashSet<&str> = HashSet::new();
    for site in &doc.sites {
        for name in site.all_names() {
            if name == crate::model::DEFAULT_DOMAIN {
                return Err(StateStoreError::ReservedDomain);
            }
            if !seen.insert(name) {
                return Err(StateStoreError::DuplicateDomain {
                    value: name.to_owned(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Site;

    fn site(domain: &str, aliases: &[&str]) -> Site {
        Site {
            domain: domain.to_owned(),
            aliases: aliases.iter().map(|s| (*s).to_owned()).collect(),
            client_caching: false,
            temporary: false,
            imported_tls_id: None,
            generated_tls_id: None,
            app: None,
        }
    }

    #[test]
    fn validate_sites_rejects_default_domain() {
        let mut doc = StateDocument::new();
        doc.sites.push(site("_default", &[]));
        assert!(matches!(
            validate_sites(&doc),
            Err(StateStoreError::ReservedDomain)
        ));
    }

    #[test]
    fn validate_sites_rejects_duplicate_alias() {
        let mut doc = StateDocument::new();
        doc.sites.push(site("a.test", &["shared.test"]));
        doc.sites.push(site("shared.test", &[]));
        assert!(matches!(
            validate_sites(&doc),
            Err(StateStoreError::DuplicateDomain { .. })
        ));
    }

    #[test]
    fn sites_changed_detects_appended_site() {
        let old = StateDocument::new();
        let mut new = StateDocument::new();
        new.sites.push(site("a.test", &[]));
        assert!(sites_changed(&old, &new));
    }

    #[test]
    fn sites_changed_false_when_only_certificates_differ() {
        let mut old = StateDocument::new();
        old.sites.push(site("a.test", &[]));
        let mut new = old.clone();
        new.certificates.insert(
            "cert-1".into(),
            crate::model::TlsCertificate {
                cert_type: crate::model::CertificateType::SelfSigned,
                name: None,
                domains: None,
                not_before: None,
                not_after: None,
                key: Some(vec![1]),
                certificate: Some(vec![2]),
            },
        );
        assert!(!sites_changed(&old, &new));
    }
}
