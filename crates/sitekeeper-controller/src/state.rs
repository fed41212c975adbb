//! Shared application state for the controller binary.
//!
//! A single [`ControllerState`] is constructed at startup and shared across
//! gRPC service handlers and admin REST handlers behind an `Arc`, in the
//! shape of the teacher's `zvault_server::state::AppState`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, RwLock};

use sitekeeper_core::{AcmeWorker, Aes128GcmKey, CertificatesService, Config, NodeRegistration};
use sitekeeper_core::object_store::ObjectStore;
use sitekeeper_core::state_store::StateStore;
use sitekeeper_proto as pb;

use crate::auth::Authenticator;
use crate::codesign::CodesignKey;

/// Capacity of the cluster-wide health-event broadcast; only a couple of
/// concurrent `clusterstatus` admin calls are ever expected to be waiting.
pub(crate) const HEALTH_EVENTS_CAPACITY: usize = 256;

/// Shared application state passed to every gRPC and REST handler.
pub struct ControllerState {
    pub config: Config,
    pub state_store: Arc<dyn StateStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub certificates: Arc<CertificatesService>,
    pub acme: Option<Arc<AcmeWorker>>,
    pub cipher_key: Arc<Aes128GcmKey>,
    pub authenticator: Arc<Authenticator>,
    pub codesign_key: Option<CodesignKey>,
    pub key_vault_selector: String,
    /// Whether this process currently holds the leadership lease.
    pub is_leader: watch::Receiver<bool>,
    /// Nodes currently holding an open `Channel` stream, by node ID.
    pub registrations: RwLock<HashMap<String, NodeRegistration>>,
    /// Outgoing sender half of each connected node's `Channel`, used to push
    /// on-demand `HealthPing` frames from the admin `clusterstatus` route.
    pub node_channels: RwLock<HashMap<String, mpsc::Sender<pb::ChannelMessage>>>,
    /// Fan-out of every `HealthMessage` received on any node's channel,
    /// consumed by `clusterstatus` within its collection window.
    pub health_events: broadcast::Sender<(String, pb::HealthMessage)>,
}

impl std::fmt::Debug for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerState").finish_non_exhaustive()
    }
}

impl ControllerState {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        *self.is_leader.borrow()
    }
}
