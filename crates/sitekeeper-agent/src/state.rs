//! Shared agent state, constructed once at startup and passed by `Arc` to
//! the channel client, the sync engine, and the health broadcaster — the
//! agent-side analogue of the controller's `ControllerState`.

use std::collections::HashMap;
use std::sync::Arc;

use sitekeeper_core::object_store::ObjectStore;
use tokio::sync::{watch, RwLock};

use crate::client::AgentClient;
use crate::config::AgentConfig;
use crate::convert::DesiredState;

/// A site's current reconciliation health: `None` while healthy, `Some`
/// carrying the error that made it unhealthy. Setting this does not bump
/// any state version; it only gates per-site sync actions and feeds the
/// health broadcaster.
pub type SiteHealth = HashMap<String, Option<String>>;

pub struct AgentState {
    pub config: AgentConfig,
    pub node_id: String,
    pub object_store: Arc<dyn ObjectStore>,
    /// Reused for the unary `GetTlsCertificate` calls the sync engine makes
    /// outside the long-lived channel stream.
    pub client: Arc<AgentClient>,
    /// Raw modulus/exponent of the cluster code-signing key, learned from
    /// `GetClusterOptions`. `None` means the cluster does not sign bundles,
    /// in which case an unsigned bundle is not fatal.
    pub codesign_key: RwLock<Option<(Vec<u8>, Vec<u8>)>>,
    /// Latest desired state received over the channel. `None` until the
    /// first `STATE_MESSAGE` arrives.
    pub desired_state: watch::Sender<Option<DesiredState>>,
    pub site_health: RwLock<SiteHealth>,
}

impl AgentState {
    #[must_use]
    pub fn new(
        config: AgentConfig,
        node_id: String,
        object_store: Arc<dyn ObjectStore>,
        client: Arc<AgentClient>,
    ) -> Self {
        let (desired_state, _) = watch::channel(None);
        Self {
            config,
            node_id,
            object_store,
            client,
            codesign_key: RwLock::new(None),
            desired_state,
            site_health: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn latest_state(&self) -> Option<DesiredState> {
        self.desired_state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DesiredState>> {
        self.desired_state.subscribe()
    }
}
