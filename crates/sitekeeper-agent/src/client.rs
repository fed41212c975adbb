//! The controller channel client: the four unary bootstrap calls plus the
//! long-lived bidirectional `Channel` stream, reconnected with backoff on
//! any failure. The agent-side counterpart of
//! `sitekeeper-controller::grpc::ControllerService`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{info, warn};

use sitekeeper_proto as pb;
use pb::channel_message::Frame;
use pb::controller_client::ControllerClient;

use crate::convert::message_to_state;
use crate::queue::SyncQueue;
use crate::state::AgentState;

/// Initial and maximum backoff between reconnect attempts.
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct AgentClient {
    endpoint: Endpoint,
    auth_token: String,
}

impl AgentClient {
    pub fn new(addr: &str, auth_token: String) -> anyhow::Result<Self> {
        let endpoint = Endpoint::from_shared(addr.to_owned())?
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Some(Duration::from_secs(30)));
        Ok(Self { endpoint, auth_token })
    }

    async fn connect(&self) -> anyhow::Result<ControllerClient<Channel>> {
        Ok(ControllerClient::new(self.endpoint.connect().await?))
    }

    fn authorize<T>(&self, request: &mut Request<T>) -> anyhow::Result<()> {
        let value = MetadataValue::try_from(format!("Bearer {}", self.auth_token))?;
        request.metadata_mut().insert("authorization", value);
        Ok(())
    }

    /// Unauthenticated bootstrap call: learns the manifest file name,
    /// code-signing key, and key-vault selector before the agent has
    /// anything else to go on.
    pub async fn get_cluster_options(&self) -> anyhow::Result<pb::ClusterOptions> {
        let mut client = self.connect().await?;
        let response = client
            .get_cluster_options(Request::new(pb::GetClusterOptionsRequest {}))
            .await?;
        Ok(response.into_inner())
    }

    pub async fn get_tls_certificate(&self, cert_id: &str) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        let mut client = self.connect().await?;
        let mut request = Request::new(pb::GetTlsCertificateRequest {
            cert_id: cert_id.to_owned(),
        });
        self.authorize(&mut request)?;
        let response = client.get_tls_certificate(request).await?;
        let response = response.into_inner();
        Ok((response.key_pem, response.certificate_pem))
    }

    /// Runs the registration + channel loop forever, reconnecting with
    /// backoff whenever the stream ends or fails. Returns only if `cancel`
    /// fires.
    pub async fn run_forever(
        &self,
        state: Arc<AgentState>,
        sync_queue: Arc<SyncQueue>,
        cancel: &tokio_util::sync::CancellationToken,
    ) {
        let mut backoff = RECONNECT_MIN;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.run_channel_once(Arc::clone(&state), Arc::clone(&sync_queue), cancel).await
            {
                Ok(()) => {
                    info!("controller channel closed cleanly");
                    backoff = RECONNECT_MIN;
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "controller channel failed, reconnecting");
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn run_channel_once(
        &self,
        state: Arc<AgentState>,
        sync_queue: Arc<SyncQueue>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        let mut client = self.connect().await?;
        let (tx, rx) = mpsc::channel::<pb::ChannelMessage>(16);

        tx.send(pb::ChannelMessage {
            frame: Some(Frame::Register(pb::Register {
                node_id: state.node_id.clone(),
                node_name: state.config.core.node_name.clone(),
            })),
        })
        .await?;

        let mut request = Request::new(ReceiverStream::new(rx));
        self.authorize(&mut request)?;
        let response = client.channel(request).await?;
        let mut inbound = response.into_inner();
        info!("registered with controller, channel open");

        loop {
            tokio::select! {
                frame = inbound.next() => {
                    match frame {
                        Some(Ok(pb::ChannelMessage { frame: Some(Frame::State(msg)) })) => {
                            let version = msg.version;
                            let desired = message_to_state(msg);
                            let _ = state.desired_state.send(Some(desired));
                            info!(version, "received state update, queueing sync");
                            let sync_state = Arc::clone(&state);
                            sync_queue.queue_run(move || async move {
                                crate::sync::run_sync(&sync_state).await
                            });
                        }
                        Some(Ok(pb::ChannelMessage { frame: Some(Frame::HealthPing(_)) })) => {
                            let health = collect_health_message(&state).await;
                            if tx.send(pb::ChannelMessage { frame: Some(Frame::HealthMessage(health)) }).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(status)) => return Err(status.into()),
                        None => return Ok(()),
                    }
                }
                () = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

async fn collect_health_message(state: &AgentState) -> pb::HealthMessage {
    let health = state.site_health.read().await;
    let version = state.latest_state().map_or(0, |s| s.version);
    pb::HealthMessage {
        version,
        site_health: health
            .iter()
            .map(|(domain, error)| pb::SiteHealth {
                domain: domain.clone(),
                healthy: error.is_none(),
            })
            .collect(),
    }
}
