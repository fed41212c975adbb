//! `Controller` gRPC service implementation: the four unary RPCs plus the
//! bidirectional `Channel` stream agents use to register, receive state
//! pushes, and answer health pings.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use sitekeeper_core::model::NodeRegistration;
use sitekeeper_proto as pb;
use pb::channel_message::Frame;
use pb::controller_server::Controller;

use crate::convert::state_document_to_message;
use crate::error::{certificate_error_to_status, state_store_error_to_status};
use crate::state::ControllerState;

/// How long the `Channel` send buffer may hold unconsumed pushes before a
/// slow agent is disconnected.
const CHANNEL_SEND_BUFFER: usize = 16;

pub struct ControllerService {
    state: Arc<ControllerState>,
}

impl ControllerService {
    #[must_use]
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }

    async fn require_auth<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let token = bearer_token(request)?;
        self.state
            .authenticator
            .authenticate(&token)
            .await
            .map_err(|e| Status::unauthenticated(e.to_string()))
    }
}

fn bearer_token<T>(request: &Request<T>) -> Result<String, Status> {
    let header = request
        .metadata()
        .get("authorization")
        .ok_or_else(|| Status::unauthenticated("missing authorization metadata"))?;
    let value = header
        .to_str()
        .map_err(|_| Status::unauthenticated("authorization metadata is not valid UTF-8"))?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_owned)
        .ok_or_else(|| Status::unauthenticated("authorization metadata must be 'Bearer <token>'"))
}

#[tonic::async_trait]
impl Controller for ControllerService {
    /// Unauthenticated by design — a brand-new agent has no credentials yet
    /// and needs this to validate the controller and verify bundles.
    async fn get_cluster_options(
        &self,
        _request: Request<pb::GetClusterOptionsRequest>,
    ) -> Result<Response<pb::ClusterOptions>, Status> {
        let (n, e) = self
            .state
            .codesign_key
            .as_ref()
            .map_or((Vec::new(), Vec::new()), |k| (k.n.clone(), k.e.clone()));

        Ok(Response::new(pb::ClusterOptions {
            manifest_file_name: self.state.config.manifest_file.clone(),
            codesign_key_n: n,
            codesign_key_e: e,
            key_vault_selector: self.state.key_vault_selector.clone(),
        }))
    }

    async fn get_state(
        &self,
        request: Request<pb::GetStateRequest>,
    ) -> Result<Response<pb::StateMessage>, Status> {
        self.require_auth(&request).await?;
        let doc = self
            .state
            .state_store
            .get_state()
            .await
            .map_err(|e| state_store_error_to_status(&e))?;
        Ok(Response::new(state_document_to_message(&doc)))
    }

    async fn get_tls_certificate(
        &self,
        request: Request<pb::GetTlsCertificateRequest>,
    ) -> Result<Response<pb::TlsCertificateResponse>, Status> {
        self.require_auth(&request).await?;
        let cert_id = request.into_inner().cert_id;
        let (key_pem, certificate_pem) = self
            .state
            .certificates
            .get_certificate(&cert_id)
            .await
            .map_err(|e| certificate_error_to_status(&e))?;
        Ok(Response::new(pb::TlsCertificateResponse {
            key_pem,
            certificate_pem,
        }))
    }

    type ChannelStream =
        Pin<Box<dyn Stream<Item = Result<pb::ChannelMessage, Status>> + Send + 'static>>;

    async fn channel(
        &self,
        request: Request<Streaming<pb::ChannelMessage>>,
    ) -> Result<Response<Self::ChannelStream>, Status> {
        self.require_auth(&request).await?;

        let mut incoming = request.into_inner();
        let state = Arc::clone(&self.state);
        let (tx, rx) = mpsc::channel(CHANNEL_SEND_BUFFER);

        tokio::spawn(async move {
            let Some(registration) = await_registration(&mut incoming, &tx).await else {
                return;
            };
            let node_id = registration.node_id.clone();

            state
                .registrations
                .write()
                .await
                .insert(node_id.clone(), registration);
            state
                .node_channels
                .write()
                .await
                .insert(node_id.clone(), tx.clone());
            info!(node_id = %node_id, "agent registered");

            run_channel_session(&state, &node_id, &mut incoming, &tx).await;

            state.registrations.write().await.remove(&node_id);
            state.node_channels.write().await.remove(&node_id);
            info!(node_id = %node_id, "agent disconnected");
        });

        let out = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(out)))
    }
}

/// Blocks on the first inbound frame, which must be `Register`.
async fn await_registration(
    incoming: &mut Streaming<pb::ChannelMessage>,
    tx: &mpsc::Sender<pb::ChannelMessage>,
) -> Option<NodeRegistration> {
    match incoming.next().await {
        Some(Ok(pb::ChannelMessage {
            frame: Some(Frame::Register(reg)),
        })) => Some(NodeRegistration {
            node_id: reg.node_id,
            node_name: reg.node_name,
            registered_at: Utc::now(),
            last_seen_version: 0,
        }),
        Some(Ok(_)) => {
            let _ = tx.send(error_closing_frame()).await;
            None
        }
        _ => None,
    }
}

fn error_closing_frame() -> pb::ChannelMessage {
    pb::ChannelMessage { frame: None }
}

/// Drives one agent's session after registration: forwards state updates as
/// they land and records health replies, until the stream ends.
async fn run_channel_session(
    state: &Arc<ControllerState>,
    node_id: &str,
    incoming: &mut Streaming<pb::ChannelMessage>,
    tx: &mpsc::Sender<pb::ChannelMessage>,
) {
    let Ok(mut state_changes) = state.state_store.on_receive().await else {
        return;
    };

    loop {
        tokio::select! {
            changed = state_changes.changed() => {
                if changed.is_err() {
                    return;
                }
                let doc = state_changes.borrow_and_update().clone();
                let message = pb::ChannelMessage {
                    frame: Some(Frame::State(state_document_to_message(&doc))),
                };
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            frame = incoming.next() => {
                match frame {
                    Some(Ok(pb::ChannelMessage { frame: Some(Frame::HealthMessage(health)) })) => {
                        if let Some(reg) = state.registrations.write().await.get_mut(node_id) {
                            reg.last_seen_version = health.version;
                        }
                        let _ = state.health_events.send((node_id.to_owned(), health));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(node_id = %node_id, error = %e, "channel stream error");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

/// Sends a `HealthPing` to the given node's channel, if still connected.
pub async fn ping_node(state: &ControllerState, node_id: &str) -> bool {
    let channels = state.node_channels.read().await;
    let Some(tx) = channels.get(node_id) else {
        return false;
    };
    let ping = pb::ChannelMessage {
        frame: Some(Frame::HealthPing(pb::HealthPing {
            sent_at_unix: Utc::now().timestamp(),
        })),
    };
    tx.send(ping).await.is_ok()
}

/// The window the cluster-status handler waits for `HealthMessage` replies
/// before giving up on stragglers.
pub const HEALTH_COLLECTION_WINDOW: Duration = Duration::from_secs(2);
