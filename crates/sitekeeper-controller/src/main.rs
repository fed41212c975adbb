//! Sitekeeper controller entry point.
//!
//! Bootstraps the state store, object store, certificates service, and
//! authenticator, then serves the gRPC channel and the admin REST API
//! concurrently with graceful shutdown — the same shape as the teacher's
//! `zvault_server::main`, generalized from one Axum server to a paired
//! tonic/Axum pair plus leader-only background workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, watch, RwLock};
use tonic::transport::Server;
use tracing::{error, info, warn};

use sitekeeper_core::config::{Config, ObjectStoreKind, StateStoreKind};
use sitekeeper_core::object_store::{AzureBlobObjectStore, LocalObjectStore, ObjectStore, S3ObjectStore};
use sitekeeper_core::state_store::{KvStateStore, SingleFileStateStore, StateStore};
use sitekeeper_core::{AcmeWorker, CertificatesService};
use sitekeeper_proto::controller_server::ControllerServer;

mod admin;
mod auth;
mod codesign;
mod convert;
mod error;
mod grpc;
mod state;
mod workers;

use auth::Authenticator;
use codesign::CodesignKey;
use state::{ControllerState, HEALTH_EVENTS_CAPACITY};

/// Graceful-shutdown budget: how long leader workers get to unwind after the
/// shutdown signal before the process exits anyway.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let (config, cipher_key) = Config::from_env().context("failed to load configuration")?;
    info!(node_name = %config.node_name, "sitekeeper controller starting");

    let state = Arc::new(build_state(config, cipher_key).await?);

    let (leader_cancel_tx, mut leader_cancel_rx) = watch::channel::<Option<tokio_util::sync::CancellationToken>>(None);
    {
        let state = Arc::clone(&state);
        let mut is_leader = state.is_leader.clone();
        tokio::spawn(async move {
            loop {
                if is_leader.changed().await.is_err() {
                    return;
                }
                let leading = *is_leader.borrow_and_update();
                if leading {
                    let token = tokio_util::sync::CancellationToken::new();
                    info!("leadership acquired, starting leader-only workers");
                    workers::spawn_leader_workers(Arc::clone(&state), token.clone());
                    let _ = leader_cancel_tx.send(Some(token));
                } else {
                    info!("leadership lost");
                    if let Some(token) = leader_cancel_tx.borrow().as_ref() {
                        token.cancel();
                    }
                    let _ = leader_cancel_tx.send(None);
                }
            }
        });
    }

    let grpc_addr = state.config.controller_grpc_addr.parse().context("invalid gRPC bind address")?;
    let api_addr = state.config.controller_api_addr.parse().context("invalid API bind address")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let grpc_server = {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let service = grpc::ControllerService::new(state);
            info!(addr = %grpc_addr, "gRPC channel listening");
            Server::builder()
                .add_service(ControllerServer::new(service))
                .serve_with_shutdown(grpc_addr, async move {
                    let _ = shutdown.recv().await;
                })
                .await
        })
    };

    let admin_server = {
        let router = admin::router(Arc::clone(&state)).with_state(Arc::clone(&state));
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(api_addr).await?;
            info!(addr = %api_addr, "admin API listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(());
    if let Some(token) = leader_cancel_rx.borrow_and_update().as_ref() {
        token.cancel();
    }

    let grpc_result = tokio::time::timeout(SHUTDOWN_TIMEOUT, grpc_server).await;
    let admin_result = tokio::time::timeout(SHUTDOWN_TIMEOUT, admin_server).await;

    match grpc_result {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "gRPC server exited with error"),
        Ok(Err(e)) => error!(error = %e, "gRPC server task panicked"),
        Err(_) => warn!("gRPC server did not shut down within the grace period"),
    }
    match admin_result {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "admin server exited with error"),
        Ok(Err(e)) => error!(error = %e, "admin server task panicked"),
        Err(_) => warn!("admin server did not shut down within the grace period"),
    }

    info!("sitekeeper controller stopped");
    Ok(())
}

async fn build_state(
    config: Config,
    cipher_key: sitekeeper_core::Aes128GcmKey,
) -> anyhow::Result<ControllerState> {
    let cipher_key = Arc::new(cipher_key);

    let state_store: Arc<dyn StateStore> = match Config::state_store_kind()? {
        StateStoreKind::File { path } => {
            info!(path = %path, "using single-file state store");
            Arc::new(SingleFileStateStore::new(path))
        }
        StateStoreKind::Etcd { endpoints, prefix } => {
            info!(?endpoints, %prefix, "using etcd-backed state store");
            let kv = sitekeeper_storage::EtcdKvStore::connect(&endpoints)
                .await
                .context("failed to connect to etcd")?;
            Arc::new(KvStateStore::new(Arc::new(kv), prefix, config.node_name.clone()))
        }
    };
    state_store.init().await.context("state store initialization failed")?;

    let object_store: Arc<dyn ObjectStore> = match Config::object_store_kind()? {
        ObjectStoreKind::Local { path } => {
            info!(path = %path, "using local object store");
            Arc::new(LocalObjectStore::new(path))
        }
        ObjectStoreKind::AzureBlob { account, container } => {
            info!(%account, %container, "using Azure Blob object store");
            let key = std::env::var("SITEKEEPER_REPO_AZURE_KEY")
                .context("SITEKEEPER_REPO_AZURE_KEY must be set for the Azure Blob backend")?;
            let credentials = azure_storage::StorageCredentials::access_key(&account, key);
            let client = azure_storage_blobs::prelude::ClientBuilder::new(account, credentials)
                .container_client(container);
            Arc::new(AzureBlobObjectStore::new(client))
        }
        ObjectStoreKind::S3 { bucket, endpoint } => {
            info!(%bucket, ?endpoint, "using S3 object store");
            let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let s3_config = match endpoint {
                Some(url) => aws_sdk_s3::config::Builder::from(&sdk_config)
                    .endpoint_url(url)
                    .force_path_style(true)
                    .build(),
                None => aws_sdk_s3::config::Builder::from(&sdk_config).build(),
            };
            Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::from_conf(s3_config), bucket))
        }
    };

    let certificates = Arc::new(CertificatesService::new(
        Arc::clone(&state_store),
        Arc::clone(&cipher_key),
        None,
    ));

    let acme = config.acme_email.clone().map(|email| {
        let challenges = Arc::new(sitekeeper_core::acme::StateStoreChallengeProvider::new(
            Arc::clone(&state_store),
            Arc::clone(&cipher_key),
        ));
        Arc::new(AcmeWorker::new(
            Arc::clone(&state_store),
            Arc::clone(&cipher_key),
            Arc::clone(&certificates),
            challenges,
            "https://acme-v02.api.letsencrypt.org/directory".to_owned(),
            email,
        ))
    });

    let authenticator = Authenticator::new(Config::auth_config()?);
    let codesign_key = CodesignKey::from_env()?;
    let key_vault_selector = std::env::var("SITEKEEPER_KEY_VAULT_SELECTOR").unwrap_or_default();

    let is_leader = state_store
        .acquire_leadership()
        .await
        .context("failed to start leadership contention")?;
    let is_leader = {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(forward_leadership(is_leader, tx));
        rx
    };

    Ok(ControllerState {
        config,
        state_store,
        object_store,
        certificates,
        acme,
        cipher_key,
        authenticator,
        codesign_key,
        key_vault_selector,
        is_leader,
        registrations: RwLock::new(std::collections::HashMap::new()),
        node_channels: RwLock::new(std::collections::HashMap::new()),
        health_events: broadcast::channel(HEALTH_EVENTS_CAPACITY).0,
    })
}

async fn forward_leadership(
    mut stream: tokio_stream::wrappers::WatchStream<bool>,
    tx: watch::Sender<bool>,
) {
    use tokio_stream::StreamExt as _;
    while let Some(leading) = stream.next().await {
        if tx.send(leading).is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
