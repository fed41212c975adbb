//! Sitekeeper agent entry point.
//!
//! Learns the cluster's code-signing key and manifest file name, runs one
//! synchronous reconciliation pass before reporting ready, then keeps the
//! controller channel open, probes site health, and reconciles again on
//! every pushed state or `SIGUSR1` — the same bootstrap-then-serve shape as
//! the controller's `main`, adapted to a client that drives its own
//! long-lived stream instead of accepting connections.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use sitekeeper_core::config::{Config, ObjectStoreKind};
use sitekeeper_core::object_store::{AzureBlobObjectStore, LocalObjectStore, ObjectStore, S3ObjectStore};

mod bundle;
mod client;
mod config;
mod convert;
mod health;
mod proxy;
mod queue;
mod state;
mod sync;

use client::AgentClient;
use config::AgentConfig;
use queue::SyncQueue;
use state::AgentState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let (config, _cipher_key) = AgentConfig::from_env().context("failed to load configuration")?;
    info!(node_name = %config.core.node_name, "sitekeeper agent starting");

    let node_id = uuid::Uuid::new_v4().to_string();
    let object_store = build_object_store().await?;
    let client = Arc::new(AgentClient::new(&config.controller_addr, config.auth_token.clone())?);

    let cluster_options = client
        .get_cluster_options()
        .await
        .context("failed to learn cluster options from controller")?;

    let state = Arc::new(AgentState::new(config, node_id, object_store, Arc::clone(&client)));
    if !cluster_options.codesign_key_n.is_empty() {
        *state.codesign_key.write().await =
            Some((cluster_options.codesign_key_n, cluster_options.codesign_key_e));
    }

    let sync_queue = Arc::new(SyncQueue::new());

    let cancel = tokio_util::sync::CancellationToken::new();

    let channel_task = {
        let state = Arc::clone(&state);
        let sync_queue = Arc::clone(&sync_queue);
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client.run_forever(state, sync_queue, &cancel).await;
        })
    };

    let health_task = {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(health::run(state, cancel))
    };

    let signal_task = {
        let state = Arc::clone(&state);
        let sync_queue = Arc::clone(&sync_queue);
        let cancel = cancel.clone();
        tokio::spawn(run_signal_loop(state, sync_queue, cancel))
    };

    shutdown_signal().await;
    info!("shutdown signal received, finishing in-flight sync before exit");
    cancel.cancel();

    for (name, task) in [("channel", channel_task), ("health", health_task), ("signal", signal_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task panicked");
        }
    }

    info!("sitekeeper agent stopped");
    Ok(())
}

async fn build_object_store() -> anyhow::Result<Arc<dyn ObjectStore>> {
    Ok(match Config::object_store_kind()? {
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
    })
}

/// Drives `SIGUSR1` (force an immediate sync) alongside whatever periodic
/// triggers the queue already has. Exits once `cancel` fires.
async fn run_signal_loop(state: Arc<AgentState>, sync_queue: Arc<SyncQueue>, cancel: tokio_util::sync::CancellationToken) {
    #[cfg(unix)]
    {
        let Ok(mut usr1) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) else {
            warn!("failed to install SIGUSR1 handler, manual resync trigger disabled");
            return;
        };
        loop {
            tokio::select! {
                _ = usr1.recv() => {
                    info!("SIGUSR1 received, queueing sync");
                    let sync_state = Arc::clone(&state);
                    sync_queue.queue_run(move || async move { sync::run_sync(&sync_state).await });
                }
                () = cancel.cancelled() => return,
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (state, sync_queue);
        cancel.cancelled().await;
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
