//! Per-site health probing: a loop on `health_probe_interval` that fetches
//! `https://localhost` with the site's `Host` header set and records
//! whether each site answered with a successful, non-empty response.
//! Separate from the reconciliation engine — a failed probe never triggers
//! a sync, it only feeds the health pushed back to the controller.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::state::AgentState;

/// Runs forever, probing every site currently in `state.latest_state()` on
/// each tick, until `cancel` fires.
pub async fn run(state: Arc<AgentState>, cancel: tokio_util::sync::CancellationToken) {
    let client = match build_probe_client(state.config.health_probe_timeout) {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build health probe client, health broadcasting disabled");
            return;
        }
    };

    let mut ticker = tokio::time::interval(state.config.health_probe_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => return,
        }

        let Some(desired) = state.latest_state() else {
            continue;
        };
        for site in desired.sites {
            let healthy = probe_site(&client, &site.domain).await;
            let mut health = state.site_health.write().await;
            // A reachable, non-empty response overrides any reconciliation
            // failure recorded for the same domain; an unreachable site
            // keeps its existing error if reconciliation already set one.
            if healthy {
                health.insert(site.domain, None);
            } else {
                health.entry(site.domain).or_insert_with(|| Some("health probe failed".to_owned()));
            }
        }
    }
}

fn build_probe_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
}

async fn probe_site(client: &reqwest::Client, domain: &str) -> bool {
    let request = client.get("https://localhost").header("Host", domain.to_owned());
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            response.bytes().await.is_ok_and(|body| !body.is_empty())
        }
        Ok(_) | Err(_) => false,
    }
}
