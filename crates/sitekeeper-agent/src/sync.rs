//! The reconciliation engine: a fixed-order sequence of steps that brings
//! the local filesystem, TLS material, and proxy configuration in line with
//! the latest desired state. Invoked once synchronously at startup and
//! thereafter queued by [`crate::queue::SyncQueue`] on every state push or
//! `SIGUSR1`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt as _};
use sitekeeper_core::model::{CertificateType, Site};
use tracing::{info, warn};

use crate::convert::DesiredState;
use crate::proxy;
use crate::state::AgentState;

const DEFAULT_APP: &str = sitekeeper_core::model::DEFAULT_DOMAIN;
const DEFAULT_INDEX_HTML: &str = include_str!("../assets/default_site/index.html");

/// Runs every reconciliation step in order against the most recently
/// received desired state. A no-op if no state has been received yet.
pub async fn run_sync(state: &AgentState) -> anyhow::Result<()> {
    let Some(desired) = state.latest_state() else {
        info!("no desired state received yet, skipping sync");
        return Ok(());
    };

    let app_root = PathBuf::from(&state.config.core.app_root);
    init_app_root(&app_root).await?;
    write_default_app(&app_root).await?;
    sync_misc_files(&app_root, &desired).await?;

    let app_failures = sync_apps(state, &app_root, &desired).await;
    sync_site_folders(state, &app_root, &desired, &app_failures).await?;
    let config_changed = sync_configuration(state, &desired, &app_failures).await?;

    if config_changed {
        restart_or_reload(state).await?;
    }

    Ok(())
}

async fn init_app_root(app_root: &Path) -> anyhow::Result<()> {
    for sub in ["cache", "apps", "sites", "misc"] {
        let dir = app_root.join(sub);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            sitekeeper_core::error::SyncError::InitAppRoot {
                path: dir.display().to_string(),
                reason: e.to_string(),
            }
        })?;
    }
    Ok(())
}

/// Resets `apps/_default` to the embedded fallback site on every sync, so
/// it can never drift from what this binary ships.
async fn write_default_app(app_root: &Path) -> anyhow::Result<()> {
    let dest = app_root.join("apps").join(DEFAULT_APP);
    if dest.exists() {
        tokio::fs::remove_dir_all(&dest).await.ok();
    }
    tokio::fs::create_dir_all(&dest).await?;
    tokio::fs::write(dest.join("index.html"), DEFAULT_INDEX_HTML).await?;
    Ok(())
}

async fn sync_misc_files(app_root: &Path, desired: &DesiredState) -> anyhow::Result<()> {
    let Some(dh) = &desired.dh_params else {
        return Ok(());
    };
    let path = app_root.join("misc").join("dhparams.pem");
    write_if_changed(&path, dh.pem.as_bytes()).await?;
    Ok(())
}

/// Writes `contents` to `path` only if it differs from what is already
/// there, so config-reload decisions downstream only see real changes.
async fn write_if_changed(path: &Path, contents: &[u8]) -> anyhow::Result<bool> {
    if let Ok(existing) = tokio::fs::read(path).await {
        if existing == contents {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(true)
}

/// Fetches every distinct app bundle referenced by `desired.sites` through a
/// bounded worker pool, and removes `apps/*` directories that are no longer
/// referenced by anything. Returns the set of app names whose fetch failed.
async fn sync_apps(
    state: &AgentState,
    app_root: &Path,
    desired: &DesiredState,
) -> HashSet<String> {
    let wanted: HashSet<String> = desired
        .sites
        .iter()
        .filter_map(|s| s.app.as_ref().map(|a| a.name.clone()))
        .collect();

    let worker_count = state.config.fetch_worker_count.max(1);
    let results: Vec<(String, Result<(), String>)> = stream::iter(wanted.iter().cloned())
        .map(|bundle| async move {
            let result = crate::bundle::stage_app(state, &bundle)
                .await
                .map_err(|e| e.to_string());
            (bundle, result)
        })
        .buffer_unordered(worker_count)
        .collect()
        .await;

    let mut failed = HashSet::new();
    for (bundle, result) in results {
        if let Err(reason) = result {
            warn!(%bundle, error = %reason, "failed to stage app bundle");
            failed.insert(bundle);
        }
    }

    prune_unused_apps(app_root, &wanted).await;
    failed
}

async fn prune_unused_apps(app_root: &Path, wanted: &HashSet<String>) {
    let apps_dir = app_root.join("apps");
    let Ok(mut entries) = tokio::fs::read_dir(&apps_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == DEFAULT_APP || wanted.contains(&name) {
            continue;
        }
        if entry.path().is_dir() {
            info!(app = %name, "removing unreferenced app bundle");
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }
    }
}

/// Ensures `sites/<domain>/` and its `tls/` subdirectory exist, fetches and
/// writes certificate material only when it has changed, and repoints the
/// `www` symlink at the site's app directory atomically.
async fn sync_site_folders(
    state: &AgentState,
    app_root: &Path,
    desired: &DesiredState,
    app_failures: &HashSet<String>,
) -> anyhow::Result<()> {
    let sites_dir = app_root.join("sites");
    let wanted: HashSet<&str> = desired.sites.iter().map(|s| s.domain.as_str()).collect();

    prune_unused_sites(&sites_dir, &wanted).await;

    for site in &desired.sites {
        let site_dir = sites_dir.join(&site.domain);
        let tls_dir = site_dir.join("tls");
        tokio::fs::create_dir_all(&tls_dir).await?;

        if let Some(cert_id) = site.effective_tls_id() {
            if let Err(e) = sync_site_certificate(state, &tls_dir, cert_id).await {
                mark_unhealthy(state, &site.domain, e.to_string()).await;
                continue;
            }
        }

        let app_name = site.app.as_ref().map(|a| a.name.as_str()).unwrap_or(DEFAULT_APP);
        if app_failures.contains(app_name) {
            mark_unhealthy(state, &site.domain, format!("app bundle {app_name} failed to stage")).await;
            continue;
        }

        let app_dir = app_root.join("apps").join(app_name);
        repoint_www_symlink(&site_dir.join("www"), &app_dir).await?;
    }

    Ok(())
}

async fn prune_unused_sites(sites_dir: &Path, wanted: &HashSet<&str>) {
    let Ok(mut entries) = tokio::fs::read_dir(sites_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if wanted.contains(name.as_str()) {
            continue;
        }
        if entry.path().is_dir() {
            info!(domain = %name, "removing unreferenced site folder");
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }
    }
}

async fn sync_site_certificate(state: &AgentState, tls_dir: &Path, cert_id: &str) -> anyhow::Result<()> {
    let (key_pem, cert_pem) = state.client.get_tls_certificate(cert_id).await?;
    write_if_changed(&tls_dir.join("key.pem"), &key_pem).await?;
    write_if_changed(&tls_dir.join("certificate.pem"), &cert_pem).await?;
    Ok(())
}

/// Repoints `link` at `target` by creating a uniquely named symlink next to
/// it and renaming over the final path, so a concurrent reader never sees a
/// missing or half-updated link.
async fn repoint_www_symlink(link: &Path, target: &Path) -> anyhow::Result<()> {
    if let Ok(existing) = tokio::fs::read_link(link).await {
        if existing == target {
            return Ok(());
        }
    }
    let tmp = link.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    let target = target.to_owned();
    let tmp_for_blocking = tmp.clone();
    tokio::task::spawn_blocking(move || std::os::unix::fs::symlink(&target, &tmp_for_blocking)).await??;
    tokio::fs::rename(&tmp, link).await?;
    Ok(())
}

async fn mark_unhealthy(state: &AgentState, domain: &str, reason: String) {
    warn!(%domain, %reason, "site marked unhealthy");
    state.site_health.write().await.insert(domain.to_owned(), Some(reason));
}

async fn mark_healthy(state: &AgentState, domain: &str) {
    state.site_health.write().await.insert(domain.to_owned(), None);
}

/// Renders, tests, and applies each site's proxy configuration fragment.
/// A site whose rendered config fails the test command is left on its
/// previous configuration and marked unhealthy; everything else is marked
/// healthy. Returns whether any file on disk actually changed.
async fn sync_configuration(
    state: &AgentState,
    desired: &DesiredState,
    app_failures: &HashSet<String>,
) -> anyhow::Result<bool> {
    let config_dir = PathBuf::from(&state.config.proxy_config_dir);
    tokio::fs::create_dir_all(&config_dir).await?;

    let wanted: HashSet<String> = desired.sites.iter().map(|s| format!("{}.conf", s.domain)).collect();
    prune_unused_configs(&config_dir, &wanted).await;

    let mut changed = false;
    for site in &desired.sites {
        let app_name = site.app.as_ref().map(|a| a.name.as_str()).unwrap_or(DEFAULT_APP);
        if app_failures.contains(app_name) {
            continue;
        }
        match apply_site_config(state, &config_dir, site).await {
            Ok(site_changed) => {
                changed |= site_changed;
                mark_healthy(state, &site.domain).await;
            }
            Err(e) => mark_unhealthy(state, &site.domain, e.to_string()).await,
        }
    }
    Ok(changed)
}

async fn prune_unused_configs(config_dir: &Path, wanted: &HashSet<String>) {
    let Ok(mut entries) = tokio::fs::read_dir(config_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if wanted.contains(&name) || !name.ends_with(".conf") {
            continue;
        }
        info!(file = %name, "removing unreferenced proxy config");
        let _ = tokio::fs::remove_file(entry.path()).await;
    }
}

async fn apply_site_config(
    state: &AgentState,
    config_dir: &Path,
    site: &Site,
) -> Result<bool, sitekeeper_core::error::SyncError> {
    let final_path = config_dir.join(format!("{}.conf", site.domain));
    let rendered = render_site_config(state, site);

    let tmp_path = config_dir.join(format!(".{}.conf.tmp", site.domain));
    tokio::fs::write(&tmp_path, &rendered)
        .await
        .map_err(|e| io_err(&tmp_path, e))?;

    proxy::test_config(
        &state.config.proxy_test_command,
        &site.domain,
        &tmp_path.display().to_string(),
    )
    .await?;

    let unchanged = tokio::fs::read(&final_path).await.is_ok_and(|existing| existing == rendered.as_bytes());
    if unchanged {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Ok(false);
    }

    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|e| io_err(&final_path, e))?;
    Ok(true)
}

/// Starts the proxy if it isn't running yet, otherwise reloads it. Called
/// once per sync, after every site's configuration has been applied.
async fn restart_or_reload(state: &AgentState) -> anyhow::Result<()> {
    if proxy::is_running(&state.config.proxy_start_command).await {
        proxy::reload(&state.config.proxy_reload_command).await?;
    } else {
        proxy::start(&state.config.proxy_start_command).await?;
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> sitekeeper_core::error::SyncError {
    sitekeeper_core::error::SyncError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Plain string formatting, no templating engine: the server block is
/// small and fixed-shape enough that a format string reads more plainly
/// than a template file would.
fn render_site_config(state: &AgentState, site: &Site) -> String {
    let server_names = std::iter::once(site.domain.as_str())
        .chain(site.aliases.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");

    let app_name = site.app.as_ref().map(|a| a.name.as_str()).unwrap_or(DEFAULT_APP);
    let root = format!("{}/apps/{app_name}", state.config.core.app_root);
    let site_dir = format!("{}/sites/{}", state.config.core.app_root, site.domain);

    let cache_directive = if site.client_caching {
        "expires 7d;"
    } else {
        "expires -1;"
    };

    format!(
        "server {{\n    listen 443 ssl;\n    server_name {server_names};\n    ssl_certificate {site_dir}/tls/certificate.pem;\n    ssl_certificate_key {site_dir}/tls/key.pem;\n    root {root};\n    {cache_directive}\n}}\n"
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sitekeeper_core::config::{Config, DhParamsConfig};
    use sitekeeper_core::object_store::LocalObjectStore;

    use crate::client::AgentClient;
    use crate::config::AgentConfig;

    use super::*;

    #[test]
    fn self_signed_cert_type_is_not_acme() {
        assert_ne!(CertificateType::SelfSigned, CertificateType::Acme);
    }

    fn test_state(app_root: &str) -> AgentState {
        let core = Config {
            node_name: "agent-1".to_owned(),
            app_root: app_root.to_owned(),
            manifest_file: "manifest.yaml".to_owned(),
            controller_grpc_addr: "0.0.0.0:7443".to_owned(),
            controller_api_addr: "0.0.0.0:8080".to_owned(),
            dhparams: DhParamsConfig { bits: 2048, max_age_days: Some(90) },
            acme_email: None,
            codesign_required: false,
            state_lock_timeout: Duration::from_secs(5),
        };
        let config = AgentConfig {
            core,
            controller_addr: "http://127.0.0.1:7443".to_owned(),
            auth_token: "test-token".to_owned(),
            proxy_test_command: "true".to_owned(),
            proxy_start_command: "true".to_owned(),
            proxy_reload_command: "true".to_owned(),
            proxy_config_dir: "/tmp/sitekeeper-test".to_owned(),
            fetch_worker_count: 1,
            fetch_channel_capacity: 1,
            health_probe_timeout: Duration::from_secs(1),
            health_probe_interval: Duration::from_secs(10),
        };
        let object_store = Arc::new(LocalObjectStore::new(app_root));
        let client = Arc::new(AgentClient::new("http://127.0.0.1:7443", "test-token".to_owned()).expect("valid endpoint"));
        AgentState::new(config, "node-1".to_owned(), object_store, client)
    }

    fn test_site(domain: &str, aliases: &[&str], app: Option<&str>, client_caching: bool) -> Site {
        Site {
            domain: domain.to_owned(),
            aliases: aliases.iter().map(|a| (*a).to_owned()).collect(),
            client_caching,
            temporary: false,
            imported_tls_id: None,
            generated_tls_id: None,
            app: app.map(|name| sitekeeper_core::model::AppBinding { name: name.to_owned() }),
        }
    }

    #[test]
    fn render_site_config_includes_all_aliases() {
        let state = test_state("/var/lib/sitekeeper");
        let site = test_site("ex.test", &["www.ex.test", "m.ex.test"], Some("myapp"), false);

        let rendered = render_site_config(&state, &site);

        assert!(rendered.contains("server_name ex.test www.ex.test m.ex.test;"));
        assert!(rendered.contains("root /var/lib/sitekeeper/apps/myapp;"));
        assert!(rendered.contains("/var/lib/sitekeeper/sites/ex.test/tls/certificate.pem"));
        assert!(rendered.contains("expires -1;"));
    }

    #[test]
    fn render_site_config_falls_back_to_default_app_and_honors_caching() {
        let state = test_state("/var/lib/sitekeeper");
        let site = test_site("bare.test", &[], None, true);

        let rendered = render_site_config(&state, &site);

        assert!(rendered.contains(&format!("root /var/lib/sitekeeper/apps/{DEFAULT_APP};")));
        assert!(rendered.contains("expires 7d;"));
        assert!(rendered.contains("server_name bare.test;"));
    }
}
