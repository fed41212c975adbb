//! Agent-specific environment configuration, layered on top of the shared
//! [`sitekeeper_core::config::Config`]. Mirrors the teacher's
//! `zvault-server::config` split between a shared core and a
//! binary-specific extension.

use std::time::Duration;

use sitekeeper_core::config::{Config, ConfigError};

/// Agent process configuration: where the controller lives, how to reach
/// it, and how the local proxy is driven.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub core: Config,
    /// `https://host:port` of the controller's gRPC channel.
    pub controller_addr: String,
    /// Bearer token sent with every authenticated RPC.
    pub auth_token: String,
    /// Shell command run to validate one rendered proxy config file before
    /// it is applied, e.g. `nginx -t -c {path}`. `{path}` is substituted.
    pub proxy_test_command: String,
    /// Shell command run to start the proxy if it is not already running.
    pub proxy_start_command: String,
    /// Shell command run to signal the running proxy to reload its config.
    pub proxy_reload_command: String,
    /// Directory the proxy reads its per-site config files from.
    pub proxy_config_dir: String,
    /// Number of concurrent bundle-fetch workers.
    pub fetch_worker_count: usize,
    /// Capacity of the bundle-fetch job channel (backpressure bound).
    pub fetch_channel_capacity: usize,
    /// Per-site health probe timeout.
    pub health_probe_timeout: Duration,
    /// Interval between health-broadcaster sweeps.
    pub health_probe_interval: Duration,
}

impl AgentConfig {
    /// Loads the shared core configuration plus every `SITEKEEPER_AGENT_*`
    /// setting, failing fast on anything missing or malformed.
    pub fn from_env() -> Result<(Self, sitekeeper_core::Aes128GcmKey), ConfigError> {
        let (core, cipher_key) = Config::from_env()?;

        let controller_addr = std::env::var("SITEKEEPER_AGENT_CONTROLLER_ADDR")
            .map_err(|_| ConfigError::Missing("SITEKEEPER_AGENT_CONTROLLER_ADDR"))?;
        let auth_token = std::env::var("SITEKEEPER_AGENT_AUTH_TOKEN")
            .map_err(|_| ConfigError::Missing("SITEKEEPER_AGENT_AUTH_TOKEN"))?;

        let proxy_test_command = env_or(
            "SITEKEEPER_AGENT_PROXY_TEST_COMMAND",
            "nginx -t -c {path}",
        );
        let proxy_start_command = env_or("SITEKEEPER_AGENT_PROXY_START_COMMAND", "nginx");
        let proxy_reload_command =
            env_or("SITEKEEPER_AGENT_PROXY_RELOAD_COMMAND", "nginx -s reload");
        let proxy_config_dir = env_or(
            "SITEKEEPER_AGENT_PROXY_CONFIG_DIR",
            "/etc/nginx/sites-enabled",
        );

        let fetch_worker_count: usize = env_or("SITEKEEPER_AGENT_FETCH_WORKERS", "3")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "SITEKEEPER_AGENT_FETCH_WORKERS",
                reason: "not a valid integer".to_owned(),
            })?;
        let fetch_channel_capacity: usize = env_or("SITEKEEPER_AGENT_FETCH_CHANNEL_CAPACITY", "4")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "SITEKEEPER_AGENT_FETCH_CHANNEL_CAPACITY",
                reason: "not a valid integer".to_owned(),
            })?;

        let health_probe_timeout_ms: u64 = env_or("SITEKEEPER_AGENT_HEALTH_TIMEOUT_MS", "1500")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "SITEKEEPER_AGENT_HEALTH_TIMEOUT_MS",
                reason: "not a valid integer".to_owned(),
            })?;
        let health_probe_interval_secs: u64 =
            env_or("SITEKEEPER_AGENT_HEALTH_INTERVAL_SECS", "10")
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    key: "SITEKEEPER_AGENT_HEALTH_INTERVAL_SECS",
                    reason: "not a valid integer".to_owned(),
                })?;

        Ok((
            Self {
                core,
                controller_addr,
                auth_token,
                proxy_test_command,
                proxy_start_command,
                proxy_reload_command,
                proxy_config_dir,
                fetch_worker_count,
                fetch_channel_capacity,
                health_probe_timeout: Duration::from_millis(health_probe_timeout_ms),
                health_probe_interval: Duration::from_secs(health_probe_interval_secs),
            },
            cipher_key,
        ))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
