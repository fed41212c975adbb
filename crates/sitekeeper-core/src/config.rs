//! Environment-sourced configuration, shared by the controller and agent
//! binaries. Every key is prefixed `SITEKEEPER_` and documented alongside
//! its default.

use std::time::Duration;

use crate::crypto::Aes128GcmKey;
use crate::error::CryptoError;

/// Errors loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("secretsEncryptionKey invalid: {0}")]
    SecretsKey(#[from] CryptoError),
}

/// Which state store backend to run against.
#[derive(Debug, Clone)]
pub enum StateStoreKind {
    File { path: String },
    Etcd { endpoints: Vec<String>, prefix: String },
}

/// Which object store backend to run against.
#[derive(Debug, Clone)]
pub enum ObjectStoreKind {
    Local { path: String },
    AzureBlob { account: String, container: String },
    S3 { bucket: String, endpoint: Option<String> },
}

/// DH parameter generation settings.
#[derive(Debug, Clone, Copy)]
pub struct DhParamsConfig {
    pub bits: u32,
    /// Days; `None` disables regeneration (config value `<= -1`).
    pub max_age_days: Option<i64>,
}

impl DhParamsConfig {
    const ALLOWED_BITS: [u32; 3] = [1024, 2048, 4096];

    fn validate(bits: u32, max_age_days: i64) -> Result<Self, ConfigError> {
        if !Self::ALLOWED_BITS.contains(&bits) {
            return Err(ConfigError::Invalid {
                key: "SITEKEEPER_TLS_DHPARAMS_BITS",
                reason: format!("must be one of {:?}, got {bits}", Self::ALLOWED_BITS),
            });
        }
        if (1..=6).contains(&max_age_days) || max_age_days >= 721 {
            return Err(ConfigError::Invalid {
                key: "SITEKEEPER_TLS_DHPARAMS_MAX_AGE",
                reason: format!(
                    "must be in [7,720] to enable, or <= -1 to disable; got {max_age_days}"
                ),
            });
        }
        Ok(Self {
            bits,
            max_age_days: (max_age_days >= 7).then_some(max_age_days),
        })
    }
}

/// Authentication configuration for the controller's gRPC/REST surfaces.
/// `psk` and the two JWKS modes are mutually exclusive.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    PreSharedKey(String),
    AzureAd { tenant: String, audience: String },
    Auth0 { domain: String, audience: String },
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub app_root: String,
    pub manifest_file: String,
    pub controller_grpc_addr: String,
    pub controller_api_addr: String,
    pub dhparams: DhParamsConfig,
    pub acme_email: Option<String>,
    pub codesign_required: bool,
    pub state_lock_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment, failing fast on any
    /// invalid value — in particular `secretsEncryptionKey`, which must
    /// decode to exactly 16 bytes before the process binds any listener.
    pub fn from_env() -> Result<(Self, Aes128GcmKey), ConfigError> {
        let secrets_key_b64 = std::env::var("SITEKEEPER_SECRETS_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("SITEKEEPER_SECRETS_ENCRYPTION_KEY"))?;
        let cipher_key = Aes128GcmKey::from_base64(&secrets_key_b64)?;

        let node_name = std::env::var("SITEKEEPER_NODE_NAME")
            .map_err(|_| ConfigError::Missing("SITEKEEPER_NODE_NAME"))?;
        let app_root = env_or("SITEKEEPER_APP_ROOT", "/var/lib/sitekeeper");
        let manifest_file = env_or("SITEKEEPER_MANIFEST_FILE", "manifest.yaml");
        let controller_grpc_addr = env_or("SITEKEEPER_CONTROLLER_GRPC_ADDR", "0.0.0.0:7443");
        let controller_api_addr = env_or("SITEKEEPER_CONTROLLER_API_ADDR", "0.0.0.0:8443");

        let bits: u32 = env_or("SITEKEEPER_TLS_DHPARAMS_BITS", "2048")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "SITEKEEPER_TLS_DHPARAMS_BITS",
                reason: "not a valid integer".to_owned(),
            })?;
        let max_age_days: i64 = env_or("SITEKEEPER_TLS_DHPARAMS_MAX_AGE", "30")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "SITEKEEPER_TLS_DHPARAMS_MAX_AGE",
                reason: "not a valid integer".to_owned(),
            })?;
        let dhparams = DhParamsConfig::validate(bits, max_age_days)?;

        let acme_email = std::env::var("SITEKEEPER_ACME_EMAIL").ok();
        let codesign_required = env_or("SITEKEEPER_CODESIGN_REQUIRED", "false") == "true";
        let state_lock_timeout_secs: u64 = env_or("SITEKEEPER_STATE_LOCK_TIMEOUT_SECS", "40")
            .parse()
            .unwrap_or(40);

        Ok((
            Self {
                node_name,
                app_root,
                manifest_file,
                controller_grpc_addr,
                controller_api_addr,
                dhparams,
                acme_email,
                codesign_required,
                state_lock_timeout: Duration::from_secs(state_lock_timeout_secs),
            },
            cipher_key,
        ))
    }

    /// Which state store backend to use, from `SITEKEEPER_STATE_STORE`
    /// (`file` or `etcd`).
    pub fn state_store_kind() -> Result<StateStoreKind, ConfigError> {
        match env_or("SITEKEEPER_STATE_STORE", "file").as_str() {
            "file" => Ok(StateStoreKind::File {
                path: env_or("SITEKEEPER_STATE_FILE_PATH", "/var/lib/sitekeeper/state.json"),
            }),
            "etcd" => {
                let endpoints = std::env::var("SITEKEEPER_STATE_ETCD_ENDPOINTS")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_STATE_ETCD_ENDPOINTS"))?
                    .split(',')
                    .map(str::trim)
                    .map(str::to_owned)
                    .collect();
                Ok(StateStoreKind::Etcd {
                    endpoints,
                    prefix: env_or("SITEKEEPER_STATE_ETCD_PREFIX", "sitekeeper"),
                })
            }
            other => Err(ConfigError::Invalid {
                key: "SITEKEEPER_STATE_STORE",
                reason: format!("unknown backend '{other}', expected 'file' or 'etcd'"),
            }),
        }
    }

    /// Which object store backend to use, from `SITEKEEPER_REPO_TYPE`
    /// (`file`/`local`, `azure`/`azureblob`, `s3`/`minio`).
    pub fn object_store_kind() -> Result<ObjectStoreKind, ConfigError> {
        match env_or("SITEKEEPER_REPO_TYPE", "file").as_str() {
            "file" | "local" => Ok(ObjectStoreKind::Local {
                path: env_or("SITEKEEPER_REPO_PATH", "/var/lib/sitekeeper/bundles"),
            }),
            "azure" | "azureblob" => Ok(ObjectStoreKind::AzureBlob {
                account: std::env::var("SITEKEEPER_REPO_AZURE_ACCOUNT")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_REPO_AZURE_ACCOUNT"))?,
                container: std::env::var("SITEKEEPER_REPO_AZURE_CONTAINER")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_REPO_AZURE_CONTAINER"))?,
            }),
            "s3" | "minio" => Ok(ObjectStoreKind::S3 {
                bucket: std::env::var("SITEKEEPER_REPO_S3_BUCKET")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_REPO_S3_BUCKET"))?,
                endpoint: std::env::var("SITEKEEPER_REPO_S3_ENDPOINT").ok(),
            }),
            other => Err(ConfigError::Invalid {
                key: "SITEKEEPER_REPO_TYPE",
                reason: format!("unknown backend '{other}'"),
            }),
        }
    }

    /// Authentication mode for the admin surfaces, from `SITEKEEPER_AUTH_MODE`
    /// (`psk`, `azuread`, `auth0`).
    pub fn auth_config() -> Result<AuthConfig, ConfigError> {
        match env_or("SITEKEEPER_AUTH_MODE", "psk").as_str() {
            "psk" => Ok(AuthConfig::PreSharedKey(
                std::env::var("SITEKEEPER_AUTH_PSK")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_AUTH_PSK"))?,
            )),
            "azuread" => Ok(AuthConfig::AzureAd {
                tenant: std::env::var("SITEKEEPER_AUTH_AZUREAD_TENANT")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_AUTH_AZUREAD_TENANT"))?,
                audience: std::env::var("SITEKEEPER_AUTH_AZUREAD_AUDIENCE")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_AUTH_AZUREAD_AUDIENCE"))?,
            }),
            "auth0" => Ok(AuthConfig::Auth0 {
                domain: std::env::var("SITEKEEPER_AUTH_AUTH0_DOMAIN")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_AUTH_AUTH0_DOMAIN"))?,
                audience: std::env::var("SITEKEEPER_AUTH_AUTH0_AUDIENCE")
                    .map_err(|_| ConfigError::Missing("SITEKEEPER_AUTH_AUTH0_AUDIENCE"))?,
            }),
            other => Err(ConfigError::Invalid {
                key: "SITEKEEPER_AUTH_MODE",
                reason: format!("unknown mode '{other}'"),
            }),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhparams_rejects_bits_outside_allowed_set() {
        assert!(DhParamsConfig::validate(1536, 30).is_err());
    }

    #[test]
    fn dhparams_rejects_max_age_in_forbidden_gap() {
        assert!(DhParamsConfig::validate(2048, 3).is_err());
        assert!(DhParamsConfig::validate(2048, 800).is_err());
    }

    #[test]
    fn dhparams_accepts_valid_range() {
        let cfg = DhParamsConfig::validate(2048, 30).unwrap();
        assert_eq!(cfg.max_age_days, Some(30));
    }

    #[test]
    fn dhparams_negative_disables_regeneration() {
        let cfg = DhParamsConfig::validate(2048, -1).unwrap();
        assert_eq!(cfg.max_age_days, None);
    }
}
