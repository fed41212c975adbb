//! PSK/JWT authentication, shared between the gRPC `Channel`/`GetState`/
//! `GetTlsCertificate` handlers and the admin REST surface.
//!
//! `GetClusterOptions` is the one RPC exempt from this check (§6's
//! allow-list) — tonic's `Interceptor` wraps a whole service uniformly, so
//! rather than force that one exemption through the interceptor seam, the
//! check is a plain async method invoked from every handler that needs it
//! and skipped by the one that doesn't. The REST surface's
//! `axum::middleware::from_fn_with_state` layer (`middleware.rs`-equivalent
//! in the teacher) calls the same method uniformly, since every admin route
//! requires auth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use subtle::ConstantTimeEq as _;
use tokio::sync::RwLock;

use sitekeeper_core::config::AuthConfig;

/// How long a fetched JWKS is trusted before being re-fetched.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("failed to fetch signing keys: {0}")]
    Jwks(String),

    #[error("unknown signing key id")]
    UnknownKeyId,
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// Validates bearer tokens against the configured auth mode. PSK and JWKS
/// modes are mutually exclusive, matching the teacher's pattern of one
/// active backend selected at startup rather than a chain of validators.
pub struct Authenticator {
    config: AuthConfig,
    http: reqwest::Client,
    jwks: RwLock<Option<JwksCache>>,
}

impl Authenticator {
    #[must_use]
    pub fn new(config: AuthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            jwks: RwLock::new(None),
        })
    }

    /// Validates a raw bearer token (the `Bearer <token>` prefix already
    /// stripped by the caller).
    pub async fn authenticate(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        match &self.config {
            AuthConfig::PreSharedKey(psk) => {
                if bool::from(token.as_bytes().ct_eq(psk.as_bytes())) {
                    Ok(())
                } else {
                    Err(AuthError::InvalidToken("pre-shared key mismatch".to_owned()))
                }
            }
            AuthConfig::AzureAd { tenant, audience } => {
                let jwks_url = format!(
                    "https://login.microsoftonline.com/{tenant}/discovery/v2.0/keys"
                );
                let issuer = format!("https://login.microsoftonline.com/{tenant}/v2.0");
                self.validate_jwt(token, &jwks_url, &issuer, audience).await
            }
            AuthConfig::Auth0 { domain, audience } => {
                let jwks_url = format!("https://{domain}/.well-known/jwks.json");
                let issuer = format!("https://{domain}/");
                self.validate_jwt(token, &jwks_url, &issuer, audience).await
            }
        }
    }

    async fn validate_jwt(
        &self,
        token: &str,
        jwks_url: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<(), AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header.kid.ok_or(AuthError::UnknownKeyId)?;

        let key = self.decoding_key(jwks_url, &kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);

        decode::<HashMap<String, serde_json::Value>>(token, &key, &validation)
            .map(|_| ())
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    async fn decoding_key(&self, jwks_url: &str, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    if let Some(key) = cached.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        let refreshed = self.fetch_jwks(jwks_url).await?;
        let key = refreshed.get(kid).cloned().ok_or(AuthError::UnknownKeyId);
        *self.jwks.write().await = Some(JwksCache {
            keys: refreshed,
            fetched_at: Instant::now(),
        });
        key
    }

    async fn fetch_jwks(&self, jwks_url: &str) -> Result<HashMap<String, DecodingKey>, AuthError> {
        let body = self
            .http
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in body.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            if let AlgorithmParameters::RSA(rsa) = &jwk.algorithm {
                if let Ok(key) = DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                    keys.insert(kid, key);
                }
            }
        }
        Ok(keys)
    }
}
