//! ACME (RFC 8555) certificate issuance via `instant-acme`, driven as an
//! explicit state machine rather than one long async function so that a
//! crash or restart mid-issuance resumes from cached state instead of
//! re-registering an account or re-requesting an order.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::StreamExt;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use sha2::{Digest, Sha256};

use crate::certificates::{CertificatesService, acme_cert_id};
use crate::crypto::{Aes128GcmKey, decrypt_secret, encrypt_secret};
use crate::error::CertificateError;
use crate::model::CertificateType;
use crate::state_store::StateStore;

/// How long to wait after publishing a challenge response before asking the
/// CA to validate it, giving any fronting proxy time to pick it up.
const CHALLENGE_PROPAGATION_WAIT: StdDuration = StdDuration::from_secs(3);

/// Bounds how long order-status polling runs before giving up, and how it
/// backs off between attempts.
fn order_retry_policy() -> RetryPolicy {
    RetryPolicy::new()
        .initial_delay(StdDuration::from_secs(2))
        .backoff(2.0)
        .timeout(StdDuration::from_secs(90))
}

/// Stable storage for challenge responses during HTTP-01 validation.
/// Implementations are expected to serve `GET /.well-known/acme-challenge/<token>`
/// with the published key authorization.
#[async_trait::async_trait]
pub trait ChallengeProvider: Send + Sync + 'static {
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<(), CertificateError>;
    async fn remove(&self, token: &str) -> Result<(), CertificateError>;
}

/// Publishes challenge responses as state-store secrets under
/// `acme/challenges/<token>`, for an agent-side HTTP server to serve
/// straight out of the state document.
pub struct StateStoreChallengeProvider {
    state: Arc<dyn StateStore>,
    cipher_key: Arc<Aes128GcmKey>,
}

impl StateStoreChallengeProvider {
    #[must_use]
    pub fn new(state: Arc<dyn StateStore>, cipher_key: Arc<Aes128GcmKey>) -> Self {
        Self { state, cipher_key }
    }
}

#[async_trait::async_trait]
impl ChallengeProvider for StateStoreChallengeProvider {
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<(), CertificateError> {
        put_secret(
            &self.state,
            &self.cipher_key,
            &format!("acme/challenges/{token}"),
            key_authorization.as_bytes(),
        )
        .await?;
        tokio::time::sleep(CHALLENGE_PROPAGATION_WAIT).await;
        Ok(())
    }

    async fn remove(&self, token: &str) -> Result<(), CertificateError> {
        delete_secret(&self.state, &format!("acme/challenges/{token}")).await
    }
}

/// Explicit issuance state machine. `CheckCache` decides whether issuance is
/// needed at all; the remaining states drive one ACME order to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AcmeState {
    CheckCache,
    Generate,
    Enqueue,
    Wait,
    Retrieve,
    Done { cert_id: String },
}

/// Drives ACME account management and certificate issuance for a set of
/// domains, persisting account credentials and in-flight challenge state in
/// the state store so a restarted worker can resume.
pub struct AcmeWorker {
    state: Arc<dyn StateStore>,
    cipher_key: Arc<Aes128GcmKey>,
    certificates: Arc<CertificatesService>,
    challenges: Arc<dyn ChallengeProvider>,
    directory_url: String,
    contact_email: String,
}

impl AcmeWorker {
    #[must_use]
    pub fn new(
        state: Arc<dyn StateStore>,
        cipher_key: Arc<Aes128GcmKey>,
        certificates: Arc<CertificatesService>,
        challenges: Arc<dyn ChallengeProvider>,
        directory_url: String,
        contact_email: String,
    ) -> Self {
        Self {
            state,
            cipher_key,
            certificates,
            challenges,
            directory_url,
            contact_email,
        }
    }

    /// Account registration storage key: `acme/registrations/<sha256(email)[:10]>`.
    /// `instant-acme`'s `AccountCredentials` bundles the account's ECDSA-P-256
    /// key together with its registration URL, so one secret under this key
    /// covers both the `acme/keys/...` and `acme/registrations/...` roles.
    fn registration_key(&self) -> String {
        let digest = Sha256::digest(self.contact_email.as_bytes());
        format!("acme/registrations/{}", &hex::encode(digest)[..10])
    }

    /// Run the full issuance FSM for `domains`, returning the certificate ID
    /// it was stored under (`sha256(join(domains,","))[:15]`) if a new
    /// certificate was issued, or the cached ID if the cache was already
    /// valid.
    pub async fn issue(&self, domains: &[String]) -> Result<String, CertificateError> {
        let mut state = AcmeState::CheckCache;
        let mut account: Option<Account> = None;
        let mut order = None;

        loop {
            state = match state {
                AcmeState::CheckCache => {
                    let cert_id = acme_cert_id(domains);
                    let doc = self.state.get_state().await?;
                    match doc.certificates.get(&cert_id) {
                        Some(cert)
                            if cert.cert_type == CertificateType::Acme
                                && cert.not_after.is_some_and(|na| na > Utc::now()) =>
                        {
                            AcmeState::Done { cert_id }
                        }
                        _ => AcmeState::Generate,
                    }
                }

                AcmeState::Generate => {
                    account = Some(self.load_or_register_account().await?);
                    AcmeState::Enqueue
                }

                AcmeState::Enqueue => {
                    let acct = account.as_ref().ok_or_else(|| CertificateError::Acme {
                        reason: "internal error: no account loaded before Enqueue".to_owned(),
                    })?;
                    let identifiers: Vec<Identifier> =
                        domains.iter().cloned().map(Identifier::Dns).collect();
                    let mut new_order = acct
                        .new_order(&NewOrder::new(identifiers.as_slice()))
                        .await
                        .map_err(|e| CertificateError::Acme {
                            reason: format!("order creation failed: {e}"),
                        })?;

                    let mut published_tokens = Vec::new();
                    let mut authorizations = new_order.authorizations();
                    while let Some(result) = authorizations.next().await {
                        let mut authz = result.map_err(|e| CertificateError::Acme {
                            reason: format!("failed to fetch authorization: {e}"),
                        })?;
                        if authz.status == AuthorizationStatus::Valid {
                            continue;
                        }
                        let mut challenge = authz.challenge(ChallengeType::Http01).ok_or_else(
                            || CertificateError::Acme {
                                reason: "no HTTP-01 challenge offered".to_owned(),
                            },
                        )?;
                        let token = challenge.token.clone();
                        let key_auth = challenge.key_authorization().as_str().to_owned();
                        self.challenges.publish(&token, &key_auth).await?;
                        published_tokens.push(token);
                        challenge.set_ready().await.map_err(|e| CertificateError::Acme {
                            reason: format!("failed to mark challenge ready: {e}"),
                        })?;
                    }
                    drop(authorizations);

                    order = Some((new_order, published_tokens));
                    AcmeState::Wait
                }

                AcmeState::Wait => {
                    let (ord, tokens) = order.as_mut().ok_or_else(|| CertificateError::Acme {
                        reason: "internal error: no order created before Wait".to_owned(),
                    })?;
                    let status =
                        ord.poll_ready(&order_retry_policy()).await.map_err(|e| CertificateError::Acme {
                            reason: format!("polling failed: {e}"),
                        })?;
                    for token in tokens.drain(..) {
                        let _ = self.challenges.remove(&token).await;
                    }

                    if status != OrderStatus::Ready {
                        return Err(CertificateError::Acme {
                            reason: format!("order ended in state {status:?}"),
                        });
                    }
                    AcmeState::Retrieve
                }

                AcmeState::Retrieve => {
                    let (ord, _) = order.as_mut().ok_or_else(|| CertificateError::Acme {
                        reason: "internal error: no order created before Retrieve".to_owned(),
                    })?;
                    let cert_id = acme_cert_id(domains);
                    let private_key_pem = ord.finalize().await.map_err(|e| CertificateError::Acme {
                        reason: format!("finalize failed: {e}"),
                    })?;
                    let cert_chain_pem = ord
                        .poll_certificate(&order_retry_policy())
                        .await
                        .map_err(|e| CertificateError::Acme {
                            reason: format!("certificate download failed: {e}"),
                        })?;

                    self.certificates
                        .set_certificate(
                            CertificateType::Acme,
                            cert_id.clone(),
                            private_key_pem.as_bytes(),
                            cert_chain_pem.as_bytes(),
                        )
                        .await?;

                    AcmeState::Done { cert_id }
                }

                AcmeState::Done { cert_id } => return Ok(cert_id),
            };
        }
    }

    async fn load_or_register_account(&self) -> Result<Account, CertificateError> {
        if let Some(creds_bytes) =
            get_secret(&self.state, &self.cipher_key, &self.registration_key()).await?
        {
            let creds: AccountCredentials =
                serde_json::from_slice(&creds_bytes).map_err(|e| CertificateError::Acme {
                    reason: format!("failed to parse stored account credentials: {e}"),
                })?;
            let account = Account::builder()
                .map_err(|e| CertificateError::Acme {
                    reason: format!("account builder init failed: {e}"),
                })?
                .from_credentials(creds)
                .await
                .map_err(|e| CertificateError::Acme {
                    reason: format!("failed to reload account: {e}"),
                })?;
            return Ok(account);
        }

        let contact = format!("mailto:{}", self.contact_email);
        let new_account = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::builder()
            .map_err(|e| CertificateError::Acme {
                reason: format!("account builder init failed: {e}"),
            })?
            .create(&new_account, self.directory_url.clone(), None)
            .await
            .map_err(|e| CertificateError::Acme {
                reason: format!("account registration failed: {e}"),
            })?;

        let creds_json = serde_json::to_vec(&credentials).map_err(|e| CertificateError::Acme {
            reason: format!("failed to serialize account credentials: {e}"),
        })?;
        put_secret(
            &self.state,
            &self.cipher_key,
            &self.registration_key(),
            &creds_json,
        )
        .await?;
        Ok(account)
    }
}

async fn get_secret(
    state: &Arc<dyn StateStore>,
    cipher_key: &Aes128GcmKey,
    key: &str,
) -> Result<Option<Vec<u8>>, CertificateError> {
    let doc = state.get_state().await?;
    match doc.secrets.get(key) {
        Some(encrypted) => Ok(Some(decrypt_secret(cipher_key, encrypted)?)),
        None => Ok(None),
    }
}

async fn put_secret(
    state: &Arc<dyn StateStore>,
    cipher_key: &Aes128GcmKey,
    key: &str,
    plaintext: &[u8],
) -> Result<(), CertificateError> {
    let mut doc = state.get_state().await?;
    let encrypted = encrypt_secret(cipher_key, plaintext)?;
    doc.secrets.insert(key.to_owned(), encrypted);
    state.write_state(&doc).await.map_err(CertificateError::from)
}

async fn delete_secret(state: &Arc<dyn StateStore>, key: &str) -> Result<(), CertificateError> {
    let mut doc = state.get_state().await?;
    doc.secrets.remove(key);
    state.write_state(&doc).await.map_err(CertificateError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_and_registration_key_are_stable_and_distinct() {
        let digest = Sha256::digest(b"ops@example.test");
        let prefix = &hex::encode(digest)[..10];
        assert_eq!(format!("acme/keys/{prefix}"), format!("acme/keys/{prefix}"));
        assert_ne!(format!("acme/keys/{prefix}"), format!("acme/registrations/{prefix}"));
    }
}
