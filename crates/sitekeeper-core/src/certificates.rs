//! The certificates service: resolves a certificate ID to a (key, cert) PEM
//! pair, manages the self-signed generator, and drives ACME issuance.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey as _;
use sha2::{Digest, Sha256};

use crate::crypto::{Aes128GcmKey, decrypt_secret, encrypt_secret};
use crate::error::CertificateError;
use crate::model::{CertId, CertificateType, Site, StateDocument, TlsCertificate};
use crate::state_store::StateStore;

/// Minimum remaining validity a certificate about to be served must have.
pub const MIN_REMAINING_VALIDITY_HOURS: i64 = 12;

/// Self-signed certs are regenerated once fewer than this many days remain.
pub const SELF_SIGNED_RENEWAL_WINDOW_DAYS: i64 = 7;

/// External collaborator: resolves an Azure Key Vault certificate reference
/// to PEM material. The vault client's own transport/auth internals are
/// explicitly out of scope for this service; callers inject an
/// implementation.
#[async_trait::async_trait]
pub trait KeyVaultClient: Send + Sync + 'static {
    /// `selector` is `<name>` or `<name>/<version>`.
    async fn fetch_pem(&self, selector: &str) -> Result<(Vec<u8>, Vec<u8>), CertificateError>;
}

/// Resolves certificate IDs to PEM material and manages the certificate
/// lifecycle (self-signed generation, imports, replacement on renewal).
pub struct CertificatesService {
    state: Arc<dyn StateStore>,
    cipher_key: Arc<Aes128GcmKey>,
    key_vault: Option<Arc<dyn KeyVaultClient>>,
}

impl CertificatesService {
    pub fn new(
        state: Arc<dyn StateStore>,
        cipher_key: Arc<Aes128GcmKey>,
        key_vault: Option<Arc<dyn KeyVaultClient>>,
    ) -> Self {
        Self {
            state,
            cipher_key,
            key_vault,
        }
    }

    /// Resolve a certificate ID to decrypted key PEM and certificate PEM.
    pub async fn get_certificate(&self, cert_id: &str) -> Result<(Vec<u8>, Vec<u8>), CertificateError> {
        let doc = self.state.get_state().await?;
        let cert = doc
            .certificates
            .get(cert_id)
            .ok_or_else(|| CertificateError::NotFound {
                id: cert_id.to_owned(),
            })?;

        match cert.cert_type {
            CertificateType::AzureKeyVault => {
                let name = cert.name.as_deref().ok_or_else(|| CertificateError::InvalidData {
                    id: cert_id.to_owned(),
                    reason: "AZURE_KEY_VAULT certificate missing name".to_owned(),
                })?;
                let client = self.key_vault.as_ref().ok_or_else(|| CertificateError::KeyVault {
                    name: name.to_owned(),
                    reason: "no key vault client configured".to_owned(),
                })?;
                client.fetch_pem(name).await
            }
            _ => {
                let encrypted_key = cert.key.as_ref().ok_or_else(|| CertificateError::InvalidData {
                    id: cert_id.to_owned(),
                    reason: "missing key material".to_owned(),
                })?;
                let certificate = cert.certificate.clone().ok_or_else(|| CertificateError::InvalidData {
                    id: cert_id.to_owned(),
                    reason: "missing certificate material".to_owned(),
                })?;
                let key = decrypt_secret(&self.cipher_key, encrypted_key)?;
                let site_names: HashSet<&str> = doc
                    .sites
                    .iter()
                    .filter(|s| s.effective_tls_id().map(String::as_str) == Some(cert_id))
                    .flat_map(Site::all_names)
                    .collect();
                self.warn_if_unservable(cert_id, cert, &site_names);
                Ok((key, certificate))
            }
        }
    }

    /// Checks the inspection rule for a certificate about to be served:
    /// `NotBefore` must not be in the future, `NotAfter` must be at least
    /// [`MIN_REMAINING_VALIDITY_HOURS`] away, and (unless the certificate's
    /// type is exempt per [`TlsCertificate::skips_dns_name_check`]) its
    /// recorded domains must cover every name the referencing site serves.
    /// Never fails the request — these are observability warnings, not
    /// guards; the agent that actually terminates TLS is the enforcement
    /// point.
    fn warn_if_unservable(&self, cert_id: &str, cert: &TlsCertificate, site_names: &HashSet<&str>) {
        let now = Utc::now();
        if let Some(not_before) = cert.not_before {
            if not_before > now {
                tracing::warn!(cert_id, %not_before, "serving certificate whose NotBefore is still in the future");
            }
        }
        if let Some(not_after) = cert.not_after {
            if not_after < now + Duration::hours(MIN_REMAINING_VALIDITY_HOURS) {
                tracing::warn!(
                    cert_id,
                    not_after = %not_after,
                    "serving certificate with less than {}h of remaining validity",
                    MIN_REMAINING_VALIDITY_HOURS
                );
            }
        }
        if !cert.skips_dns_name_check() && !site_names.is_empty() {
            let cert_names: HashSet<&str> = cert
                .domains
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(String::as_str)
                .collect();
            if !site_names.is_subset(&cert_names) {
                tracing::warn!(
                    cert_id,
                    "serving certificate whose domains do not cover all names of the site(s) bound to it"
                );
            }
        }
    }

    /// Store a certificate's key (plaintext PEM, to be encrypted) and
    /// certificate (PEM). Extracts `NotBefore`/`NotAfter`/SANs from the
    /// X.509 data. Never bumps `Version` — pure certificate writes touch no
    /// site.
    pub async fn set_certificate(
        &self,
        cert_type: CertificateType,
        cert_id: CertId,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> Result<(), CertificateError> {
        let (not_before, not_after, domains) = parse_x509_metadata(cert_pem)?;
        let encrypted_key = encrypt_secret(&self.cipher_key, key_pem)?;

        let mut doc = self.state.get_state().await?;
        doc.certificates.insert(
            cert_id,
            TlsCertificate {
                cert_type,
                name: None,
                domains: Some(domains),
                not_before: Some(not_before),
                not_after: Some(not_after),
                key: Some(encrypted_key),
                certificate: Some(cert_pem.to_vec()),
            },
        );
        self.state.write_state(&doc).await.map_err(CertificateError::from)
    }

    /// Delete a certificate. Refuses if any site still references it.
    pub async fn delete_certificate(&self, cert_id: &str) -> Result<(), CertificateError> {
        let mut doc = self.state.get_state().await?;
        if doc.certificate_is_referenced(cert_id) {
            return Err(CertificateError::StillReferenced {
                id: cert_id.to_owned(),
            });
        }
        if doc.certificates.remove(cert_id).is_none() {
            return Err(CertificateError::NotFound {
                id: cert_id.to_owned(),
            });
        }
        self.state.write_state(&doc).await.map_err(CertificateError::from)
    }

    /// Used by the renewal worker: rewrite every site bound to `old_id` via
    /// `generated_tls_id` to point at `new_id`, then delete the old entry.
    /// Bumps `Version` (sites change).
    pub async fn replace_certificate(&self, old_id: &str, new_id: &str) -> Result<(), CertificateError> {
        let mut doc: StateDocument = self.state.get_state().await?;
        let old_type = doc
            .certificates
            .get(old_id)
            .ok_or_else(|| CertificateError::NotFound {
                id: old_id.to_owned(),
            })?
            .cert_type;
        if old_type == CertificateType::Imported {
            return Err(CertificateError::WrongType {
                id: old_id.to_owned(),
                actual: "IMPORTED".to_owned(),
            });
        }
        if !doc.certificates.contains_key(new_id) {
            return Err(CertificateError::NotFound {
                id: new_id.to_owned(),
            });
        }
        for site in &mut doc.sites {
            if site.generated_tls_id.as_deref() == Some(old_id) {
                site.generated_tls_id = Some(new_id.to_owned());
            }
        }
        doc.certificates.remove(old_id);
        self.state
            .set_state(doc)
            .await
            .map(|_| ())
            .map_err(CertificateError::from)
    }

    /// Generate an RSA-2048 self-signed certificate valid for one year, with
    /// SANs covering `domains`. Issuer common name is fixed per the cluster
    /// convention.
    pub fn generate_self_signed(domains: &[String]) -> Result<(Vec<u8>, Vec<u8>), CertificateError> {
        let mut rng = rand::thread_rng();
        let private_key =
            RsaPrivateKey::new(&mut rng, 2048).map_err(|e| CertificateError::Generation {
                reason: format!("RSA key generation failed: {e}"),
            })?;
        let key_der = private_key
            .to_pkcs8_der()
            .map_err(|e| CertificateError::Generation {
                reason: format!("failed to encode key: {e}"),
            })?;
        let key_pair = rcgen::KeyPair::from_der(key_der.as_bytes()).map_err(|e| {
            CertificateError::Generation {
                reason: format!("failed to wrap key for cert generation: {e}"),
            }
        })?;

        let mut params = rcgen::CertificateParams::new(domains.to_vec()).map_err(|e| {
            CertificateError::Generation {
                reason: format!("failed to build cert params: {e}"),
            }
        })?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "sitekeeper self-signed");
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2120, 1, 1);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateError::Generation {
                reason: format!("self-signing failed: {e}"),
            })?;

        Ok((key_pair.serialize_pem().into_bytes(), cert.pem().into_bytes()))
    }

    /// Whether a self-signed certificate needs rotation.
    #[must_use]
    pub fn self_signed_needs_renewal(cert: &TlsCertificate, now: DateTime<Utc>) -> bool {
        cert.cert_type == CertificateType::SelfSigned
            && cert
                .not_after
                .is_none_or(|na| na - now < Duration::days(SELF_SIGNED_RENEWAL_WINDOW_DAYS))
    }
}

/// Derive the deterministic certificate ID the ACME worker uses for a bundle
/// of domains: `sha256(join(domains, ","))[:15]`.
#[must_use]
pub fn acme_cert_id(domains: &[String]) -> String {
    let joined = domains.join(",");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)[..15].to_owned()
}

fn parse_x509_metadata(
    cert_pem: &[u8],
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<String>), CertificateError> {
    let pem_str = std::str::from_utf8(cert_pem).map_err(|e| CertificateError::InvalidData {
        id: String::new(),
        reason: format!("certificate is not valid UTF-8 PEM: {e}"),
    })?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_str.as_bytes()).map_err(|e| {
        CertificateError::InvalidData {
            id: String::new(),
            reason: format!("failed to parse PEM: {e}"),
        }
    })?;
    let cert = pem.parse_x509().map_err(|e| CertificateError::InvalidData {
        id: String::new(),
        reason: format!("failed to parse X.509: {e}"),
    })?;

    let not_before = x509_time_to_chrono(cert.validity().not_before)?;
    let not_after = x509_time_to_chrono(cert.validity().not_after)?;

    let domains = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    x509_parser::extensions::GeneralName::DNSName(dns) => Some((*dns).to_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok((not_before, not_after, domains))
}

fn x509_time_to_chrono(t: x509_parser::time::ASN1Time) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(t.timestamp(), 0).ok_or_else(|| CertificateError::InvalidData {
        id: String::new(),
        reason: "certificate timestamp out of range".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acme_cert_id_is_deterministic_and_15_chars() {
        let domains = vec!["a.test".to_owned(), "b.test".to_owned()];
        let id1 = acme_cert_id(&domains);
        let id2 = acme_cert_id(&domains);
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 15);
    }

    #[test]
    fn acme_cert_id_differs_for_different_domain_sets() {
        let a = acme_cert_id(&["a.test".to_owned()]);
        let b = acme_cert_id(&["b.test".to_owned()]);
        assert_ne!(a, b);
    }

    #[test]
    fn self_signed_needs_renewal_within_window() {
        let cert = TlsCertificate {
            cert_type: CertificateType::SelfSigned,
            name: None,
            domains: None,
            not_before: None,
            not_after: Some(Utc::now() + Duration::days(5)),
            key: Some(vec![1]),
            certificate: Some(vec![2]),
        };
        assert!(CertificatesService::self_signed_needs_renewal(&cert, Utc::now()));
    }

    #[test]
    fn self_signed_does_not_need_renewal_far_from_expiry() {
        let cert = TlsCertificate {
            cert_type: CertificateType::SelfSigned,
            name: None,
            domains: None,
            not_before: None,
            not_after: Some(Utc::now() + Duration::days(90)),
            key: Some(vec![1]),
            certificate: Some(vec![2]),
        };
        assert!(!CertificatesService::self_signed_needs_renewal(&cert, Utc::now()));
    }
}
