//! The desired-state data model: `StateDocument`, `Site`, `TLSCertificate`,
//! and the ancillary types that live alongside it in the state store
//! (node registrations, locks, jobs).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved domain name: no site may use this as its `domain` or an alias.
pub const DEFAULT_DOMAIN: &str = "_default";

/// Opaque identifier for a [`TLSCertificate`] within [`StateDocument::certificates`].
pub type CertId = String;

/// The root desired-state document, owned by the state store under the
/// `"state"` lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u64,
    pub sites: Vec<Site>,
    pub certificates: HashMap<CertId, TlsCertificate>,
    pub dh_params: Option<DhParams>,
    /// AES-GCM-128 ciphertexts, `nonce (12 bytes) || ciphertext || tag`.
    pub secrets: HashMap<String, Vec<u8>>,
}

impl StateDocument {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Self::default()
        }
    }

    /// Every domain and alias currently registered, across all sites.
    #[must_use]
    pub fn all_names(&self) -> HashSet<&str> {
        self.sites
            .iter()
            .flat_map(|s| std::iter::once(s.domain.as_str()).chain(s.aliases.iter().map(String::as_str)))
            .collect()
    }

    #[must_use]
    pub fn find_site(&self, domain: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.domain == domain)
    }

    #[must_use]
    pub fn find_site_mut(&mut self, domain: &str) -> Option<&mut Site> {
        self.sites.iter_mut().find(|s| s.domain == domain)
    }

    /// Whether any site references the given certificate, via either the
    /// imported or generated TLS binding.
    #[must_use]
    pub fn certificate_is_referenced(&self, cert_id: &str) -> bool {
        self.sites.iter().any(|s| {
            s.imported_tls_id.as_deref() == Some(cert_id)
                || s.generated_tls_id.as_deref() == Some(cert_id)
        })
    }
}

/// A single hosted site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub client_caching: bool,
    #[serde(default)]
    pub temporary: bool,
    pub imported_tls_id: Option<CertId>,
    pub generated_tls_id: Option<CertId>,
    pub app: Option<AppBinding>,
}

impl Site {
    /// The certificate that should be served for this site: imported wins
    /// over generated when both are set.
    #[must_use]
    pub fn effective_tls_id(&self) -> Option<&CertId> {
        self.imported_tls_id.as_ref().or(self.generated_tls_id.as_ref())
    }

    /// `{domain} ∪ aliases`, as required for DNS name validation.
    #[must_use]
    pub fn all_names(&self) -> HashSet<&str> {
        std::iter::once(self.domain.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppBinding {
    pub name: String,
}

/// The kind of TLS material backing a [`TlsCertificate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateType {
    Imported,
    SelfSigned,
    Acme,
    AzureKeyVault,
}

/// A TLS certificate, in one of four representations. Dispatch over the
/// variant lives in the certificates service, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertificate {
    #[serde(rename = "type")]
    pub cert_type: CertificateType,
    /// `<name>[/<version>]` selector, set only for `AzureKeyVault`.
    pub name: Option<String>,
    /// Cached from the X.509 SANs; absent for `AzureKeyVault`.
    pub domains: Option<Vec<String>>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Encrypted PEM private key. Absent for `AzureKeyVault`.
    pub key: Option<Vec<u8>>,
    /// PEM certificate, stored in the clear. Absent for `AzureKeyVault`.
    pub certificate: Option<Vec<u8>>,
}

impl TlsCertificate {
    /// Structural validation per the invariant: inline-data variants must
    /// carry key+cert, `AzureKeyVault` must carry a name and no inline data.
    pub fn validate(&self) -> Result<(), String> {
        match self.cert_type {
            CertificateType::Imported | CertificateType::SelfSigned | CertificateType::Acme => {
                if self.key.is_none() || self.certificate.is_none() {
                    return Err(format!(
                        "{:?} certificate must carry both key and certificate",
                        self.cert_type
                    ));
                }
            }
            CertificateType::AzureKeyVault => {
                if self.name.is_none() {
                    return Err("AZURE_KEY_VAULT certificate must carry a name".to_owned());
                }
                if self.key.is_some() || self.certificate.is_some() {
                    return Err(
                        "AZURE_KEY_VAULT certificate must not carry inline key/certificate data"
                            .to_owned(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Certificates whose `domains` need not match the site's name set
    /// (they may legitimately be wildcards sourced externally).
    #[must_use]
    pub fn skips_dns_name_check(&self) -> bool {
        matches!(
            self.cert_type,
            CertificateType::Imported | CertificateType::AzureKeyVault
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhParams {
    pub pem: String,
    pub date: DateTime<Utc>,
}

/// An ephemeral node registration, TTL-bound to the agent's open channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub node_name: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_version: u64,
}

/// A typed job living in the persistent queue until completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    TlsCert,
    Acme,
    DhparamsRegen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_tls_id_prefers_imported() {
        let site = Site {
            domain: "ex.test".into(),
            aliases: vec![],
            client_caching: false,
            temporary: false,
            imported_tls_id: Some("imported-1".into()),
            generated_tls_id: Some("generated-1".into()),
            app: None,
        };
        assert_eq!(site.effective_tls_id(), Some(&"imported-1".to_owned()));
    }

    #[test]
    fn azure_key_vault_rejects_inline_data() {
        let cert = TlsCertificate {
            cert_type: CertificateType::AzureKeyVault,
            name: Some("my-cert".into()),
            domains: None,
            not_before: None,
            not_after: None,
            key: Some(vec![1, 2, 3]),
            certificate: None,
        };
        assert!(cert.validate().is_err());
    }

    #[test]
    fn self_signed_requires_key_and_certificate() {
        let cert = TlsCertificate {
            cert_type: CertificateType::SelfSigned,
            name: None,
            domains: None,
            not_before: None,
            not_after: None,
            key: None,
            certificate: Some(vec![1]),
        };
        assert!(cert.validate().is_err());
    }

    #[test]
    fn certificate_is_referenced_checks_both_bindings() {
        let mut doc = StateDocument::new();
        doc.sites.push(Site {
            domain: "ex.test".into(),
            aliases: vec![],
            client_caching: false,
            temporary: false,
            imported_tls_id: None,
            generated_tls_id: Some("cert-a".into()),
            app: None,
        });
        assert!(doc.certificate_is_referenced("cert-a"));
        assert!(!doc.certificate_is_referenced("cert-b"));
    }
}
