//! Conversions from the `prost`-generated wire types received over the
//! controller channel into the types the reconciliation engine works with.
//! The agent-side mirror of `sitekeeper-controller::convert`, but in the
//! opposite direction, and with its own lightweight certificate-metadata
//! type: a `TlsCertificate` carrying `Key`/`Certificate` doesn't fit data
//! that, by design, never travels with key material attached.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sitekeeper_core::model::{AppBinding, CertificateType, DhParams, Site};
use sitekeeper_proto as pb;

/// Metadata-only view of a certificate, as pushed over `StateMessage`. The
/// key and certificate PEMs themselves are fetched on demand, per site,
/// via `GetTlsCertificate`.
#[derive(Debug, Clone)]
pub struct CertMeta {
    pub cert_type: CertificateType,
    pub name: Option<String>,
    pub domains: Option<Vec<String>>,
    pub not_after: Option<DateTime<Utc>>,
}

/// The desired state as the agent understands it: sites plus enough
/// certificate metadata to know when to re-fetch PEM material.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub version: u64,
    pub sites: Vec<Site>,
    pub certificates: HashMap<String, CertMeta>,
    pub dh_params: Option<DhParams>,
}

#[must_use]
pub fn message_to_state(msg: pb::StateMessage) -> DesiredState {
    DesiredState {
        version: msg.version,
        sites: msg.sites.into_iter().map(proto_site_to_core).collect(),
        certificates: msg
            .certificates
            .into_iter()
            .map(|(id, meta)| (id, proto_meta_to_core(meta)))
            .collect(),
        dh_params: msg.dh_params.map(proto_dhparams_to_core),
    }
}

fn proto_site_to_core(site: pb::Site) -> Site {
    Site {
        domain: site.domain,
        aliases: site.aliases,
        client_caching: site.client_caching,
        temporary: site.temporary,
        imported_tls_id: site.imported_tls_id,
        generated_tls_id: site.generated_tls_id,
        app: site.app_name.map(|name| AppBinding { name }),
    }
}

fn proto_meta_to_core(meta: pb::TlsCertificateMeta) -> CertMeta {
    CertMeta {
        cert_type: proto_certificate_type_to_core(meta.r#type),
        name: meta.name,
        domains: (!meta.domains.is_empty()).then_some(meta.domains),
        not_after: meta.not_after_unix.and_then(|t| DateTime::from_timestamp(t, 0)),
    }
}

fn proto_certificate_type_to_core(raw: i32) -> CertificateType {
    match pb::CertificateType::try_from(raw).unwrap_or(pb::CertificateType::Unspecified) {
        pb::CertificateType::Imported => CertificateType::Imported,
        pb::CertificateType::Acme => CertificateType::Acme,
        pb::CertificateType::AzureKeyVault => CertificateType::AzureKeyVault,
        pb::CertificateType::SelfSigned | pb::CertificateType::Unspecified => {
            CertificateType::SelfSigned
        }
    }
}

fn proto_dhparams_to_core(dh: pb::DhParams) -> DhParams {
    DhParams {
        pem: dh.pem,
        date: DateTime::from_timestamp(dh.date_unix, 0).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_conversion_maps_app_name_to_binding() {
        let site = pb::Site {
            domain: "ex.test".into(),
            aliases: vec!["www.ex.test".into()],
            client_caching: true,
            temporary: false,
            imported_tls_id: None,
            generated_tls_id: Some("cert-1".into()),
            app_name: Some("demo".into()),
        };
        let core = proto_site_to_core(site);
        assert_eq!(core.app.as_ref().map(|a| a.name.as_str()), Some("demo"));
        assert_eq!(core.generated_tls_id.as_deref(), Some("cert-1"));
    }

    #[test]
    fn empty_domains_become_none() {
        let meta = pb::TlsCertificateMeta {
            r#type: pb::CertificateType::SelfSigned as i32,
            name: None,
            domains: vec![],
            not_before_unix: None,
            not_after_unix: None,
        };
        assert!(proto_meta_to_core(meta).domains.is_none());
    }
}
