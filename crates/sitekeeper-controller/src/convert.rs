//! Conversions between the `sitekeeper-core` domain model and the
//! `prost`-generated wire types, kept in one place so the gRPC handlers in
//! `grpc.rs` stay focused on RPC flow rather than field mapping.

use sitekeeper_core::model::{CertificateType, DhParams, Site, StateDocument, TlsCertificate};
use sitekeeper_proto as pb;

/// `StateDocument` as handed to agents: `secrets` is always stripped.
#[must_use]
pub fn state_document_to_message(doc: &StateDocument) -> pb::StateMessage {
    pb::StateMessage {
        version: doc.version,
        sites: doc.sites.iter().map(site_to_proto).collect(),
        certificates: doc
            .certificates
            .iter()
            .map(|(id, cert)| (id.clone(), certificate_to_meta(cert)))
            .collect(),
        dh_params: doc.dh_params.as_ref().map(dhparams_to_proto),
    }
}

fn site_to_proto(site: &Site) -> pb::Site {
    pb::Site {
        domain: site.domain.clone(),
        aliases: site.aliases.clone(),
        client_caching: site.client_caching,
        temporary: site.temporary,
        imported_tls_id: site.imported_tls_id.clone(),
        generated_tls_id: site.generated_tls_id.clone(),
        app_name: site.app.as_ref().map(|a| a.name.clone()),
    }
}

fn certificate_to_meta(cert: &TlsCertificate) -> pb::TlsCertificateMeta {
    pb::TlsCertificateMeta {
        r#type: certificate_type_to_proto(cert.cert_type) as i32,
        name: cert.name.clone(),
        domains: cert.domains.clone().unwrap_or_default(),
        not_before_unix: cert.not_before.map(|t| t.timestamp()),
        not_after_unix: cert.not_after.map(|t| t.timestamp()),
    }
}

fn certificate_type_to_proto(t: CertificateType) -> pb::CertificateType {
    match t {
        CertificateType::Imported => pb::CertificateType::Imported,
        CertificateType::SelfSigned => pb::CertificateType::SelfSigned,
        CertificateType::Acme => pb::CertificateType::Acme,
        CertificateType::AzureKeyVault => pb::CertificateType::AzureKeyVault,
    }
}

fn dhparams_to_proto(dh: &DhParams) -> pb::DhParams {
    pb::DhParams {
        pem: dh.pem.clone(),
        date_unix: dh.date.timestamp(),
    }
}
