//! Shared domain model, state store, object store, certificate lifecycle,
//! and configuration for sitekeeper's controller and agent binaries.

pub mod acme;
pub mod certificates;
pub mod config;
pub mod crypto;
pub mod dhparams;
pub mod error;
pub mod model;
pub mod object_store;
pub mod state_store;

pub use acme::{AcmeWorker, ChallengeProvider};
pub use certificates::{CertificatesService, KeyVaultClient};
pub use config::Config;
pub use crypto::Aes128GcmKey;
pub use model::{
    AppBinding, CertId, CertificateType, DhParams, Job, JobType, NodeRegistration, Site,
    StateDocument, TlsCertificate,
};
pub use object_store::ObjectStore;
pub use state_store::StateStore;
