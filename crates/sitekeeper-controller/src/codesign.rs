//! The cluster-wide code-signing public key, used only to hand its raw
//! modulus/exponent to agents via `GetClusterOptions`. Verification itself
//! happens agent-side against bundle signatures.

use rsa::pkcs1::DecodeRsaPublicKey as _;
use rsa::traits::PublicKeyParts as _;
use rsa::RsaPublicKey;

/// Raw big-endian modulus (`n`) and exponent (`e`) of the cluster
/// code-signing key, as handed out verbatim over `GetClusterOptions`.
#[derive(Debug, Clone)]
pub struct CodesignKey {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
}

/// Errors loading the code-signing public key from configuration.
#[derive(Debug, thiserror::Error)]
pub enum CodesignKeyError {
    #[error("SITEKEEPER_CODESIGN_PUBLIC_KEY is not a valid PKCS#1 RSA public key PEM: {0}")]
    InvalidPem(rsa::pkcs1::Error),
}

impl CodesignKey {
    /// Loads `SITEKEEPER_CODESIGN_PUBLIC_KEY` (a PKCS#1 `"RSA PUBLIC KEY"`
    /// PEM block) if present. Absent entirely means the cluster does not
    /// require code signing; `codesign.required` still governs whether
    /// agents treat an unsigned bundle as fatal.
    pub fn from_env() -> Result<Option<Self>, CodesignKeyError> {
        let Ok(pem) = std::env::var("SITEKEEPER_CODESIGN_PUBLIC_KEY") else {
            return Ok(None);
        };
        let key = RsaPublicKey::from_pkcs1_pem(&pem).map_err(CodesignKeyError::InvalidPem)?;
        Ok(Some(Self {
            n: key.n().to_bytes_be(),
            e: key.e().to_bytes_be(),
        }))
    }
}
