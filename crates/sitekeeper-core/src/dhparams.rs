//! Diffie-Hellman parameter generation for the agent TLS listener's
//! ephemeral key exchange. RustCrypto has no maintained classic
//! (finite-field) DH parameter generator, so this one module reaches for
//! `openssl` instead — the rest of the workspace stays on the RustCrypto
//! stack.

use chrono::Utc;

use crate::model::DhParams;

/// Fixed generator used for every DH parameter set, per convention.
const GENERATOR: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum DhParamsError {
    #[error("dhparams generation failed: {0}")]
    Generation(#[from] openssl::error::ErrorStack),

    #[error("dhparams PEM encoding failed: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Generates a fresh safe-prime DH parameter set at the given bit size
/// (`1024`, `2048`, or `4096`, validated by `DhParamsConfig`).
pub fn generate(bits: u32) -> Result<DhParams, DhParamsError> {
    let dh = openssl::dh::Dh::generate_params(bits, GENERATOR.unsigned_abs())?;
    let pem = String::from_utf8(dh.params_to_pem()?)?;
    Ok(DhParams {
        pem,
        date: Utc::now(),
    })
}

/// Whether the given parameter set is absent or older than `max_age_days`.
#[must_use]
pub fn needs_regeneration(current: Option<&DhParams>, max_age_days: Option<i64>) -> bool {
    let Some(max_age_days) = max_age_days else {
        return false;
    };
    match current {
        None => true,
        Some(dh) => {
            let age = Utc::now().signed_duration_since(dh.date);
            age.num_days() >= max_age_days
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_params_need_regeneration() {
        assert!(needs_regeneration(None, Some(30)));
    }

    #[test]
    fn disabled_regeneration_never_fires() {
        let dh = DhParams {
            pem: String::new(),
            date: Utc::now() - chrono::Duration::days(10_000),
        };
        assert!(!needs_regeneration(Some(&dh), None));
    }

    #[test]
    fn fresh_params_do_not_need_regeneration() {
        let dh = DhParams {
            pem: String::new(),
            date: Utc::now(),
        };
        assert!(!needs_regeneration(Some(&dh), Some(30)));
    }
}
