//! TOTP secret generation and verification.
//!
//! The engine is a capability trait wired at composition time: production gets
//! the `totp-rs` implementation, tests get a deterministic fake. There is no
//! runtime fallback; a deployment either has a working engine or fails to
//! start.

use anyhow::{anyhow, Result};
use totp_rs::{Algorithm, Secret, TOTP};

/// Accept codes from this many 30s time-steps before/after the current one
/// (±60s of clock drift between server and authenticator).
const TOTP_SKEW_STEPS: u8 = 2;
const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;

/// A freshly generated secret plus everything the enrolling user needs to
/// load it into an authenticator app. Returned to the caller exactly once.
#[derive(Debug)]
pub struct ProvisionedSecret {
    pub secret_base32: String,
    pub provisioning_uri: String,
    pub qr_png_base64: String,
}

/// Capability interface for TOTP generation and verification.
pub trait TotpEngine: Send + Sync {
    /// Generate a fresh secret with a provisioning URI and QR payload for the
    /// given account/issuer labels. Pure generation, no side effects.
    ///
    /// # Errors
    /// Returns an error if secret generation or QR rendering fails.
    fn generate(&self, account: &str, issuer: &str) -> Result<ProvisionedSecret>;

    /// Validate a 6-digit code against a base32 secret within the drift
    /// window. Malformed secrets or codes are rejected as `false`, never
    /// surfaced as errors.
    fn verify(&self, secret_base32: &str, code: &str) -> bool;
}

/// Production engine backed by `totp-rs` (SHA1, 6 digits, 30s step).
#[derive(Clone, Debug, Default)]
pub struct TotpRsEngine;

impl TotpRsEngine {
    fn build(secret_bytes: Vec<u8>, issuer: Option<String>, account: String) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW_STEPS,
            TOTP_STEP_SECONDS,
            secret_bytes,
            issuer,
            account,
        )
        .map_err(|err| anyhow!("TOTP init error: {err}"))
    }
}

impl TotpEngine for TotpRsEngine {
    fn generate(&self, account: &str, issuer: &str) -> Result<ProvisionedSecret> {
        // 20 random bytes of entropy, per RFC 4226 recommendations.
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|err| anyhow!("secret generation error: {err:?}"))?;

        let totp = Self::build(
            secret_bytes,
            Some(issuer.to_string()),
            account.to_string(),
        )?;

        let qr_png_base64 = totp
            .get_qr_base64()
            .map_err(|err| anyhow!("QR render error: {err}"))?;

        Ok(ProvisionedSecret {
            secret_base32: totp.get_secret_base32(),
            provisioning_uri: totp.get_url(),
            qr_png_base64,
        })
    }

    fn verify(&self, secret_base32: &str, code: &str) -> bool {
        let Ok(secret_bytes) = Secret::Encoded(secret_base32.to_string()).to_bytes() else {
            return false;
        };
        let Ok(totp) = Self::build(secret_bytes, None, "account".to_string()) else {
            return false;
        };
        totp.check_current(code.trim()).unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ProvisionedSecret, TotpEngine};
    use anyhow::Result;

    /// Deterministic engine for tests: accepts exactly one configured code.
    pub(crate) struct FixedCodeEngine {
        pub(crate) secret: String,
        pub(crate) code: String,
    }

    impl FixedCodeEngine {
        pub(crate) fn new(secret: &str, code: &str) -> Self {
            Self {
                secret: secret.to_string(),
                code: code.to_string(),
            }
        }
    }

    impl TotpEngine for FixedCodeEngine {
        fn generate(&self, account: &str, issuer: &str) -> Result<ProvisionedSecret> {
            Ok(ProvisionedSecret {
                secret_base32: self.secret.clone(),
                provisioning_uri: format!(
                    "otpauth://totp/{issuer}:{account}?secret={}&issuer={issuer}",
                    self.secret
                ),
                qr_png_base64: "ZmFrZS1xcg".to_string(),
            })
        }

        fn verify(&self, secret_base32: &str, code: &str) -> bool {
            secret_base32 == self.secret && code == self.code
        }
    }
}
