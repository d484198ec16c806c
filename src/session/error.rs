//! Error taxonomy for the authentication core.
//!
//! Verification failures are deliberately generic: the caller learns that a
//! credential or code was rejected, never which check failed or whether an
//! account exists. Infrastructure failures carry full detail for server-side
//! logging but are surfaced to callers as opaque errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown email or wrong password. Never distinguishes the two.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Bad TOTP code or backup code. Never distinguishes the two.
    #[error("invalid code")]
    InvalidMfaCode,

    #[error("multi-factor authentication is already enabled")]
    MfaAlreadyEnabled,

    #[error("multi-factor authentication is not enabled")]
    MfaNotEnabled,

    /// The user's role requires MFA; disablement is refused.
    #[error("multi-factor authentication is required for this role")]
    MfaRequiredByPolicy,

    /// Too many attempts from this caller.
    #[error("too many requests")]
    RateLimited,

    /// The credential store failed. Fatal to the request, logged in full.
    #[error("credential store unavailable")]
    Store(#[source] anyhow::Error),

    /// Signing-key misconfiguration. Fatal, never user-caused.
    #[error("token signing failed")]
    TokenSigning(#[source] anyhow::Error),

    /// TOTP engine or backup-code hashing failure. Infrastructure, not input.
    #[error("second-factor engine failure")]
    Engine(#[source] anyhow::Error),

    /// Required server-side secret or setting is missing.
    #[error("server misconfiguration: {0}")]
    Misconfigured(&'static str),
}

impl AuthError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        Self::Store(err)
    }

    /// True for the expected, retryable-by-the-user rejections.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::InvalidMfaCode)
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;

    #[test]
    fn rejection_classification() {
        assert!(AuthError::InvalidCredentials.is_rejection());
        assert!(AuthError::InvalidMfaCode.is_rejection());
        assert!(!AuthError::MfaRequiredByPolicy.is_rejection());
        assert!(!AuthError::Store(anyhow::anyhow!("down")).is_rejection());
    }

    #[test]
    fn messages_leak_no_detail() {
        assert_eq!(
            AuthError::InvalidCredentials.to_string(),
            "invalid credentials"
        );
        assert_eq!(AuthError::InvalidMfaCode.to_string(), "invalid code");
    }
}
