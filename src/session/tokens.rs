//! Token issuance: PASETO v4.public access tokens and random refresh tokens.
//!
//! Access tokens are self-contained and carry the session version observed at
//! issuance; bumping the stored version invalidates every previously issued
//! token without a revocation list. Refresh tokens are opaque random values;
//! only their SHA-256 hash is ever persisted, so a database compromise does
//! not yield usable tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::keys::{AsymmetricKeyPair, AsymmetricPublicKey, AsymmetricSecretKey, Generate};
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{public, Public};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::store::UserRecord;

/// Ed25519 secret key length (seed || public key).
const SIGNING_KEY_LEN: usize = 64;
const REFRESH_TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid signing key")]
    InvalidKey,
    #[error("failed to build claims")]
    Claims(#[source] pasetors::errors::Error),
    #[error("failed to sign token")]
    Signing(#[source] pasetors::errors::Error),
    #[error("invalid token")]
    InvalidToken,
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
    #[error("failed to generate token entropy")]
    Entropy,
}

/// Claims decoded from a verified access token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessClaims {
    pub user_id: i64,
    pub email: String,
    pub role: String,
    pub role_id: i64,
    pub session_version: i64,
}

/// Signs and verifies access tokens, generates refresh tokens.
pub struct TokenIssuer {
    secret: AsymmetricSecretKey<V4>,
    public: AsymmetricPublicKey<V4>,
    issuer: String,
    audience: String,
}

impl TokenIssuer {
    /// Build an issuer from a base64-encoded 64-byte Ed25519 secret key.
    ///
    /// # Errors
    /// Returns `InvalidKey` if the key does not decode to a usable keypair.
    pub fn from_key_base64(key_base64: &str, issuer: &str, audience: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(key_base64.trim())
            .map_err(|_| TokenError::InvalidKey)?;
        if bytes.len() != SIGNING_KEY_LEN {
            return Err(TokenError::InvalidKey);
        }
        let secret = AsymmetricSecretKey::<V4>::from(&bytes).map_err(|_| TokenError::InvalidKey)?;
        let public = AsymmetricPublicKey::<V4>::from(&bytes[32..])
            .map_err(|_| TokenError::InvalidKey)?;
        Ok(Self {
            secret,
            public,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        })
    }

    /// Build an issuer with a freshly generated keypair. Tokens from previous
    /// processes become invalid; intended for development and tests.
    ///
    /// # Errors
    /// Returns `InvalidKey` if keypair generation fails.
    pub fn generate(issuer: &str, audience: &str) -> Result<Self, TokenError> {
        let pair = AsymmetricKeyPair::<V4>::generate().map_err(|_| TokenError::InvalidKey)?;
        Ok(Self {
            secret: pair.secret,
            public: pair.public,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        })
    }

    /// Sign an access token for the user, embedding the session version
    /// observed at issuance.
    ///
    /// # Errors
    /// Fails only on claim encoding or signing problems, never on user input.
    pub fn issue_access_token(
        &self,
        user: &UserRecord,
        session_version: i64,
        ttl_minutes: i64,
    ) -> Result<String, TokenError> {
        let ttl = Duration::from_secs(ttl_minutes.max(1).unsigned_abs() * 60);
        let mut claims = Claims::new_expires_in(&ttl).map_err(TokenError::Claims)?;
        claims.issuer(&self.issuer).map_err(TokenError::Claims)?;
        claims.audience(&self.audience).map_err(TokenError::Claims)?;
        claims
            .subject(&user.id.to_string())
            .map_err(TokenError::Claims)?;
        claims
            .token_identifier(&Uuid::new_v4().to_string())
            .map_err(TokenError::Claims)?;
        claims
            .add_additional("email", user.email.clone())
            .map_err(TokenError::Claims)?;
        claims
            .add_additional("role", user.role.clone())
            .map_err(TokenError::Claims)?;
        claims
            .add_additional("role_id", user.role_id)
            .map_err(TokenError::Claims)?;
        claims
            .add_additional("session_version", session_version)
            .map_err(TokenError::Claims)?;

        public::sign(&self.secret, &claims, None, None).map_err(TokenError::Signing)
    }

    /// Verify signature, issuer, audience, and expiry, and decode the claims.
    /// The caller still has to compare `session_version` against the store.
    ///
    /// # Errors
    /// Any malformed, tampered, expired, or mis-scoped token is
    /// `InvalidToken`; no further detail is exposed.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let untrusted =
            UntrustedToken::<Public, V4>::try_from(token).map_err(|_| TokenError::InvalidToken)?;

        let mut rules = ClaimsValidationRules::new();
        rules.validate_issuer_with(&self.issuer);
        rules.validate_audience_with(&self.audience);

        let trusted = public::verify(&self.public, &untrusted, &rules, None, None)
            .map_err(|_| TokenError::InvalidToken)?;
        let claims = trusted
            .payload_claims()
            .ok_or(TokenError::InvalidToken)?;

        let user_id = claims
            .get_claim("sub")
            .and_then(Value::as_str)
            .and_then(|sub| sub.parse().ok())
            .ok_or(TokenError::MissingClaim("sub"))?;
        let email = claims
            .get_claim("email")
            .and_then(Value::as_str)
            .ok_or(TokenError::MissingClaim("email"))?
            .to_string();
        let role = claims
            .get_claim("role")
            .and_then(Value::as_str)
            .ok_or(TokenError::MissingClaim("role"))?
            .to_string();
        let role_id = claims
            .get_claim("role_id")
            .and_then(Value::as_i64)
            .ok_or(TokenError::MissingClaim("role_id"))?;
        let session_version = claims
            .get_claim("session_version")
            .and_then(Value::as_i64)
            .ok_or(TokenError::MissingClaim("session_version"))?;

        Ok(AccessClaims {
            user_id,
            email,
            role,
            role_id,
            session_version,
        })
    }

    /// Generate a raw refresh token and a separate random lookup id.
    ///
    /// The raw value is returned exactly once; callers hash it with
    /// [`hash_refresh_token`] before persisting anything.
    ///
    /// # Errors
    /// Returns `Entropy` if the system RNG fails.
    pub fn issue_refresh_token(&self) -> Result<(String, Uuid), TokenError> {
        use rand::RngCore;
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| TokenError::Entropy)?;
        Ok((URL_SAFE_NO_PAD.encode(bytes), Uuid::new_v4()))
    }
}

/// Hash a raw refresh token for storage and lookup. Raw values never touch
/// the database.
#[must_use]
pub fn hash_refresh_token(raw: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.finalize().to_vec()
}
