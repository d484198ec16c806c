//! Authentication configuration loaded at startup.

use secrecy::{ExposeSecret, SecretSlice};
use std::sync::Arc;

const DEFAULT_ACCESS_TTL_MINUTES: i64 = 15;
const DEFAULT_REFRESH_TTL_DAYS: i64 = 30;
const DEFAULT_TOKEN_ISSUER: &str = "sigilo";
const DEFAULT_TOKEN_AUDIENCE: &str = "sigilo-api";
const DEFAULT_TOTP_ISSUER: &str = "Sigilo";

const ENV_ACCESS_TTL_MINUTES: &str = "SIGILO_ACCESS_TTL_MINUTES";
const ENV_REFRESH_TTL_DAYS: &str = "SIGILO_REFRESH_TTL_DAYS";
const ENV_SINGLE_SESSION: &str = "SIGILO_SINGLE_SESSION";
const ENV_TOKEN_ISSUER: &str = "SIGILO_TOKEN_ISSUER";
const ENV_TOKEN_AUDIENCE: &str = "SIGILO_TOKEN_AUDIENCE";
const ENV_TOTP_ISSUER: &str = "SIGILO_TOTP_ISSUER";
const ENV_BACKUP_CODE_PEPPER: &str = "SIGILO_BACKUP_CODE_PEPPER";

/// Runtime knobs for the session/MFA core.
///
/// `single_session` preserves the revoke-all-on-login policy: re-authenticating
/// elsewhere forcibly logs out other sessions. Deployments that want
/// multi-device support turn it off.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    token_issuer: String,
    token_audience: String,
    totp_issuer: String,
    access_ttl_minutes: i64,
    refresh_ttl_days: i64,
    single_session: bool,
    backup_code_pepper: Option<Arc<SecretSlice<u8>>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            token_audience: DEFAULT_TOKEN_AUDIENCE.to_string(),
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            access_ttl_minutes: DEFAULT_ACCESS_TTL_MINUTES,
            refresh_ttl_days: DEFAULT_REFRESH_TTL_DAYS,
            single_session: true,
            backup_code_pepper: None,
        }
    }

    #[must_use]
    pub fn with_single_session(mut self, single_session: bool) -> Self {
        self.single_session = single_session;
        self
    }

    #[must_use]
    pub fn with_access_ttl_minutes(mut self, minutes: i64) -> Self {
        self.access_ttl_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_days(mut self, days: i64) -> Self {
        self.refresh_ttl_days = days;
        self
    }

    #[must_use]
    pub fn with_backup_code_pepper(mut self, pepper: Vec<u8>) -> Self {
        self.backup_code_pepper = Some(Arc::new(SecretSlice::from(pepper)));
        self
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn token_audience(&self) -> &str {
        &self.token_audience
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    #[must_use]
    pub fn access_ttl_minutes(&self) -> i64 {
        self.access_ttl_minutes
    }

    #[must_use]
    pub fn refresh_ttl_days(&self) -> i64 {
        self.refresh_ttl_days
    }

    #[must_use]
    pub fn single_session(&self) -> bool {
        self.single_session
    }

    pub(crate) fn backup_code_pepper(&self) -> Option<&[u8]> {
        self.backup_code_pepper
            .as_deref()
            .map(ExposeSecret::expose_secret)
    }

    /// Load configuration from `SIGILO_*` environment variables, falling back
    /// to defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(minutes) = parse_i64_env(ENV_ACCESS_TTL_MINUTES) {
            config.access_ttl_minutes = minutes;
        }
        if let Some(days) = parse_i64_env(ENV_REFRESH_TTL_DAYS) {
            config.refresh_ttl_days = days;
        }
        if let Some(single) = parse_bool_env(ENV_SINGLE_SESSION) {
            config.single_session = single;
        }
        if let Ok(issuer) = std::env::var(ENV_TOKEN_ISSUER) {
            config.token_issuer = issuer;
        }
        if let Ok(audience) = std::env::var(ENV_TOKEN_AUDIENCE) {
            config.token_audience = audience;
        }
        if let Ok(issuer) = std::env::var(ENV_TOTP_ISSUER) {
            config.totp_issuer = issuer;
        }
        if let Ok(pepper) = std::env::var(ENV_BACKUP_CODE_PEPPER) {
            config.backup_code_pepper = Some(Arc::new(SecretSlice::from(pepper.into_bytes())));
        }
        config
    }
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|value| match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
}

fn parse_i64_env(key: &str) -> Option<i64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}
