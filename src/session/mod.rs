//! Session and multi-factor authentication core.
//!
//! Everything stateful goes through [`store::CredentialStore`]; the
//! [`orchestrator::Orchestrator`] drives the login, MFA, and token lifecycle
//! on top of it.

pub mod audit;
pub mod backup;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod password;
pub mod rate_limit;
pub mod revocation;
pub mod store;
pub mod tokens;
pub mod totp;

pub use config::AuthConfig;
pub use error::AuthError;
pub use orchestrator::{
    IssuedTokens, LoginOutcome, MfaEnrollment, MfaStatus, Orchestrator, Principal, RequestMeta,
    SecondFactor,
};
pub use rate_limit::{NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter};
pub use store::{CredentialStore, PgCredentialStore};
pub use tokens::TokenIssuer;
pub use totp::{TotpEngine, TotpRsEngine};
