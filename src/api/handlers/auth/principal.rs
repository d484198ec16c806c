//! Authenticated principal extraction from bearer access tokens.
//!
//! Flow Overview: read the `Authorization: Bearer` header, verify the PASETO
//! token, and confirm its embedded session version against the store. A token
//! signed yesterday dies the moment the user's session version moves.

use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use tracing::warn;

use crate::session::{Orchestrator, Principal};

const BEARER_PREFIX: &str = "Bearer ";

/// Pull the raw bearer token out of the headers, if any.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the bearer token into a principal, or return 401.
pub(crate) async fn require_auth(
    headers: &HeaderMap,
    orchestrator: &Orchestrator,
) -> Result<Principal, StatusCode> {
    let Some(token) = bearer_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    match orchestrator.authorize_access(token).await {
        Ok(principal) => Ok(principal),
        Err(err) if err.is_rejection() => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            warn!("authorization failed: {err}");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
