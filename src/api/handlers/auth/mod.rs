//! Password login, token refresh, and logout.
//!
//! Flow Overview:
//! 1) `POST /v1/auth/login` verifies the password; accounts with MFA get a
//!    challenge response instead of tokens.
//! 2) `POST /v1/auth/mfa/verify` closes the challenge and issues tokens.
//! 3) `POST /v1/auth/refresh` rotates the refresh token.
//! 4) `POST /v1/auth/logout` revokes the presented refresh token.
//!
//! Security boundaries:
//! - Login failures are generic; callers cannot probe which accounts exist.
//! - Raw refresh tokens appear in responses exactly once and are only ever
//!   looked up by hash.

pub(crate) mod mfa;
pub(crate) mod principal;
pub(crate) mod types;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use regex::Regex;
use std::sync::Arc;
use tracing::error;

use crate::session::{AuthError, LoginOutcome, Orchestrator, RequestMeta};
use self::types::{
    LoginRequest, LoginResponse, LogoutRequest, MfaChallengeResponse, RefreshRequest,
    TokenResponse,
};

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Extract a client IP from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn request_meta(headers: &HeaderMap) -> RequestMeta {
    RequestMeta {
        ip: extract_client_ip(headers),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

/// Map a core error to a response, logging infrastructure failures in full.
pub(crate) fn error_response(err: &AuthError) -> Response {
    let status = match err {
        AuthError::InvalidCredentials | AuthError::InvalidMfaCode => StatusCode::UNAUTHORIZED,
        AuthError::MfaAlreadyEnabled => StatusCode::CONFLICT,
        AuthError::MfaNotEnabled => StatusCode::BAD_REQUEST,
        AuthError::MfaRequiredByPolicy => StatusCode::FORBIDDEN,
        AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        AuthError::Store(_)
        | AuthError::TokenSigning(_)
        | AuthError::Engine(_)
        | AuthError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("authentication core failure: {err:?}");
        return status.into_response();
    }
    (status, err.to_string()).into_response()
}

fn token_response(tokens: crate::session::IssuedTokens) -> TokenResponse {
    TokenResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_in: tokens.expires_in,
    }
}

/// Password login.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued, or MFA challenge opened", body = LoginResponse),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Invalid credentials")
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let email = request.email.trim().to_lowercase();
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email").into_response();
    }

    let meta = request_meta(&headers);
    match orchestrator.login(&email, &request.password, &meta).await {
        Ok(LoginOutcome::Tokens(tokens)) => (
            StatusCode::OK,
            Json(LoginResponse::Tokens(token_response(tokens))),
        )
            .into_response(),
        Ok(LoginOutcome::MfaChallenge { user_id }) => (
            StatusCode::OK,
            Json(LoginResponse::MfaChallenge(MfaChallengeResponse {
                mfa_required: true,
                user_id,
            })),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Exchange a refresh token for a fresh pair, revoking the presented one.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair issued", body = TokenResponse),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Unknown, revoked, or expired token")
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<RefreshRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    if request.refresh_token.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing refresh token").into_response();
    }

    let meta = request_meta(&headers);
    match orchestrator.refresh(&request.refresh_token, &meta).await {
        Ok(tokens) => (StatusCode::OK, Json(token_response(tokens))).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Revoke the presented refresh token. Idempotent.
#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Token revoked (or was already dead)"),
        (status = 400, description = "Validation error")
    ),
    tag = "auth"
)]
pub async fn logout(
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<LogoutRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    match orchestrator.logout(&request.refresh_token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}
