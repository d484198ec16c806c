//! Multi-factor authentication lifecycle endpoints.
//!
//! Flow Overview:
//! 1) `setup` generates a secret and backup codes; nothing is active yet.
//! 2) `verify-setup` takes a TOTP or backup code and flips MFA on.
//! 3) `verify` closes a login challenge with a TOTP or backup code.
//! 4) `disable` clears MFA state unless the user's role forbids it.
//!
//! Security boundaries:
//! - Backup codes are shown exactly once; only peppered Argon2id hashes are
//!   kept server-side.
//! - Disabling MFA revokes every outstanding session.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

use super::{error_response, principal::require_auth, request_meta, types};
use crate::session::{Orchestrator, SecondFactor};

fn second_factor(
    code: Option<String>,
    backup_code: Option<String>,
) -> Result<SecondFactor, Response> {
    match (code, backup_code) {
        (Some(code), None) => Ok(SecondFactor::Totp(code)),
        (None, Some(code)) => Ok(SecondFactor::BackupCode(code)),
        _ => Err((
            StatusCode::BAD_REQUEST,
            "Provide exactly one of code or backupCode",
        )
            .into_response()),
    }
}

/// Begin MFA enrollment for the authenticated user.
#[utoipa::path(
    post,
    path = "/v1/auth/mfa/setup",
    responses(
        (status = 200, description = "Enrollment material generated", body = types::MfaSetupResponse),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "MFA already enabled")
    ),
    tag = "mfa"
)]
pub async fn setup(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> Response {
    let principal = match require_auth(&headers, &orchestrator).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match orchestrator.setup_mfa(principal.user_id).await {
        Ok(enrollment) => (
            StatusCode::OK,
            Json(types::MfaSetupResponse {
                secret: enrollment.secret_base32,
                provisioning_uri: enrollment.provisioning_uri,
                qr_code: enrollment.qr_png_base64,
                backup_codes: enrollment.backup_codes,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Confirm a pending enrollment with a TOTP code or a backup code.
#[utoipa::path(
    post,
    path = "/v1/auth/mfa/verify-setup",
    request_body = types::MfaConfirmRequest,
    responses(
        (status = 204, description = "MFA enabled"),
        (status = 400, description = "No pending setup"),
        (status = 401, description = "Unauthorized or invalid code"),
        (status = 409, description = "MFA already enabled")
    ),
    tag = "mfa"
)]
pub async fn verify_setup(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<types::MfaConfirmRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &orchestrator).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    let factor = match second_factor(request.code, request.backup_code) {
        Ok(factor) => factor,
        Err(response) => return response,
    };

    match orchestrator.confirm_setup(principal.user_id, factor).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

/// Close a login challenge with a TOTP code or a backup code.
///
/// Unauthenticated by design: the caller holds no tokens yet, only a
/// password-verified challenge identified by `userId`.
#[utoipa::path(
    post,
    path = "/v1/auth/mfa/verify",
    request_body = types::MfaVerifyRequest,
    responses(
        (status = 200, description = "Tokens issued", body = types::TokenResponse),
        (status = 400, description = "Validation error"),
        (status = 401, description = "Invalid code")
    ),
    tag = "mfa"
)]
pub async fn verify(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<types::MfaVerifyRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    let factor = match second_factor(request.code, request.backup_code) {
        Ok(factor) => factor,
        Err(response) => return response,
    };

    let meta = request_meta(&headers);
    match orchestrator.verify_mfa(request.user_id, factor, &meta).await {
        Ok(tokens) => (
            StatusCode::OK,
            Json(types::TokenResponse {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_in: tokens.expires_in,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Disable MFA for the authenticated user.
#[utoipa::path(
    post,
    path = "/v1/auth/mfa/disable",
    request_body = types::MfaDisableRequest,
    responses(
        (status = 204, description = "MFA disabled, all sessions revoked"),
        (status = 400, description = "MFA not enabled"),
        (status = 401, description = "Unauthorized or wrong password"),
        (status = 403, description = "Role policy requires MFA")
    ),
    tag = "mfa"
)]
pub async fn disable(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<types::MfaDisableRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &orchestrator).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let password = payload.and_then(|Json(request)| request.password);

    match orchestrator
        .disable_mfa(principal.user_id, password.as_deref())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

/// Current MFA posture plus the role policy applied to it.
#[utoipa::path(
    get,
    path = "/v1/auth/mfa/status",
    responses(
        (status = 200, description = "MFA status", body = types::MfaStatusResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn status(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> Response {
    let principal = match require_auth(&headers, &orchestrator).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match orchestrator.mfa_status(principal.user_id).await {
        Ok(status) => (
            StatusCode::OK,
            Json(types::MfaStatusResponse {
                mfa_enabled: status.mfa_enabled,
                mfa_required: status.mfa_required,
                enforced_by_admin: status.enforced_by_admin,
                mfa_verified_at: status
                    .mfa_verified_at
                    .and_then(|stamp| stamp.format(&Rfc3339).ok()),
                role: status.role,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Replace the backup-code batch; previous codes stop working immediately.
#[utoipa::path(
    post,
    path = "/v1/auth/mfa/regenerate-backup-codes",
    responses(
        (status = 200, description = "Fresh batch, shown exactly once", body = types::BackupCodesResponse),
        (status = 400, description = "MFA not enabled"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn regenerate_backup_codes(
    headers: HeaderMap,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> Response {
    let principal = match require_auth(&headers, &orchestrator).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match orchestrator.regenerate_backup_codes(principal.user_id).await {
        Ok(backup_codes) => (
            StatusCode::OK,
            Json(types::BackupCodesResponse { backup_codes }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}
