//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: i64,
}

/// Password accepted but a second factor is outstanding. No tokens yet.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MfaChallengeResponse {
    pub mfa_required: bool,
    pub user_id: i64,
}

/// Login either completes with tokens or opens an MFA challenge.
#[derive(ToSchema, Serialize, Debug)]
#[serde(untagged)]
pub enum LoginResponse {
    Tokens(TokenResponse),
    MfaChallenge(MfaChallengeResponse),
}

/// Second-factor submission: exactly one of `code` (TOTP) or `backup_code`.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MfaVerifyRequest {
    pub user_id: i64,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub backup_code: Option<String>,
}

/// First factor of a pending enrollment, submitted by the enrolling user.
/// Exactly one of `code` (TOTP) or `backup_code`.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MfaConfirmRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub backup_code: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MfaSetupResponse {
    pub secret: String,
    pub provisioning_uri: String,
    pub qr_code: String,
    /// Shown exactly once; only hashes are retained server-side.
    pub backup_codes: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MfaStatusResponse {
    pub mfa_enabled: bool,
    pub mfa_required: bool,
    pub enforced_by_admin: bool,
    pub mfa_verified_at: Option<String>,
    pub role: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MfaDisableRequest {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub refresh_token: String,
}
