//! The authentication state machine.
//!
//! Flow overview:
//! 1) Password login either issues tokens directly or opens an MFA challenge.
//! 2) MFA enrollment runs secret-pending until the first code verifies.
//! 3) A verified challenge revokes prior sessions (single-session policy),
//!    bumps the session version, and only then issues tokens; a crash
//!    mid-sequence leaves the user logged out, never with stale sessions.
//! 4) Refresh rotates: each use revokes the presented record and issues a
//!    replacement, so a stolen-but-superseded token replays exactly zero times.
//!
//! Security boundaries:
//! - Unknown email and wrong password are indistinguishable to the caller.
//! - Wrong TOTP and wrong/spent backup codes are indistinguishable.
//! - Role policy is checked before MFA disablement mutates anything.

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use super::audit::{emit_best_effort, AuditAction, AuditEvent, AuditSink};
use super::backup::{self, BackupCodeBatch};
use super::config::AuthConfig;
use super::error::AuthError;
use super::password;
use super::rate_limit::{NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter};
use super::revocation::RevocationAuthority;
use super::store::{is_unique_violation, CredentialStore, NewRefreshToken, UserRecord};
use super::tokens::{hash_refresh_token, TokenIssuer};
use super::totp::TotpEngine;

/// Network metadata captured with each issued refresh token.
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// A second factor as submitted by the caller.
#[derive(Clone, Debug)]
pub enum SecondFactor {
    Totp(String),
    BackupCode(String),
}

/// Both tokens of a fully authenticated session. The refresh token appears
/// here in raw form exactly once and is never retrievable again.
#[derive(Clone, Debug)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: i64,
}

/// Outcome of a password login.
#[derive(Debug)]
pub enum LoginOutcome {
    /// No MFA on the account; fully authenticated.
    Tokens(IssuedTokens),
    /// Password verified, second factor outstanding. No tokens yet.
    MfaChallenge { user_id: i64 },
}

/// Everything the enrolling user needs, returned exactly once.
#[derive(Debug)]
pub struct MfaEnrollment {
    pub secret_base32: String,
    pub provisioning_uri: String,
    pub qr_png_base64: String,
    pub backup_codes: Vec<String>,
}

/// Current MFA posture of an account.
#[derive(Debug)]
pub struct MfaStatus {
    pub mfa_enabled: bool,
    pub mfa_required: bool,
    pub enforced_by_admin: bool,
    pub mfa_verified_at: Option<OffsetDateTime>,
    pub role: String,
}

/// Authenticated identity derived from a verified access token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: i64,
    pub email: String,
    pub role: String,
    pub role_id: i64,
}

/// Ties store, TOTP engine, token issuer, revocation, and audit together and
/// enforces the ordering invariants between them.
pub struct Orchestrator {
    store: Arc<dyn CredentialStore>,
    totp: Arc<dyn TotpEngine>,
    tokens: TokenIssuer,
    revocation: RevocationAuthority,
    audit: Arc<dyn AuditSink>,
    rate_limiter: Arc<dyn RateLimiter>,
    config: AuthConfig,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        totp: Arc<dyn TotpEngine>,
        tokens: TokenIssuer,
        audit: Arc<dyn AuditSink>,
        config: AuthConfig,
    ) -> Self {
        let revocation = RevocationAuthority::new(store.clone());
        Self {
            store,
            totp,
            tokens,
            revocation,
            audit,
            rate_limiter: Arc::new(NoopRateLimiter),
            config,
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Admin-facing revocation surface (logout-everywhere, per-token revokes).
    #[must_use]
    pub fn revocation(&self) -> &RevocationAuthority {
        &self.revocation
    }

    /// Password login. Never distinguishes unknown email from wrong password.
    ///
    /// # Errors
    /// `InvalidCredentials` on any verification failure; `Store` on
    /// infrastructure failure.
    pub async fn login(
        &self,
        email: &str,
        submitted_password: &str,
        meta: &RequestMeta,
    ) -> Result<LoginOutcome, AuthError> {
        let email = email.trim().to_lowercase();
        if self.limited(meta, Some(&email), RateLimitAction::Login) {
            return Err(AuthError::RateLimited);
        }
        let user = self
            .store
            .get_user_by_email(&email)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidCredentials)?;

        if !password::verify_password(submitted_password, &user.password_hash) {
            warn!(user_id = user.id, "password verification failed");
            return Err(AuthError::InvalidCredentials);
        }

        if user.mfa_enabled {
            info!(user_id = user.id, "password verified, MFA challenge opened");
            return Ok(LoginOutcome::MfaChallenge { user_id: user.id });
        }

        let tokens = self.issue_session(&user, meta).await?;
        info!(user_id = user.id, "login complete without MFA");
        Ok(LoginOutcome::Tokens(tokens))
    }

    /// Second-factor verification during login.
    ///
    /// On success prior sessions are revoked (per policy), the session version
    /// bumps, and both tokens are issued. On failure nothing changes.
    ///
    /// # Errors
    /// `InvalidMfaCode` for a wrong or spent code; `MfaNotEnabled` when the
    /// account has no active MFA.
    pub async fn verify_mfa(
        &self,
        user_id: i64,
        factor: SecondFactor,
        meta: &RequestMeta,
    ) -> Result<IssuedTokens, AuthError> {
        if self.limited(meta, None, RateLimitAction::MfaVerify) {
            return Err(AuthError::RateLimited);
        }
        let user = self.user_by_id(user_id).await?;
        if !user.mfa_enabled {
            return Err(AuthError::MfaNotEnabled);
        }

        self.check_second_factor(&user, &factor).await?;

        self.store
            .touch_mfa_verified(user.id)
            .await
            .map_err(AuthError::store)?;
        let tokens = self.issue_session(&user, meta).await?;
        info!(user_id = user.id, "MFA challenge verified");
        Ok(tokens)
    }

    /// Begin MFA enrollment for an authenticated user: generate a secret and
    /// a fresh backup-code batch, both persisted unconfirmed.
    ///
    /// # Errors
    /// `MfaAlreadyEnabled` when MFA is active (disable first).
    pub async fn setup_mfa(&self, user_id: i64) -> Result<MfaEnrollment, AuthError> {
        let user = self.user_by_id(user_id).await?;
        if user.mfa_enabled {
            return Err(AuthError::MfaAlreadyEnabled);
        }
        let pepper = self.pepper()?;

        let provisioned = self
            .totp
            .generate(&user.email, self.config.totp_issuer())
            .map_err(AuthError::Engine)?;
        let batch = BackupCodeBatch::generate(pepper).map_err(AuthError::Engine)?;

        self.store
            .set_mfa_secret(user.id, Some(&provisioned.secret_base32))
            .await
            .map_err(AuthError::store)?;
        self.store
            .set_backup_codes(user.id, &batch.hashes)
            .await
            .map_err(AuthError::store)?;

        emit_best_effort(
            self.audit.as_ref(),
            AuditEvent::new(user.id, AuditAction::Create, "mfa_secret"),
        )
        .await;
        info!(user_id = user.id, "MFA enrollment started");

        Ok(MfaEnrollment {
            secret_base32: provisioned.secret_base32,
            provisioning_uri: provisioned.provisioning_uri,
            qr_png_base64: provisioned.qr_png_base64,
            backup_codes: batch.codes,
        })
    }

    /// Confirm a pending enrollment with a first code. Success enables MFA
    /// and stamps `mfa_verified_at`; failure leaves the setup pending.
    ///
    /// # Errors
    /// `MfaNotEnabled` when no setup is pending, `MfaAlreadyEnabled` when MFA
    /// is already active, `InvalidMfaCode` for a wrong code.
    pub async fn confirm_setup(
        &self,
        user_id: i64,
        factor: SecondFactor,
    ) -> Result<(), AuthError> {
        let user = self.user_by_id(user_id).await?;
        if user.mfa_enabled {
            return Err(AuthError::MfaAlreadyEnabled);
        }
        if user.mfa_secret.is_none() {
            return Err(AuthError::MfaNotEnabled);
        }

        self.check_second_factor(&user, &factor).await?;

        self.store
            .enable_mfa(user.id)
            .await
            .map_err(AuthError::store)?;
        emit_best_effort(
            self.audit.as_ref(),
            AuditEvent::new(user.id, AuditAction::Update, "mfa_enabled")
                .with_change(Some(false.into()), Some(true.into())),
        )
        .await;
        info!(user_id = user.id, "MFA enabled");
        Ok(())
    }

    /// Disable MFA. The role policy is checked before anything mutates; a
    /// policy refusal leaves the account untouched.
    ///
    /// # Errors
    /// `MfaRequiredByPolicy` when the role mandates MFA, `MfaNotEnabled`
    /// when there is nothing to disable, `InvalidCredentials` when the
    /// supplied password does not verify.
    pub async fn disable_mfa(
        &self,
        user_id: i64,
        current_password: Option<&str>,
    ) -> Result<(), AuthError> {
        let user = self.user_by_id(user_id).await?;
        if !user.mfa_enabled {
            return Err(AuthError::MfaNotEnabled);
        }
        if let Some(submitted) = current_password {
            if !password::verify_password(submitted, &user.password_hash) {
                return Err(AuthError::InvalidCredentials);
            }
        }

        // Policy gate first: check-then-act, nothing cleared on refusal.
        let policy = self
            .store
            .get_mfa_policy_for_role(user.role_id)
            .await
            .map_err(AuthError::store)?;
        if policy.is_some_and(|policy| policy.mfa_required) {
            return Err(AuthError::MfaRequiredByPolicy);
        }

        self.store
            .clear_mfa(user.id)
            .await
            .map_err(AuthError::store)?;
        // MFA posture changed; existing sessions are no longer trusted.
        self.revocation
            .revoke_all_and_bump(user.id)
            .await
            .map_err(AuthError::store)?;

        emit_best_effort(
            self.audit.as_ref(),
            AuditEvent::new(user.id, AuditAction::Update, "mfa_enabled")
                .with_change(Some(true.into()), Some(false.into())),
        )
        .await;
        info!(user_id = user.id, "MFA disabled");
        Ok(())
    }

    /// Replace the backup-code batch. Previously issued codes become invalid
    /// unconditionally; plaintext is returned exactly once.
    ///
    /// # Errors
    /// `MfaNotEnabled` when MFA is not active.
    pub async fn regenerate_backup_codes(&self, user_id: i64) -> Result<Vec<String>, AuthError> {
        let user = self.user_by_id(user_id).await?;
        if !user.mfa_enabled {
            return Err(AuthError::MfaNotEnabled);
        }
        let pepper = self.pepper()?;

        let batch = BackupCodeBatch::generate(pepper).map_err(AuthError::Engine)?;
        self.store
            .set_backup_codes(user.id, &batch.hashes)
            .await
            .map_err(AuthError::store)?;

        emit_best_effort(
            self.audit.as_ref(),
            AuditEvent::new(user.id, AuditAction::Update, "mfa_backup_codes"),
        )
        .await;
        info!(user_id = user.id, "backup codes regenerated");
        Ok(batch.codes)
    }

    /// Current MFA posture plus the role policy applied to it.
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown user, `Store` otherwise.
    pub async fn mfa_status(&self, user_id: i64) -> Result<MfaStatus, AuthError> {
        let user = self.user_by_id(user_id).await?;
        let policy = self
            .store
            .get_mfa_policy_for_role(user.role_id)
            .await
            .map_err(AuthError::store)?;
        Ok(MfaStatus {
            mfa_enabled: user.mfa_enabled,
            mfa_required: policy.is_some_and(|policy| policy.mfa_required),
            enforced_by_admin: policy.is_some_and(|policy| policy.enforced_by_admin),
            mfa_verified_at: user.mfa_verified_at,
            role: user.role,
        })
    }

    /// Exchange a raw refresh token for a fresh token pair, revoking the
    /// presented record (rotation).
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown, revoked, or expired token.
    pub async fn refresh(
        &self,
        raw_refresh_token: &str,
        meta: &RequestMeta,
    ) -> Result<IssuedTokens, AuthError> {
        if self.limited(meta, None, RateLimitAction::Refresh) {
            return Err(AuthError::RateLimited);
        }
        let hash = hash_refresh_token(raw_refresh_token.trim());
        let record = self
            .store
            .find_refresh_token_by_hash(&hash)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidCredentials)?;
        let user = self.user_by_id(record.user_id).await?;

        // Rotate before reissuing so the presented token can never replay.
        self.revocation
            .revoke_one(record.token_id)
            .await
            .map_err(AuthError::store)?;

        let tokens = self
            .mint_tokens(&user, user.session_version, meta)
            .await?;
        info!(user_id = user.id, "refresh token rotated");
        Ok(tokens)
    }

    /// Revoke the refresh token presented at logout. Idempotent: an unknown
    /// or already-revoked token is a successful logout.
    ///
    /// # Errors
    /// `Store` on infrastructure failure only.
    pub async fn logout(&self, raw_refresh_token: &str) -> Result<(), AuthError> {
        let hash = hash_refresh_token(raw_refresh_token.trim());
        if let Some(record) = self
            .store
            .find_refresh_token_by_hash(&hash)
            .await
            .map_err(AuthError::store)?
        {
            self.revocation
                .revoke_one(record.token_id)
                .await
                .map_err(AuthError::store)?;
            info!(user_id = record.user_id, "refresh token revoked at logout");
        }
        Ok(())
    }

    /// Verify a bearer access token and confirm its embedded session version
    /// against the store (the kill-switch check).
    ///
    /// # Errors
    /// `InvalidCredentials` for anything short of a live, current token.
    pub async fn authorize_access(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self
            .tokens
            .verify_access_token(token)
            .map_err(|_| AuthError::InvalidCredentials)?;
        let user = self.user_by_id(claims.user_id).await?;
        if claims.session_version != user.session_version {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(Principal {
            user_id: user.id,
            email: user.email,
            role: user.role,
            role_id: user.role_id,
        })
    }

    fn limited(&self, meta: &RequestMeta, email: Option<&str>, action: RateLimitAction) -> bool {
        if self.rate_limiter.check_ip(meta.ip.as_deref(), action) == RateLimitDecision::Limited {
            warn!(ip = ?meta.ip, "rate limited by ip");
            return true;
        }
        if let Some(email) = email {
            if self.rate_limiter.check_email(email, action) == RateLimitDecision::Limited {
                warn!("rate limited by email");
                return true;
            }
        }
        false
    }

    async fn user_by_id(&self, user_id: i64) -> Result<UserRecord, AuthError> {
        self.store
            .get_user_by_id(user_id)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidCredentials)
    }

    async fn check_second_factor(
        &self,
        user: &UserRecord,
        factor: &SecondFactor,
    ) -> Result<(), AuthError> {
        match factor {
            SecondFactor::Totp(code) => {
                let secret = user.mfa_secret.as_deref().ok_or(AuthError::MfaNotEnabled)?;
                if self.totp.verify(secret, code) {
                    Ok(())
                } else {
                    warn!(user_id = user.id, "TOTP verification failed");
                    Err(AuthError::InvalidMfaCode)
                }
            }
            SecondFactor::BackupCode(code) => self.consume_backup_code(user, code).await,
        }
    }

    async fn consume_backup_code(
        &self,
        user: &UserRecord,
        submitted: &str,
    ) -> Result<(), AuthError> {
        let pepper = self.pepper()?;
        let Ok(normalized) = backup::normalize_backup_code(submitted) else {
            return Err(AuthError::InvalidMfaCode);
        };

        let matched = user.mfa_backup_codes.iter().find(|hash| {
            backup::verify_backup_code(&normalized, hash, pepper).unwrap_or(false)
        });
        let Some(hash) = matched else {
            warn!(user_id = user.id, "backup code did not match");
            return Err(AuthError::InvalidMfaCode);
        };

        // The store removes the hash atomically; a racer that lost gets a
        // plain invalid-code rejection, same as a wrong code.
        let consumed = self
            .store
            .consume_backup_code_hash(user.id, hash)
            .await
            .map_err(AuthError::store)?;
        if consumed {
            info!(user_id = user.id, "backup code consumed");
            Ok(())
        } else {
            warn!(user_id = user.id, "backup code already consumed");
            Err(AuthError::InvalidMfaCode)
        }
    }

    /// Full issuance for a verified user: revoke-then-issue under the
    /// single-session policy, then mint and persist both tokens.
    async fn issue_session(
        &self,
        user: &UserRecord,
        meta: &RequestMeta,
    ) -> Result<IssuedTokens, AuthError> {
        let session_version = if self.config.single_session() {
            self.revocation
                .revoke_all_and_bump(user.id)
                .await
                .map_err(AuthError::store)?
        } else {
            user.session_version
        };

        let tokens = self.mint_tokens(user, session_version, meta).await?;
        self.store
            .update_last_login(user.id)
            .await
            .map_err(AuthError::store)?;
        Ok(tokens)
    }

    async fn mint_tokens(
        &self,
        user: &UserRecord,
        session_version: i64,
        meta: &RequestMeta,
    ) -> Result<IssuedTokens, AuthError> {
        let ttl_minutes = user
            .access_ttl_minutes
            .unwrap_or_else(|| self.config.access_ttl_minutes());

        let access_token = self
            .tokens
            .issue_access_token(user, session_version, ttl_minutes)
            .map_err(|err| AuthError::TokenSigning(err.into()))?;

        // Random ids collide essentially never, but the store enforces
        // uniqueness; regenerate and retry instead of failing the login.
        const INSERT_ATTEMPTS: u32 = 3;
        for attempt in 1..=INSERT_ATTEMPTS {
            let (refresh_token, token_id) = self
                .tokens
                .issue_refresh_token()
                .map_err(|err| AuthError::TokenSigning(err.into()))?;

            let record = NewRefreshToken {
                token_id,
                user_id: user.id,
                token_hash: hash_refresh_token(&refresh_token),
                expires_at: OffsetDateTime::now_utc()
                    + Duration::days(self.config.refresh_ttl_days()),
                created_from_ip: meta.ip.clone(),
                created_from_user_agent: meta.user_agent.clone(),
            };
            match self.store.insert_refresh_token(&record).await {
                Ok(()) => {
                    return Ok(IssuedTokens {
                        access_token,
                        refresh_token,
                        expires_in: ttl_minutes * 60,
                    });
                }
                Err(err) if is_unique_violation(&err) && attempt < INSERT_ATTEMPTS => {
                    warn!(user_id = user.id, attempt, "refresh token collision, retrying");
                }
                Err(err) => return Err(AuthError::store(err)),
            }
        }
        Err(AuthError::store(anyhow::anyhow!(
            "exhausted refresh token insert attempts"
        )))
    }

    fn pepper(&self) -> Result<&[u8], AuthError> {
        self.config
            .backup_code_pepper()
            .ok_or(AuthError::Misconfigured("backup code pepper not configured"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::audit::TracingAuditSink;
    use crate::session::store::memory::MemoryStore;
    use crate::session::store::MfaRolePolicy;
    use crate::session::totp::testing::FixedCodeEngine;

    const SECRET: &str = "JBSWY3DPEHPK3PXP";
    const CODE: &str = "123456";
    const PASSWORD: &str = "correct horse battery staple";

    fn pepper() -> Arc<[u8]> {
        Arc::from(b"test-pepper".as_slice())
    }

    fn user(id: i64, email: &str, mfa_enabled: bool) -> UserRecord {
        UserRecord {
            id,
            email: email.to_string(),
            password_hash: password::hash_password(PASSWORD).unwrap(),
            role: "employee".to_string(),
            role_id: 1,
            mfa_enabled,
            mfa_secret: mfa_enabled.then(|| SECRET.to_string()),
            mfa_backup_codes: Vec::new(),
            mfa_verified_at: None,
            session_version: 0,
            last_login_at: None,
            access_ttl_minutes: None,
        }
    }

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        let config = AuthConfig::new().with_backup_code_pepper(pepper().to_vec());
        Orchestrator::new(
            store,
            Arc::new(FixedCodeEngine::new(SECRET, CODE)),
            TokenIssuer::generate("sigilo", "sigilo-api").unwrap(),
            Arc::new(TracingAuditSink),
            config,
        )
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            ip: Some("192.0.2.10".to_string()),
            user_agent: Some("tests/1.0".to_string()),
        }
    }

    fn totp() -> SecondFactor {
        SecondFactor::Totp(CODE.to_string())
    }

    #[tokio::test]
    async fn login_without_mfa_issues_tokens_directly() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store.clone());

        let outcome = orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap();
        let LoginOutcome::Tokens(tokens) = outcome else {
            panic!("expected direct issuance");
        };
        assert_eq!(tokens.expires_in, 900);
        assert!(tokens.access_token.starts_with("v4.public."));
        assert_eq!(store.live_token_count(1), 1);
        assert!(store.user(1).last_login_at.is_some());
    }

    #[tokio::test]
    async fn login_is_generic_for_unknown_email_and_wrong_password() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store);

        let unknown = orch.login("ghost@example.com", PASSWORD, &meta()).await;
        assert!(matches!(unknown, Err(AuthError::InvalidCredentials)));
        let wrong = orch.login("u1@example.com", "wrong", &meta()).await;
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn login_with_mfa_opens_challenge_without_tokens() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        let orch = orchestrator(store.clone());

        let outcome = orch.login("u2@example.com", PASSWORD, &meta()).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::MfaChallenge { user_id: 2 }));
        assert_eq!(store.live_token_count(2), 0);
        assert_eq!(store.user(2).session_version, 0);
    }

    #[tokio::test]
    async fn mfa_verification_issues_tokens_and_bumps_version() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        let orch = orchestrator(store.clone());

        let tokens = orch.verify_mfa(2, totp(), &meta()).await.unwrap();
        assert_eq!(tokens.expires_in, 900);
        assert_eq!(store.user(2).session_version, 1);
        assert!(store.user(2).mfa_verified_at.is_some());
        assert_eq!(store.live_token_count(2), 1);
    }

    #[tokio::test]
    async fn wrong_totp_leaves_no_side_effects() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        let orch = orchestrator(store.clone());

        let result = orch.verify_mfa(2, SecondFactor::Totp("000000".into()), &meta()).await;
        assert!(matches!(result, Err(AuthError::InvalidMfaCode)));
        assert_eq!(store.user(2).session_version, 0);
        assert_eq!(store.live_token_count(2), 0);
    }

    #[tokio::test]
    async fn stale_access_token_is_rejected_after_next_full_login() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store);

        let LoginOutcome::Tokens(first) =
            orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap()
        else {
            panic!("expected tokens");
        };
        assert!(orch.authorize_access(&first.access_token).await.is_ok());

        let LoginOutcome::Tokens(second) =
            orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap()
        else {
            panic!("expected tokens");
        };

        // The embedded session version no longer matches the stored one.
        assert!(matches!(
            orch.authorize_access(&first.access_token).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(orch.authorize_access(&second.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn backup_code_is_single_use() {
        let store = Arc::new(MemoryStore::new());
        let mut record = user(2, "u2@example.com", true);
        let batch = BackupCodeBatch::generate(&pepper()).unwrap();
        record.mfa_backup_codes = batch.hashes.clone();
        store.insert_user(record);
        let orch = orchestrator(store.clone());

        let code = batch.codes.first().unwrap().clone();
        orch.verify_mfa(2, SecondFactor::BackupCode(code.clone()), &meta())
            .await
            .unwrap();
        assert_eq!(store.user(2).mfa_backup_codes.len(), batch.hashes.len() - 1);

        let replay = orch
            .verify_mfa(2, SecondFactor::BackupCode(code), &meta())
            .await;
        assert!(matches!(replay, Err(AuthError::InvalidMfaCode)));
    }

    #[tokio::test]
    async fn concurrent_backup_code_consumption_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut record = user(2, "u2@example.com", true);
        let batch = BackupCodeBatch::generate(&pepper()).unwrap();
        record.mfa_backup_codes = batch.hashes.clone();
        store.insert_user(record);
        let orch = Arc::new(orchestrator(store));

        let code = batch.codes.first().unwrap().clone();
        let meta = meta();
        let (first, second) = tokio::join!(
            orch.verify_mfa(2, SecondFactor::BackupCode(code.clone()), &meta),
            orch.verify_mfa(2, SecondFactor::BackupCode(code), &meta),
        );

        let successes = usize::from(first.is_ok()) + usize::from(second.is_ok());
        assert_eq!(successes, 1);
        for result in [first, second] {
            if let Err(err) = result {
                assert!(matches!(err, AuthError::InvalidMfaCode));
            }
        }
    }

    #[tokio::test]
    async fn regeneration_invalidates_previous_codes() {
        let store = Arc::new(MemoryStore::new());
        let mut record = user(2, "u2@example.com", true);
        let old_batch = BackupCodeBatch::generate(&pepper()).unwrap();
        record.mfa_backup_codes = old_batch.hashes.clone();
        store.insert_user(record);
        let orch = orchestrator(store.clone());

        let new_codes = orch.regenerate_backup_codes(2).await.unwrap();
        assert_eq!(new_codes.len(), 10);

        let old_code = old_batch.codes.first().unwrap().clone();
        let result = orch
            .verify_mfa(2, SecondFactor::BackupCode(old_code), &meta())
            .await;
        assert!(matches!(result, Err(AuthError::InvalidMfaCode)));
    }

    #[tokio::test]
    async fn enrollment_confirms_only_with_correct_code() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(3, "u3@example.com", false));
        let orch = orchestrator(store.clone());

        let enrollment = orch.setup_mfa(3).await.unwrap();
        assert_eq!(enrollment.secret_base32, SECRET);
        assert_eq!(enrollment.backup_codes.len(), 10);
        assert!(enrollment.provisioning_uri.starts_with("otpauth://totp/"));

        // Wrong code: still secret-pending.
        let wrong = orch
            .confirm_setup(3, SecondFactor::Totp("999999".into()))
            .await;
        assert!(matches!(wrong, Err(AuthError::InvalidMfaCode)));
        assert!(!store.user(3).mfa_enabled);
        assert_eq!(store.user(3).mfa_secret.as_deref(), Some(SECRET));

        orch.confirm_setup(3, totp()).await.unwrap();
        assert!(store.user(3).mfa_enabled);
        assert!(store.user(3).mfa_verified_at.is_some());
    }

    #[tokio::test]
    async fn setup_is_rejected_while_mfa_is_active() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        let orch = orchestrator(store);
        assert!(matches!(
            orch.setup_mfa(2).await,
            Err(AuthError::MfaAlreadyEnabled)
        ));
    }

    #[tokio::test]
    async fn disable_is_blocked_by_role_policy_without_mutation() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        store.insert_policy(MfaRolePolicy {
            role_id: 1,
            mfa_required: true,
            enforced_by_admin: true,
        });
        let orch = orchestrator(store.clone());

        let result = orch.disable_mfa(2, Some(PASSWORD)).await;
        assert!(matches!(result, Err(AuthError::MfaRequiredByPolicy)));
        assert!(store.user(2).mfa_enabled);
        assert!(store.user(2).mfa_secret.is_some());
    }

    #[tokio::test]
    async fn disable_clears_state_and_revokes_sessions() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        let orch = orchestrator(store.clone());

        let tokens = orch.verify_mfa(2, totp(), &meta()).await.unwrap();
        assert_eq!(store.live_token_count(2), 1);

        orch.disable_mfa(2, Some(PASSWORD)).await.unwrap();
        let cleared = store.user(2);
        assert!(!cleared.mfa_enabled);
        assert!(cleared.mfa_secret.is_none());
        assert!(cleared.mfa_backup_codes.is_empty());
        assert!(cleared.mfa_verified_at.is_none());
        assert_eq!(store.live_token_count(2), 0);
        // Access tokens from before the disable are dead too.
        assert!(orch.authorize_access(&tokens.access_token).await.is_err());
    }

    #[tokio::test]
    async fn disable_requires_matching_password_when_supplied() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        let orch = orchestrator(store.clone());

        let result = orch.disable_mfa(2, Some("wrong")).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        assert!(store.user(2).mfa_enabled);
    }

    #[tokio::test]
    async fn refresh_rotates_and_the_old_token_dies() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store);

        let LoginOutcome::Tokens(first) =
            orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap()
        else {
            panic!("expected tokens");
        };

        let second = orch.refresh(&first.refresh_token, &meta()).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let replay = orch.refresh(&first.refresh_token, &meta()).await;
        assert!(matches!(replay, Err(AuthError::InvalidCredentials)));

        // The rotated token still works.
        assert!(orch.refresh(&second.refresh_token, &meta()).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_fails_after_revoke_all() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store);

        let LoginOutcome::Tokens(tokens) =
            orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap()
        else {
            panic!("expected tokens");
        };

        // e.g. password reset: administrator logs the user out everywhere.
        orch.revocation().revoke_all_for_user(1).await.unwrap();

        let result = orch.refresh(&tokens.refresh_token, &meta()).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store.clone());

        let LoginOutcome::Tokens(tokens) =
            orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap()
        else {
            panic!("expected tokens");
        };

        orch.logout(&tokens.refresh_token).await.unwrap();
        assert_eq!(store.live_token_count(1), 0);
        // Second logout with the same token is still a success.
        orch.logout(&tokens.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn multi_device_config_skips_revocation_on_login() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let config = AuthConfig::new()
            .with_backup_code_pepper(pepper().to_vec())
            .with_single_session(false);
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(FixedCodeEngine::new(SECRET, CODE)),
            TokenIssuer::generate("sigilo", "sigilo-api").unwrap(),
            Arc::new(TracingAuditSink),
            config,
        );

        for _ in 0..2 {
            let outcome = orch.login("u1@example.com", PASSWORD, &meta()).await.unwrap();
            assert!(matches!(outcome, LoginOutcome::Tokens(_)));
        }
        assert_eq!(store.live_token_count(1), 2);
        assert_eq!(store.user(1).session_version, 0);
    }

    #[tokio::test]
    async fn rate_limited_login_never_touches_credentials() {
        struct DenyAll;
        impl RateLimiter for DenyAll {
            fn check_ip(&self, _ip: Option<&str>, _action: RateLimitAction) -> RateLimitDecision {
                RateLimitDecision::Limited
            }
            fn check_email(&self, _email: &str, _action: RateLimitAction) -> RateLimitDecision {
                RateLimitDecision::Limited
            }
        }

        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(1, "u1@example.com", false));
        let orch = orchestrator(store.clone()).with_rate_limiter(Arc::new(DenyAll));

        let result = orch.login("u1@example.com", PASSWORD, &meta()).await;
        assert!(matches!(result, Err(AuthError::RateLimited)));
        assert_eq!(store.live_token_count(1), 0);
    }

    #[tokio::test]
    async fn mfa_status_reflects_policy() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(user(2, "u2@example.com", true));
        store.insert_policy(MfaRolePolicy {
            role_id: 1,
            mfa_required: true,
            enforced_by_admin: false,
        });
        let orch = orchestrator(store);

        let status = orch.mfa_status(2).await.unwrap();
        assert!(status.mfa_enabled);
        assert!(status.mfa_required);
        assert!(!status.enforced_by_admin);
        assert_eq!(status.role, "employee");
    }
}
