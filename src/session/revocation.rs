//! Session revocation: individual refresh tokens, whole-user revocation, and
//! the session-version kill-switch.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::store::CredentialStore;

/// Invalidates outstanding credentials for a user.
///
/// Refresh tokens are revoked record by record; access tokens are invalidated
/// wholesale by bumping the per-user session version embedded in each token
/// at issuance (a generation counter, no revocation list needed).
#[derive(Clone)]
pub struct RevocationAuthority {
    store: Arc<dyn CredentialStore>,
}

impl RevocationAuthority {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Revoke a single refresh token. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    pub async fn revoke_one(&self, token_id: Uuid) -> Result<()> {
        self.store.revoke_refresh_token(token_id).await
    }

    /// Revoke every live refresh token for the user ("log out everywhere"
    /// without invalidating still-valid access tokens).
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    pub async fn revoke_all_for_user(&self, user_id: i64) -> Result<()> {
        self.store.revoke_all_refresh_tokens(user_id).await
    }

    /// Bump the session version, invalidating every previously issued access
    /// token for the user.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    pub async fn bump_session_version(&self, user_id: i64) -> Result<i64> {
        let version = self.store.bump_session_version(user_id).await?;
        info!(user_id, session_version = version, "session version bumped");
        Ok(version)
    }

    /// Full revocation as one transaction: all refresh tokens revoked and the
    /// session version bumped. Used on every successful full login under the
    /// single-session policy, and on password/MFA state changes.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    pub async fn revoke_all_and_bump(&self, user_id: i64) -> Result<i64> {
        let version = self.store.revoke_all_and_bump_session(user_id).await?;
        info!(
            user_id,
            session_version = version,
            "all sessions revoked, version bumped"
        );
        Ok(version)
    }
}
