//! Credential store: user records, refresh tokens, and MFA role policies.
//!
//! The store is the only synchronization point between concurrent
//! authentication requests. Backup-code consumption and session-version bumps
//! are single atomic statements; revoke-all plus version bump runs as one
//! transaction so a crash mid-login fails safe (logged out, never stale).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

/// A user as the authentication core sees it.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub role_id: i64,
    pub mfa_enabled: bool,
    /// Present only while MFA is enabled or a setup is pending confirmation.
    pub mfa_secret: Option<String>,
    /// Argon2id hashes of the unused backup codes.
    pub mfa_backup_codes: Vec<String>,
    pub mfa_verified_at: Option<OffsetDateTime>,
    /// Monotonic counter embedded in access tokens; bumping it is the global
    /// kill-switch for every previously issued token.
    pub session_version: i64,
    pub last_login_at: Option<OffsetDateTime>,
    /// Per-user access-token TTL override in minutes.
    pub access_ttl_minutes: Option<i64>,
}

/// Per-role MFA requirement, set by administrators and read-only here.
#[derive(Clone, Copy, Debug)]
pub struct MfaRolePolicy {
    pub role_id: i64,
    pub mfa_required: bool,
    pub enforced_by_admin: bool,
}

/// Input for persisting a freshly issued refresh token. Only the hash of the
/// raw token ever reaches the store.
#[derive(Clone, Debug)]
pub struct NewRefreshToken {
    pub token_id: Uuid,
    pub user_id: i64,
    pub token_hash: Vec<u8>,
    pub expires_at: OffsetDateTime,
    pub created_from_ip: Option<String>,
    pub created_from_user_agent: Option<String>,
}

/// A live (non-revoked, non-expired) refresh token record.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub token_id: Uuid,
    pub user_id: i64,
    pub expires_at: OffsetDateTime,
}

/// Transactional persistence boundary consumed by the orchestrator.
///
/// Implementations must make `consume_backup_code_hash`,
/// `bump_session_version`, and `revoke_all_and_bump_session` atomic with
/// respect to concurrent calls for the same user.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;

    async fn get_user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>>;

    /// Set or clear the (pending or active) MFA secret.
    async fn set_mfa_secret(&self, user_id: i64, secret: Option<&str>) -> Result<()>;

    /// Flip MFA on and stamp `mfa_verified_at`.
    async fn enable_mfa(&self, user_id: i64) -> Result<()>;

    /// Clear `mfa_enabled`, secret, backup codes, and `mfa_verified_at`.
    async fn clear_mfa(&self, user_id: i64) -> Result<()>;

    /// Replace the stored backup-code hashes wholesale; previously issued
    /// codes become invalid unconditionally.
    async fn set_backup_codes(&self, user_id: i64, hashes: &[String]) -> Result<()>;

    /// Remove one backup-code hash if it is still present. Returns whether
    /// this call consumed it; of two racers exactly one sees `true`.
    async fn consume_backup_code_hash(&self, user_id: i64, hash: &str) -> Result<bool>;

    /// Atomically increment and return the session version.
    async fn bump_session_version(&self, user_id: i64) -> Result<i64>;

    /// Revoke every live refresh token for the user and bump the session
    /// version, as one transaction. Returns the new version.
    async fn revoke_all_and_bump_session(&self, user_id: i64) -> Result<i64>;

    async fn touch_mfa_verified(&self, user_id: i64) -> Result<()>;

    async fn update_last_login(&self, user_id: i64) -> Result<()>;

    async fn insert_refresh_token(&self, record: &NewRefreshToken) -> Result<()>;

    /// Look up a live refresh token by hash; revoked or expired records are
    /// not returned.
    async fn find_refresh_token_by_hash(&self, hash: &[u8]) -> Result<Option<RefreshTokenRecord>>;

    /// Mark one refresh token revoked. Idempotent.
    async fn revoke_refresh_token(&self, token_id: Uuid) -> Result<()>;

    /// Revoke every live refresh token for the user without touching the
    /// session version.
    async fn revoke_all_refresh_tokens(&self, user_id: i64) -> Result<()>;

    async fn get_mfa_policy_for_role(&self, role_id: i64) -> Result<Option<MfaRolePolicy>>;
}

/// True when the error chain contains a Postgres unique violation (23505).
pub(crate) fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => {
            db_err.code().is_some_and(|code| code.as_ref() == "23505")
        }
        _ => false,
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = r"
    users.id, users.email, users.password_hash,
    roles.name AS role, users.role_id,
    users.mfa_enabled, users.mfa_secret, users.mfa_backup_codes,
    users.mfa_verified_at, users.session_version, users.last_login_at,
    users.access_ttl_minutes
";

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: row.get("role"),
        role_id: row.get("role_id"),
        mfa_enabled: row.get("mfa_enabled"),
        mfa_secret: row.get("mfa_secret"),
        mfa_backup_codes: row.get("mfa_backup_codes"),
        mfa_verified_at: row.get("mfa_verified_at"),
        session_version: row.get("session_version"),
        last_login_at: row.get("last_login_at"),
        access_ttl_minutes: row.get("access_ttl_minutes"),
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users JOIN roles ON roles.id = users.role_id WHERE users.email = $1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by email")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn get_user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users JOIN roles ON roles.id = users.role_id WHERE users.id = $1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn set_mfa_secret(&self, user_id: i64, secret: Option<&str>) -> Result<()> {
        let query = "UPDATE users SET mfa_secret = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(secret)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update mfa secret")?;
        Ok(())
    }

    async fn enable_mfa(&self, user_id: i64) -> Result<()> {
        let query = r"
            UPDATE users
            SET mfa_enabled = TRUE, mfa_verified_at = NOW(), updated_at = NOW()
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to enable mfa")?;
        Ok(())
    }

    async fn clear_mfa(&self, user_id: i64) -> Result<()> {
        let query = r"
            UPDATE users
            SET mfa_enabled = FALSE,
                mfa_secret = NULL,
                mfa_backup_codes = '{}',
                mfa_verified_at = NULL,
                updated_at = NOW()
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to clear mfa state")?;
        Ok(())
    }

    async fn set_backup_codes(&self, user_id: i64, hashes: &[String]) -> Result<()> {
        let query = "UPDATE users SET mfa_backup_codes = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(hashes)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to replace backup codes")?;
        Ok(())
    }

    async fn consume_backup_code_hash(&self, user_id: i64, hash: &str) -> Result<bool> {
        // Single statement: removal only succeeds while the hash is still in
        // the array, so concurrent consumers cannot both win.
        let query = r"
            UPDATE users
            SET mfa_backup_codes = array_remove(mfa_backup_codes, $2),
                updated_at = NOW()
            WHERE id = $1
              AND $2 = ANY(mfa_backup_codes)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume backup code")?;
        Ok(result.rows_affected() == 1)
    }

    async fn bump_session_version(&self, user_id: i64) -> Result<i64> {
        let query = r"
            UPDATE users
            SET session_version = session_version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING session_version
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to bump session version")?;
        Ok(row.get("session_version"))
    }

    async fn revoke_all_and_bump_session(&self, user_id: i64) -> Result<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin revoke-and-bump transaction")?;

        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE user_id = $1 AND NOT revoked AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to revoke refresh tokens")?;

        let query = r"
            UPDATE users
            SET session_version = session_version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING session_version
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to bump session version")?;

        tx.commit()
            .await
            .context("commit revoke-and-bump transaction")?;
        Ok(row.get("session_version"))
    }

    async fn touch_mfa_verified(&self, user_id: i64) -> Result<()> {
        let query = "UPDATE users SET mfa_verified_at = NOW(), updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to stamp mfa_verified_at")?;
        Ok(())
    }

    async fn update_last_login(&self, user_id: i64) -> Result<()> {
        let query = "UPDATE users SET last_login_at = NOW(), updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to stamp last_login_at")?;
        Ok(())
    }

    async fn insert_refresh_token(&self, record: &NewRefreshToken) -> Result<()> {
        let query = r"
            INSERT INTO refresh_tokens
                (token_id, user_id, token_hash, expires_at, revoked,
                 created_from_ip, created_from_user_agent)
            VALUES ($1, $2, $3, $4, FALSE, $5, $6)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.token_id)
            .bind(record.user_id)
            .bind(&record.token_hash)
            .bind(record.expires_at)
            .bind(&record.created_from_ip)
            .bind(&record.created_from_user_agent)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert refresh token")?;
        Ok(())
    }

    async fn find_refresh_token_by_hash(&self, hash: &[u8]) -> Result<Option<RefreshTokenRecord>> {
        let query = r"
            SELECT token_id, user_id, expires_at
            FROM refresh_tokens
            WHERE token_hash = $1
              AND NOT revoked
              AND expires_at > NOW()
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup refresh token")?;
        Ok(row.map(|row| RefreshTokenRecord {
            token_id: row.get("token_id"),
            user_id: row.get("user_id"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn revoke_refresh_token(&self, token_id: Uuid) -> Result<()> {
        // Idempotent; revoking an already-revoked or missing token is a no-op.
        let query = "UPDATE refresh_tokens SET revoked = TRUE WHERE token_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke refresh token")?;
        Ok(())
    }

    async fn revoke_all_refresh_tokens(&self, user_id: i64) -> Result<()> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE user_id = $1 AND NOT revoked AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke refresh tokens")?;
        Ok(())
    }

    async fn get_mfa_policy_for_role(&self, role_id: i64) -> Result<Option<MfaRolePolicy>> {
        let query = r"
            SELECT role_id, mfa_required, enforced_by_admin
            FROM mfa_role_policies
            WHERE role_id = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(role_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup mfa role policy")?;
        Ok(row.map(|row| MfaRolePolicy {
            role_id: row.get("role_id"),
            mfa_required: row.get("mfa_required"),
            enforced_by_admin: row.get("enforced_by_admin"),
        }))
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store for orchestrator tests; the mutex stands in for the
    //! database's row-level atomicity.

    use super::{
        CredentialStore, MfaRolePolicy, NewRefreshToken, RefreshTokenRecord, UserRecord,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[derive(Clone, Debug)]
    struct StoredToken {
        record: NewRefreshToken,
        revoked: bool,
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        users: Mutex<HashMap<i64, UserRecord>>,
        tokens: Mutex<HashMap<Uuid, StoredToken>>,
        policies: Mutex<HashMap<i64, MfaRolePolicy>>,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn insert_user(&self, user: UserRecord) {
            self.users.lock().unwrap().insert(user.id, user);
        }

        pub(crate) fn insert_policy(&self, policy: MfaRolePolicy) {
            self.policies.lock().unwrap().insert(policy.role_id, policy);
        }

        pub(crate) fn user(&self, user_id: i64) -> UserRecord {
            self.users.lock().unwrap().get(&user_id).cloned().unwrap()
        }

        pub(crate) fn live_token_count(&self, user_id: i64) -> usize {
            self.tokens
                .lock()
                .unwrap()
                .values()
                .filter(|stored| stored.record.user_id == user_id && !stored.revoked)
                .count()
        }

        fn with_user<T>(&self, user_id: i64, f: impl FnOnce(&mut UserRecord) -> T) -> Result<T> {
            let mut users = self.users.lock().unwrap();
            let user = users
                .get_mut(&user_id)
                .ok_or_else(|| anyhow!("user {user_id} not found"))?;
            Ok(f(user))
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .values()
                .find(|user| user.email == email)
                .cloned())
        }

        async fn get_user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>> {
            Ok(self.users.lock().unwrap().get(&user_id).cloned())
        }

        async fn set_mfa_secret(&self, user_id: i64, secret: Option<&str>) -> Result<()> {
            self.with_user(user_id, |user| {
                user.mfa_secret = secret.map(str::to_string);
            })
        }

        async fn enable_mfa(&self, user_id: i64) -> Result<()> {
            self.with_user(user_id, |user| {
                user.mfa_enabled = true;
                user.mfa_verified_at = Some(OffsetDateTime::now_utc());
            })
        }

        async fn clear_mfa(&self, user_id: i64) -> Result<()> {
            self.with_user(user_id, |user| {
                user.mfa_enabled = false;
                user.mfa_secret = None;
                user.mfa_backup_codes.clear();
                user.mfa_verified_at = None;
            })
        }

        async fn set_backup_codes(&self, user_id: i64, hashes: &[String]) -> Result<()> {
            self.with_user(user_id, |user| {
                user.mfa_backup_codes = hashes.to_vec();
            })
        }

        async fn consume_backup_code_hash(&self, user_id: i64, hash: &str) -> Result<bool> {
            self.with_user(user_id, |user| {
                let before = user.mfa_backup_codes.len();
                user.mfa_backup_codes.retain(|stored| stored != hash);
                user.mfa_backup_codes.len() < before
            })
        }

        async fn bump_session_version(&self, user_id: i64) -> Result<i64> {
            self.with_user(user_id, |user| {
                user.session_version += 1;
                user.session_version
            })
        }

        async fn revoke_all_and_bump_session(&self, user_id: i64) -> Result<i64> {
            self.revoke_all_refresh_tokens(user_id).await?;
            self.bump_session_version(user_id).await
        }

        async fn touch_mfa_verified(&self, user_id: i64) -> Result<()> {
            self.with_user(user_id, |user| {
                user.mfa_verified_at = Some(OffsetDateTime::now_utc());
            })
        }

        async fn update_last_login(&self, user_id: i64) -> Result<()> {
            self.with_user(user_id, |user| {
                user.last_login_at = Some(OffsetDateTime::now_utc());
            })
        }

        async fn insert_refresh_token(&self, record: &NewRefreshToken) -> Result<()> {
            self.tokens.lock().unwrap().insert(
                record.token_id,
                StoredToken {
                    record: record.clone(),
                    revoked: false,
                },
            );
            Ok(())
        }

        async fn find_refresh_token_by_hash(
            &self,
            hash: &[u8],
        ) -> Result<Option<RefreshTokenRecord>> {
            let now = OffsetDateTime::now_utc();
            Ok(self
                .tokens
                .lock()
                .unwrap()
                .values()
                .find(|stored| {
                    !stored.revoked
                        && stored.record.token_hash == hash
                        && stored.record.expires_at > now
                })
                .map(|stored| RefreshTokenRecord {
                    token_id: stored.record.token_id,
                    user_id: stored.record.user_id,
                    expires_at: stored.record.expires_at,
                }))
        }

        async fn revoke_refresh_token(&self, token_id: Uuid) -> Result<()> {
            if let Some(stored) = self.tokens.lock().unwrap().get_mut(&token_id) {
                stored.revoked = true;
            }
            Ok(())
        }

        async fn revoke_all_refresh_tokens(&self, user_id: i64) -> Result<()> {
            for stored in self.tokens.lock().unwrap().values_mut() {
                if stored.record.user_id == user_id {
                    stored.revoked = true;
                }
            }
            Ok(())
        }

        async fn get_mfa_policy_for_role(&self, role_id: i64) -> Result<Option<MfaRolePolicy>> {
            Ok(self.policies.lock().unwrap().get(&role_id).copied())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn user_with_codes(codes: &[&str]) -> UserRecord {
            UserRecord {
                id: 1,
                email: "u@example.com".to_string(),
                password_hash: String::new(),
                role: "employee".to_string(),
                role_id: 1,
                mfa_enabled: true,
                mfa_secret: Some("SECRET".to_string()),
                mfa_backup_codes: codes.iter().map(|code| (*code).to_string()).collect(),
                mfa_verified_at: None,
                session_version: 0,
                last_login_at: None,
                access_ttl_minutes: None,
            }
        }

        #[tokio::test]
        async fn consume_is_single_use() {
            let store = MemoryStore::new();
            store.insert_user(user_with_codes(&["h1", "h2"]));

            assert!(store.consume_backup_code_hash(1, "h1").await.unwrap());
            assert!(!store.consume_backup_code_hash(1, "h1").await.unwrap());
            assert_eq!(store.user(1).mfa_backup_codes, vec!["h2".to_string()]);
        }

        #[tokio::test]
        async fn bump_is_strictly_increasing() {
            let store = MemoryStore::new();
            store.insert_user(user_with_codes(&[]));
            assert_eq!(store.bump_session_version(1).await.unwrap(), 1);
            assert_eq!(store.bump_session_version(1).await.unwrap(), 2);
        }
    }
}
