//! One-time backup codes for account recovery when the authenticator is
//! unavailable.
//!
//! Codes are generated server-side, shown to the user exactly once, and only
//! their Argon2id hashes (peppered with a server-side secret) are persisted.
//! Consumption happens at the store so that two racing requests cannot both
//! spend the same code.

use anyhow::{anyhow, Context, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::{rngs::OsRng, RngCore};

const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP: usize = 4;
// No 0/O/1/I: users type these by hand off a printout.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated batch: plaintext for the user, hashes for the store.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub codes: Vec<String>,
    pub hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// Generate a full batch of codes hashed with the given pepper.
    ///
    /// # Errors
    /// Returns an error if the RNG or Argon2id hashing fails.
    pub fn generate(pepper: &[u8]) -> Result<Self> {
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = random_code()?;
            let hash = hash_backup_code(&code, pepper)?;
            codes.push(code);
            hashes.push(hash);
        }
        Ok(Self { codes, hashes })
    }
}

/// Strip separators, uppercase, and validate length/alphabet.
///
/// # Errors
/// Returns an error for input that cannot be a backup code.
pub fn normalize_backup_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }
    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| BACKUP_CODE_ALPHABET.contains(ch))
    {
        return Err(anyhow!("invalid backup code characters"));
    }
    Ok(normalized)
}

/// Group a normalized code as `XXXX-XXXX-XXXX` for display.
///
/// # Errors
/// Returns an error if the input is not a normalized code.
pub fn format_backup_code(normalized: &str) -> Result<String> {
    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 2);
    for (idx, chunk) in normalized.as_bytes().chunks(BACKUP_CODE_GROUP).enumerate() {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid backup code chunk")?);
    }
    Ok(out)
}

/// Check a submitted code against one stored hash.
///
/// # Errors
/// Returns an error only for unusable input or a corrupt stored hash; a wrong
/// code is `Ok(false)`.
pub fn verify_backup_code(code: &str, stored_hash: &str, pepper: &[u8]) -> Result<bool> {
    let normalized = normalize_backup_code(code)?;
    let parsed =
        PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid backup code hash"))?;
    Ok(peppered_argon2(pepper)?
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

fn random_code() -> Result<String> {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    OsRng
        .try_fill_bytes(&mut raw)
        .context("failed to generate backup code")?;
    let mut normalized = String::with_capacity(BACKUP_CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % BACKUP_CODE_ALPHABET.len();
        if let Some(&char_byte) = BACKUP_CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_backup_code(&normalized)
}

fn hash_backup_code(code: &str, pepper: &[u8]) -> Result<String> {
    let normalized = normalize_backup_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = peppered_argon2(pepper)?
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash backup code"))?
        .to_string();
    Ok(hash)
}

fn peppered_argon2(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| anyhow!("failed to initialize Argon2id"))
}
