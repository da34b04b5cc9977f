//! Key derivation using Argon2id
//!
//! Derives the artifact encryption key from an externally supplied secret.
//! There is no built-in default: a missing or short secret is a
//! configuration error and the engine refuses to start.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2, Params,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::secure_memory::SecureString;
use crate::error::{BackupError, BackupResult};

/// Environment variable holding the encryption secret
pub const ENCRYPTION_KEY_ENV: &str = "POS_BACKUP_ENCRYPTION_KEY";

/// Environment variable that replaces the stored salt, for recovering
/// artifacts on a host whose settings file was lost
pub const KEY_SALT_ENV: &str = "POS_BACKUP_KEY_SALT";

/// Minimum number of characters accepted for the secret
pub const MIN_SECRET_CHARS: usize = 32;

/// Length of the derived AES-256 key
pub const KEY_LEN: usize = 32;

/// Parameters for key derivation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDerivationParams {
    /// Salt for key derivation (base64 encoded)
    pub salt: String,
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost: u32,
    /// Time cost (iterations, default: 3)
    pub time_cost: u32,
    /// Parallelism degree (default: 4)
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            salt: String::new(),
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KeyDerivationParams {
    /// Create new params with a random salt
    pub fn new() -> Self {
        let salt = SaltString::generate(&mut OsRng);
        Self {
            salt: salt.to_string(),
            ..Default::default()
        }
    }

    /// Create params with specific values
    pub fn with_values(salt: String, memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            salt,
            memory_cost,
            time_cost,
            parallelism,
        }
    }
}

/// A derived encryption key, zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Derive the key from the secret in `POS_BACKUP_ENCRYPTION_KEY`
    pub fn from_env(params: &KeyDerivationParams) -> BackupResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), params)
    }

    /// Same as [`EncryptionKey::from_env`] with an injectable lookup
    pub fn from_lookup<F>(lookup: F, params: &KeyDerivationParams) -> BackupResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup(ENCRYPTION_KEY_ENV).map(SecureString::new).ok_or_else(|| {
            BackupError::Configuration(format!(
                "{} is not set; refusing to start without an encryption key",
                ENCRYPTION_KEY_ENV
            ))
        })?;
        derive_key(&secret, params)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Check that `salt` is usable for key derivation
pub fn validate_salt(salt: &str) -> BackupResult<()> {
    parse_salt(salt).map(|_| ())
}

fn parse_salt(salt: &str) -> BackupResult<SaltString> {
    SaltString::from_b64(salt)
        .map_err(|e| BackupError::Configuration(format!("Invalid key salt: {}", e)))
}

/// Derive an encryption key from a secret
pub fn derive_key(secret: &SecureString, params: &KeyDerivationParams) -> BackupResult<EncryptionKey> {
    if secret.trim().is_empty() {
        return Err(BackupError::Configuration(
            "Encryption key is empty".to_string(),
        ));
    }
    if secret.char_count() < MIN_SECRET_CHARS {
        return Err(BackupError::Configuration(format!(
            "Encryption key must be at least {} characters",
            MIN_SECRET_CHARS
        )));
    }

    let salt = parse_salt(&params.salt)?;

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| BackupError::Configuration(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let hash = argon2
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| BackupError::Encryption(format!("Key derivation failed: {}", e)))?;

    let hash_output = hash
        .hash
        .ok_or_else(|| BackupError::Encryption("No hash output generated".to_string()))?;

    let hash_bytes = hash_output.as_bytes();
    if hash_bytes.len() < KEY_LEN {
        return Err(BackupError::Encryption(
            "Hash output too short for AES-256 key".to_string(),
        ));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&hash_bytes[..KEY_LEN]);

    Ok(EncryptionKey { key })
}
