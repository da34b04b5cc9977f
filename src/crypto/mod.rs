//! Cryptographic functions for the backup engine
//!
//! Provides streaming AES-256-CBC artifact encryption with Argon2id key
//! derivation from an externally supplied secret.

pub mod codec;
pub mod key_derivation;
pub mod secure_memory;

pub use codec::{decrypt_stream, encrypt_stream, ArtifactCodec, NONCE_LEN};
pub use key_derivation::{
    derive_key, validate_salt, EncryptionKey, KeyDerivationParams, ENCRYPTION_KEY_ENV,
    KEY_SALT_ENV,
};
pub use secure_memory::{redact, SecureString};
