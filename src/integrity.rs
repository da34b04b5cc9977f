//! Artifact integrity checks
//!
//! SHA-256 digests over files, computed in streaming fashion and encoded as
//! lowercase hex.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{BackupError, BackupResult};

const BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex SHA-256 digest of a file on the calling thread
pub fn file_sha256(path: &Path) -> BackupResult<String> {
    let file = File::open(path).map_err(|e| {
        BackupError::Io(format!("Failed to open {} for hashing: {}", path.display(), e))
    })?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| {
            BackupError::Io(format!("Failed to read {} for hashing: {}", path.display(), e))
        })?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Digest computation and verification for artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Hex SHA-256 of the file at `path`
    pub async fn checksum(&self, path: &Path) -> BackupResult<String> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || file_sha256(&path))
            .await
            .map_err(|e| BackupError::Io(format!("Hashing task failed: {}", e)))?
    }

    /// Whether the file digest equals `expected` (hex compared case-insensitively)
    pub async fn verify(&self, path: &Path, expected: &str) -> BackupResult<bool> {
        let actual = self.checksum(path).await?;
        let matches = actual.eq_ignore_ascii_case(expected.trim());
        debug!(path = %path.display(), matches, "Verified artifact digest");
        Ok(matches)
    }

    /// Like [`IntegrityVerifier::verify`] but a mismatch is an error
    ///
    /// Returns the computed digest on success.
    pub async fn require(&self, path: &Path, expected: &str) -> BackupResult<String> {
        let actual = self.checksum(path).await?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(actual)
        } else {
            Err(BackupError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // sha256("abc")
    const ABC_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(file_sha256(&path).unwrap(), ABC_DIGEST);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp = TempDir::new().unwrap();
        let result = file_sha256(&temp.path().join("missing"));
        assert!(matches!(result, Err(BackupError::Io(_))));
    }

    #[tokio::test]
    async fn test_verify_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();

        let verifier = IntegrityVerifier::new();
        assert!(verifier.verify(&path, ABC_DIGEST).await.unwrap());
        assert!(verifier
            .verify(&path, &ABC_DIGEST.to_uppercase())
            .await
            .unwrap());
        assert!(!verifier.verify(&path, &"0".repeat(64)).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_flipped_byte_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifact.enc");
        let mut data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        fs::write(&path, &data).unwrap();

        let verifier = IntegrityVerifier::new();
        let digest = verifier.checksum(&path).await.unwrap();

        data[5_000] ^= 0x01;
        fs::write(&path, &data).unwrap();

        let err = verifier.require(&path, &digest).await.unwrap_err();
        assert!(err.is_checksum_mismatch());
    }
}
