//! Streaming artifact encryption
//!
//! Artifacts are written as `[16-byte random nonce][AES-256-CBC ciphertext]`
//! with PKCS#7 padding. Data is processed in fixed-size chunks so memory use
//! stays bounded regardless of the dump size.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes::Aes256;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::key_derivation::EncryptionKey;
use crate::error::{BackupError, BackupResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of the per-artifact nonce (the CBC IV) in bytes
pub const NONCE_LEN: usize = 16;

const BLOCK_LEN: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

/// Encrypt everything `reader` yields into `writer`
///
/// Returns the number of bytes written, nonce included.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &EncryptionKey,
    mut reader: R,
    mut writer: W,
) -> BackupResult<u64> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &nonce)
        .map_err(|e| BackupError::Encryption(format!("Failed to create cipher: {}", e)))?;

    writer.write_all(&nonce).map_err(encryption_io)?;
    let mut written = NONCE_LEN as u64;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + BLOCK_LEN);

    loop {
        let n = read_some(&mut reader, &mut buf).map_err(encryption_io)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        let ready = pending.len() / BLOCK_LEN * BLOCK_LEN;
        encrypt_blocks(&mut cipher, &mut pending[..ready]);
        writer.write_all(&pending[..ready]).map_err(encryption_io)?;
        written += ready as u64;
        pending.drain(..ready);
    }

    // PKCS#7: always emit a final padded block, a whole block of padding when
    // the input was block-aligned (including empty input)
    let pad = BLOCK_LEN - pending.len();
    pending.resize(BLOCK_LEN, pad as u8);
    encrypt_blocks(&mut cipher, &mut pending);
    writer.write_all(&pending).map_err(encryption_io)?;
    written += BLOCK_LEN as u64;

    writer.flush().map_err(encryption_io)?;
    Ok(written)
}

/// Decrypt an artifact stream from `reader` into `writer`
///
/// The nonce is read in full before the cipher is initialized, however the
/// underlying reader fragments its data. Returns the plaintext byte count.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &EncryptionKey,
    mut reader: R,
    mut writer: W,
) -> BackupResult<u64> {
    let mut nonce = [0u8; NONCE_LEN];
    reader.read_exact(&mut nonce).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BackupError::Decryption("Artifact is shorter than its nonce".to_string())
        } else {
            decryption_io(e)
        }
    })?;

    let mut cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &nonce)
        .map_err(|e| BackupError::Decryption(format!("Failed to create cipher: {}", e)))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + BLOCK_LEN);
    let mut written: u64 = 0;

    loop {
        let n = read_some(&mut reader, &mut buf).map_err(decryption_io)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        // Keep between 1 and 16 bytes back so the padded block is handled last
        let ready = pending.len().saturating_sub(1) / BLOCK_LEN * BLOCK_LEN;
        decrypt_blocks(&mut cipher, &mut pending[..ready]);
        writer.write_all(&pending[..ready]).map_err(decryption_io)?;
        written += ready as u64;
        pending.drain(..ready);
    }

    if pending.len() != BLOCK_LEN {
        return Err(BackupError::Decryption(
            "Ciphertext is not a whole number of blocks".to_string(),
        ));
    }

    decrypt_blocks(&mut cipher, &mut pending);
    let pad = pending[BLOCK_LEN - 1] as usize;
    if pad == 0 || pad > BLOCK_LEN || !pending[BLOCK_LEN - pad..].iter().all(|&b| b as usize == pad)
    {
        return Err(BackupError::Decryption(
            "Invalid padding: wrong key or corrupted artifact".to_string(),
        ));
    }

    let tail = BLOCK_LEN - pad;
    writer.write_all(&pending[..tail]).map_err(decryption_io)?;
    written += tail as u64;

    writer.flush().map_err(decryption_io)?;
    Ok(written)
}

/// Encrypt `input` into `output`, removing `output` on failure
pub fn encrypt_file(key: &EncryptionKey, input: &Path, output: &Path) -> BackupResult<u64> {
    let source = File::open(input).map_err(|e| {
        BackupError::Encryption(format!("Failed to open {}: {}", input.display(), e))
    })?;
    let target = File::create(output).map_err(|e| {
        BackupError::Encryption(format!("Failed to create {}: {}", output.display(), e))
    })?;

    let result = encrypt_stream(key, BufReader::new(source), BufWriter::new(&target))
        .and_then(|n| target.sync_all().map(|_| n).map_err(encryption_io));
    if result.is_err() {
        let _ = fs::remove_file(output);
    }
    result
}

/// Decrypt `input` into `output`, removing `output` on failure
pub fn decrypt_file(key: &EncryptionKey, input: &Path, output: &Path) -> BackupResult<u64> {
    let source = File::open(input).map_err(|e| {
        BackupError::Decryption(format!("Failed to open {}: {}", input.display(), e))
    })?;
    let target = File::create(output).map_err(|e| {
        BackupError::Decryption(format!("Failed to create {}: {}", output.display(), e))
    })?;

    let result = decrypt_stream(key, BufReader::new(source), BufWriter::new(&target));
    if result.is_err() {
        let _ = fs::remove_file(output);
    }
    result
}

/// Where `encrypt` places the artifact for a given input
pub fn encrypted_path_for(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".enc");
    PathBuf::from(name)
}

/// Async file-level codec holding the engine key
///
/// The blocking cipher work runs on tokio's blocking pool.
#[derive(Clone)]
pub struct ArtifactCodec {
    key: Arc<EncryptionKey>,
}

impl ArtifactCodec {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Encrypt `input` next to itself as `<input>.enc` and return that path
    pub async fn encrypt(&self, input: &Path) -> BackupResult<PathBuf> {
        let output = encrypted_path_for(input);
        self.encrypt_to(input, &output).await?;
        Ok(output)
    }

    /// Encrypt `input` into `output`
    pub async fn encrypt_to(&self, input: &Path, output: &Path) -> BackupResult<u64> {
        let key = Arc::clone(&self.key);
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        tokio::task::spawn_blocking(move || encrypt_file(&key, &input, &output))
            .await
            .map_err(|e| BackupError::Encryption(format!("Encryption task failed: {}", e)))?
    }

    /// Decrypt `input` into `output`
    pub async fn decrypt_to(&self, input: &Path, output: &Path) -> BackupResult<u64> {
        let key = Arc::clone(&self.key);
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        tokio::task::spawn_blocking(move || decrypt_file(&key, &input, &output))
            .await
            .map_err(|e| BackupError::Decryption(format!("Decryption task failed: {}", e)))?
    }
}

fn encrypt_blocks(cipher: &mut Aes256CbcEnc, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_LEN) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(cipher: &mut Aes256CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_LEN) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn encryption_io(e: io::Error) -> BackupError {
    BackupError::Encryption(format!("I/O failure while encrypting: {}", e))
}

fn decryption_io(e: io::Error) -> BackupError {
    BackupError::Decryption(format!("I/O failure while decrypting: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::test_key;
    use proptest::prelude::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Reader that hands out at most `step` bytes per call
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn round_trip(plaintext: &[u8]) -> Vec<u8> {
        let key = test_key();
        let mut artifact = Vec::new();
        encrypt_stream(&key, Cursor::new(plaintext), &mut artifact).unwrap();
        let mut out = Vec::new();
        decrypt_stream(&key, Cursor::new(&artifact), &mut out).unwrap();
        out
    }

    #[test]
    fn test_empty_round_trip() {
        let key = test_key();
        let mut artifact = Vec::new();
        let written = encrypt_stream(&key, Cursor::new(b""), &mut artifact).unwrap();
        assert_eq!(written, (NONCE_LEN + BLOCK_LEN) as u64);
        assert_eq!(artifact.len(), NONCE_LEN + BLOCK_LEN);
        assert!(round_trip(b"").is_empty());
    }

    #[test]
    fn test_block_aligned_and_unaligned_lengths() {
        for len in [1usize, 15, 16, 17, 31, 32, 33, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(round_trip(&data), data, "length {}", len);
        }
    }

    #[test]
    fn test_different_nonces() {
        let key = test_key();
        let mut a = Vec::new();
        let mut b = Vec::new();
        encrypt_stream(&key, Cursor::new(b"same input"), &mut a).unwrap();
        encrypt_stream(&key, Cursor::new(b"same input"), &mut b).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_nonce_split_across_reads() {
        let key = test_key();
        let plaintext: Vec<u8> = (0..1000).map(|i| (i * 7 % 256) as u8).collect();
        let mut artifact = Vec::new();
        encrypt_stream(&key, Cursor::new(&plaintext), &mut artifact).unwrap();

        for step in [1, 3, 7, 15, 17] {
            let mut out = Vec::new();
            decrypt_stream(&key, Trickle { data: &artifact, step }, &mut out).unwrap();
            assert_eq!(out, plaintext, "step {}", step);
        }
    }

    #[test]
    fn test_truncated_artifact_rejected() {
        let key = test_key();
        let mut out = Vec::new();
        let short = decrypt_stream(&key, Cursor::new(&[0u8; 10]), &mut out);
        assert!(matches!(short, Err(BackupError::Decryption(_))));

        let mut artifact = Vec::new();
        encrypt_stream(&key, Cursor::new(vec![9u8; 100]), &mut artifact).unwrap();
        artifact.truncate(artifact.len() - 5);
        let mut out = Vec::new();
        let result = decrypt_stream(&key, Cursor::new(&artifact), &mut out);
        assert!(matches!(result, Err(BackupError::Decryption(_))));
    }

    #[test]
    fn test_nonce_only_artifact_rejected() {
        let key = test_key();
        let mut out = Vec::new();
        let result = decrypt_stream(&key, Cursor::new(&[1u8; NONCE_LEN]), &mut out);
        assert!(matches!(result, Err(BackupError::Decryption(_))));
    }

    #[test]
    fn test_wrong_key_never_yields_plaintext() {
        let key = test_key();
        let other = crate::crypto::test_support::other_key();
        let plaintext = b"SELECT * FROM sales;".repeat(20);

        let mut artifact = Vec::new();
        encrypt_stream(&key, Cursor::new(&plaintext), &mut artifact).unwrap();

        let mut out = Vec::new();
        match decrypt_stream(&other, Cursor::new(&artifact), &mut out) {
            Err(e) => assert!(matches!(e, BackupError::Decryption(_))),
            Ok(_) => assert_ne!(out, plaintext),
        }
    }

    #[test]
    fn test_file_round_trip_and_output_path() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("dump.sql");
        let data: Vec<u8> = (0..200_000).map(|i| (i % 253) as u8).collect();
        fs::write(&input, &data).unwrap();

        let key = test_key();
        let output = encrypted_path_for(&input);
        assert_eq!(output, temp.path().join("dump.sql.enc"));

        let size = encrypt_file(&key, &input, &output).unwrap();
        assert_eq!(size, fs::metadata(&output).unwrap().len());

        let restored = temp.path().join("restored.sql");
        decrypt_file(&key, &output, &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn test_failed_decrypt_removes_output() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("garbage.enc");
        fs::write(&input, [7u8; 20]).unwrap();

        let output = temp.path().join("out.sql");
        assert!(decrypt_file(&test_key(), &input, &output).is_err());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_async_codec() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("dump.bin");
        fs::write(&input, b"pg_dump custom format bytes").unwrap();

        let codec = ArtifactCodec::new(test_key());
        let artifact = codec.encrypt(&input).await.unwrap();
        assert!(artifact.exists());

        let restored = temp.path().join("plain.bin");
        let n = codec.decrypt_to(&artifact, &restored).await.unwrap();
        assert_eq!(n, 27);
        assert_eq!(fs::read(&restored).unwrap(), b"pg_dump custom format bytes");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_decrypt_inverts_encrypt(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            prop_assert_eq!(round_trip(&data), data);
        }
    }
}
