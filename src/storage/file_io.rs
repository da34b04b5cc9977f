//! File I/O utilities with atomic writes and advisory locks
//!
//! JSON files are replaced by write-then-rename, so readers never see a
//! partial file. Writers that must not lose each other's changes go through
//! [`update_json`], which holds an exclusive lock on a sidecar file across
//! the whole read-modify-write. The lock is advisory and shared by every
//! process that opens the same base directory.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::BackupError;

/// Exclusive advisory lock on a file, released when dropped
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock is held
    pub fn acquire(path: &Path) -> Result<Self, BackupError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive().map_err(|e| {
            BackupError::Storage(format!("Failed to lock {}: {}", path.display(), e))
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock if nobody holds it; `None` when another handle does
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, BackupError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(BackupError::Storage(format!(
                "Failed to lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Replace the lock file's contents with a note naming the holder
    pub fn write_note(&mut self, note: &str) -> Result<(), BackupError> {
        let map = |e: std::io::Error| {
            BackupError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        };
        self.file.set_len(0).map_err(map)?;
        self.file.seek(SeekFrom::Start(0)).map_err(map)?;
        self.file.write_all(note.as_bytes()).map_err(map)?;
        self.file.flush().map_err(map)
    }
}

/// The note a holder left in a lock file, if any
pub fn read_lock_note(path: &Path) -> Option<String> {
    let mut note = String::new();
    File::open(path).ok()?.read_to_string(&mut note).ok()?;
    let note = note.trim();
    (!note.is_empty()).then(|| note.to_string())
}

fn open_lock_file(path: &Path) -> Result<File, BackupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BackupError::Storage(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| BackupError::Storage(format!("Failed to open {}: {}", path.display(), e)))
}

/// Read-modify-write a JSON file under an exclusive lock on `lock_path`
///
/// The file is re-read from disk after the lock is taken, so concurrent
/// writers in other processes never overwrite each other. Returns the data
/// as written together with the closure's result.
pub fn update_json<T, F, R>(path: &Path, lock_path: &Path, update: F) -> Result<(T, R), BackupError>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> R,
{
    let _lock = FileLock::acquire(lock_path)?;
    let mut data: T = read_json(path)?;
    let result = update(&mut data);
    write_json_atomic(path, &data)?;
    Ok((data, result))
}

/// Read JSON from a file, returning a default value if file doesn't exist
pub fn read_json<T, P>(path: P) -> Result<T, BackupError>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if !path.exists() {
        return Ok(T::default());
    }

    let file = File::open(path)
        .map_err(|e| BackupError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|e| BackupError::Storage(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write JSON to a file atomically (write to temp, then rename)
///
/// The file is either completely written or not modified at all.
pub fn write_json_atomic<T, P>(path: P, data: &T) -> Result<(), BackupError>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BackupError::Storage(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    // Temp file must live in the same directory for the rename to be atomic
    let temp_path = path.with_extension("json.tmp");

    let file = File::create(&temp_path)
        .map_err(|e| BackupError::Storage(format!("Failed to create temp file: {}", e)))?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)
        .map_err(|e| BackupError::Storage(format!("Failed to serialize data: {}", e)))?;

    writer
        .flush()
        .map_err(|e| BackupError::Storage(format!("Failed to flush data: {}", e)))?;

    writer
        .get_ref()
        .sync_all()
        .map_err(|e| BackupError::Storage(format!("Failed to sync data: {}", e)))?;

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        BackupError::Storage(format!("Failed to rename temp file: {}", e))
    })?;

    Ok(())
}
