//! Single global execution slot
//!
//! At most one backup, restore or delete runs at a time. Contention fails
//! fast rather than queueing. Within a process the slot is a tokio mutex;
//! across processes sharing a base directory it is an exclusive lock on
//! `engine.lock`, held for as long as the guard lives.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::{BackupError, BackupResult};
use crate::storage::{read_lock_note, FileLock};

/// The slot shared by every pipeline of one engine
#[derive(Debug, Clone, Default)]
pub struct ExecutionSlot {
    lock: Arc<Mutex<()>>,
    holder: Arc<StdMutex<Option<String>>>,
    lock_file: Option<PathBuf>,
}

impl ExecutionSlot {
    /// A slot private to this process
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot also shared with other processes through `lock_file`
    pub fn with_lock_file(lock_file: PathBuf) -> Self {
        Self {
            lock_file: Some(lock_file),
            ..Self::default()
        }
    }

    /// Take the slot for `operation`, or fail with `Concurrency` naming the
    /// current holder
    pub fn try_acquire(&self, operation: impl Into<String>) -> BackupResult<SlotGuard> {
        let permit = match Arc::clone(&self.lock).try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(BackupError::Concurrency {
                    holder: self.holder().unwrap_or_else(|| "unknown operation".to_string()),
                })
            }
        };

        let operation = operation.into();
        let file_lock = match &self.lock_file {
            Some(path) => match FileLock::try_acquire(path)? {
                Some(mut file_lock) => {
                    let note = format!("{} (pid {})", operation, std::process::id());
                    if let Err(e) = file_lock.write_note(&note) {
                        warn!(error = %e, "Could not record engine lock holder");
                    }
                    Some(file_lock)
                }
                None => {
                    return Err(BackupError::Concurrency {
                        holder: read_lock_note(path)
                            .unwrap_or_else(|| "another process".to_string()),
                    })
                }
            },
            None => None,
        };

        if let Ok(mut holder) = self.holder.lock() {
            *holder = Some(operation.clone());
        }

        Ok(SlotGuard {
            _file_lock: file_lock,
            _permit: permit,
            holder: Arc::clone(&self.holder),
            operation,
        })
    }

    /// Whether this or another process currently holds the slot
    pub fn is_held(&self) -> bool {
        if self.lock.try_lock().is_err() {
            return true;
        }
        match &self.lock_file {
            Some(path) => matches!(FileLock::try_acquire(path), Ok(None)),
            None => false,
        }
    }

    /// Name of the operation currently holding the slot
    pub fn holder(&self) -> Option<String> {
        if let Some(holder) = self.holder.lock().ok().and_then(|h| h.clone()) {
            return Some(holder);
        }
        let path = self.lock_file.as_ref()?;
        match FileLock::try_acquire(path) {
            Ok(None) => read_lock_note(path),
            _ => None,
        }
    }
}

/// Releases the slot when dropped
#[derive(Debug)]
pub struct SlotGuard {
    _file_lock: Option<FileLock>,
    _permit: OwnedMutexGuard<()>,
    holder: Arc<StdMutex<Option<String>>>,
    operation: String,
}

impl SlotGuard {
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Runs before the lock fields are dropped, so the name is cleared
        // while the slot is still held
        if let Ok(mut holder) = self.holder.lock() {
            *holder = None;
        }
    }
}
