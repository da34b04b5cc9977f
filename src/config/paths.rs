//! Path management for the backup engine
//!
//! Provides XDG-compliant path resolution for configuration, metadata,
//! artifacts and scratch space.
//!
//! ## Path Resolution Order
//!
//! 1. `POS_BACKUP_DATA_DIR` environment variable (if set)
//! 2. Unix (Linux/macOS): `$XDG_CONFIG_HOME/pos-backup` or `~/.config/pos-backup`
//! 3. Windows: `%APPDATA%\pos-backup`

use std::path::PathBuf;

use crate::error::BackupError;

/// Environment variable overriding the base directory
pub const DATA_DIR_ENV: &str = "POS_BACKUP_DATA_DIR";

/// Manages all paths used by the backup engine
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// Base directory for all engine data
    base_dir: PathBuf,
}

impl EnginePaths {
    /// Create a new EnginePaths instance
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self, BackupError> {
        let base_dir = if let Ok(custom) = std::env::var(DATA_DIR_ENV) {
            PathBuf::from(custom)
        } else {
            resolve_default_path()?
        };

        Ok(Self { base_dir })
    }

    /// Create EnginePaths with a custom base directory (useful for testing)
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Directory holding encrypted artifacts
    pub fn backup_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    /// Directory for raw dumps and decrypted scratch copies
    pub fn scratch_dir(&self) -> PathBuf {
        self.base_dir.join("scratch")
    }

    /// Get the path to the settings file
    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the path to the backup metadata file
    pub fn metadata_file(&self) -> PathBuf {
        self.base_dir.join("backups.json")
    }

    /// Get the path to the audit log
    pub fn audit_log(&self) -> PathBuf {
        self.base_dir.join("audit.log")
    }

    /// Lock file held by whichever process runs a pipeline
    pub fn engine_lock(&self) -> PathBuf {
        self.base_dir.join("engine.lock")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<(), BackupError> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| BackupError::Io(format!("Failed to create base directory: {}", e)))?;

        std::fs::create_dir_all(self.backup_dir())
            .map_err(|e| BackupError::Io(format!("Failed to create backup directory: {}", e)))?;

        std::fs::create_dir_all(self.scratch_dir())
            .map_err(|e| BackupError::Io(format!("Failed to create scratch directory: {}", e)))?;

        Ok(())
    }
}

/// Resolve the default data directory path based on platform
#[cfg(not(windows))]
fn resolve_default_path() -> Result<PathBuf, BackupError> {
    let config_base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").map_err(|_| {
                BackupError::Configuration("HOME environment variable not set".into())
            })?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(config_base.join("pos-backup"))
}

/// Resolve the default data directory path based on platform
#[cfg(windows)]
fn resolve_default_path() -> Result<PathBuf, BackupError> {
    let appdata = std::env::var("APPDATA").map_err(|_| {
        BackupError::Configuration("Could not determine APPDATA directory".into())
    })?;
    Ok(PathBuf::from(appdata).join("pos-backup"))
}
