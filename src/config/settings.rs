//! Engine settings
//!
//! Manages the target store connection descriptor, external tool locations,
//! retention window, size and duration limits, the schedule interval and the
//! persisted key-derivation parameters.
//!
//! Secrets are never stored in the settings file. The database password and
//! the encryption secret come from the environment only.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::paths::EnginePaths;
use crate::crypto::key_derivation::{validate_salt, KeyDerivationParams, KEY_SALT_ENV};
use crate::crypto::secure_memory::SecureString;
use crate::error::BackupError;

pub const DB_HOST_ENV: &str = "POS_BACKUP_DB_HOST";
pub const DB_PORT_ENV: &str = "POS_BACKUP_DB_PORT";
pub const DB_USER_ENV: &str = "POS_BACKUP_DB_USER";
pub const DB_NAME_ENV: &str = "POS_BACKUP_DB_NAME";
pub const DB_PASSWORD_ENV: &str = "POS_BACKUP_DB_PASSWORD";

/// Connection descriptor for the target relational store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    /// Database name; must be set before the engine starts
    #[serde(default)]
    pub database: String,

    /// Injected from the environment, never serialized
    #[serde(skip)]
    pub password: Option<SecureString>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_username() -> String {
    "postgres".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            database: String::new(),
            password: None,
        }
    }
}

impl ConnectionConfig {
    /// Same server and credentials, different database
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }

    /// Reject descriptors that cannot address a store
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.host.trim().is_empty() {
            return Err(BackupError::Configuration("Database host is empty".into()));
        }
        if self.database.trim().is_empty() {
            return Err(BackupError::Configuration(format!(
                "Database name is not configured (set it in config.json or {})",
                DB_NAME_ENV
            )));
        }
        if self.username.trim().is_empty() {
            return Err(BackupError::Configuration("Database user is empty".into()));
        }
        Ok(())
    }
}

/// External dump/restore tool locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_dump_program")]
    pub dump_program: String,

    #[serde(default = "default_restore_program")]
    pub restore_program: String,
}

fn default_dump_program() -> String {
    "pg_dump".to_string()
}

fn default_restore_program() -> String {
    "pg_restore".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            dump_program: default_dump_program(),
            restore_program: default_restore_program(),
        }
    }
}

/// Encryption settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionSettings {
    /// Key derivation parameters (salt, memory cost, etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_params: Option<KeyDerivationParams>,
}

/// Engine settings persisted in config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub tools: ToolSettings,

    /// Completed backups older than this many days are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Dumps larger than this are aborted
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Interval between scheduled backups
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,

    /// Maximum wall-clock duration of one pipeline run (0 = unlimited)
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: u64,

    #[serde(default)]
    pub encryption: EncryptionSettings,
}

fn default_schema_version() -> u32 {
    1
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_artifact_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_schedule_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_run_secs() -> u64 {
    60 * 60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            connection: ConnectionConfig::default(),
            tools: ToolSettings::default(),
            retention_days: default_retention_days(),
            max_artifact_bytes: default_max_artifact_bytes(),
            schedule_interval_secs: default_schedule_interval_secs(),
            max_run_secs: default_max_run_secs(),
            encryption: EncryptionSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from disk, or create default settings if file doesn't exist
    pub fn load_or_create(paths: &EnginePaths) -> Result<Self, BackupError> {
        let settings_path = paths.settings_file();

        if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path).map_err(|e| {
                BackupError::Io(format!("Failed to read settings file: {}", e))
            })?;

            let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
                BackupError::Configuration(format!("Failed to parse settings file: {}", e))
            })?;

            Ok(settings)
        } else {
            // Don't save yet - let caller decide when to persist
            Ok(Settings::default())
        }
    }

    /// Save settings to disk
    pub fn save(&self, paths: &EnginePaths) -> Result<(), BackupError> {
        paths.ensure_directories()?;

        let contents = serde_json::to_string_pretty(self).map_err(|e| {
            BackupError::Configuration(format!("Failed to serialize settings: {}", e))
        })?;

        std::fs::write(paths.settings_file(), contents)
            .map_err(|e| BackupError::Io(format!("Failed to write settings file: {}", e)))?;

        Ok(())
    }

    /// Overlay connection fields, the database password and the key salt
    /// from the environment
    ///
    /// Overrides apply in memory only and are never saved.
    pub fn apply_env(&mut self) -> Result<(), BackupError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::apply_env`] with an injectable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), BackupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(DB_HOST_ENV) {
            self.connection.host = host;
        }
        if let Some(port) = lookup(DB_PORT_ENV) {
            self.connection.port = port.trim().parse().map_err(|_| {
                BackupError::Configuration(format!("Invalid {}: {}", DB_PORT_ENV, port))
            })?;
        }
        if let Some(user) = lookup(DB_USER_ENV) {
            self.connection.username = user;
        }
        if let Some(name) = lookup(DB_NAME_ENV) {
            self.connection.database = name;
        }
        if let Some(password) = lookup(DB_PASSWORD_ENV) {
            self.connection.password = Some(SecureString::new(password));
        }
        if let Some(salt) = lookup(KEY_SALT_ENV) {
            let salt = salt.trim().to_string();
            validate_salt(&salt)?;
            self.encryption
                .key_params
                .get_or_insert_with(KeyDerivationParams::default)
                .salt = salt;
        }
        Ok(())
    }

    /// Generate key-derivation parameters on first use
    ///
    /// Returns true when new parameters were created and the settings need
    /// to be saved. Existing parameters are never replaced, since artifacts
    /// written under them could no longer be decrypted.
    pub fn ensure_key_params(&mut self) -> bool {
        if self.encryption.key_params.is_some() {
            return false;
        }
        self.encryption.key_params = Some(KeyDerivationParams::new());
        true
    }

    /// Maximum run duration, if limited
    pub fn max_run_duration(&self) -> Option<Duration> {
        (self.max_run_secs > 0).then(|| Duration::from_secs(self.max_run_secs))
    }

    /// Interval between scheduled backups
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs.max(1))
    }
}
