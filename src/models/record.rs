//! Backup record model
//!
//! One `BackupRecord` exists per backup attempt. Status transitions are
//! monotonic: `pending -> running -> completed | failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::ids::BackupId;
use crate::error::{BackupError, BackupResult};

/// What triggered a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Operator asked for it
    #[default]
    Manual,
    /// Fired by the scheduler
    Scheduled,
    /// Fired by a business event or a pre-restore safety backup
    Automatic,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Automatic => write!(f, "automatic"),
        }
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "automatic" => Ok(Self::Automatic),
            other => Err(BackupError::Configuration(format!(
                "Unknown backup type: {}",
                other
            ))),
        }
    }
}

/// Lifecycle status of a backup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    /// Completed and failed records never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending and running records belong to a live pipeline
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BackupError::Configuration(format!(
                "Unknown backup status: {}",
                other
            ))),
        }
    }
}

/// Values recorded when a pipeline finishes successfully
#[derive(Debug, Clone)]
pub struct CompletionDetails {
    /// Byte length of the encrypted artifact
    pub size: u64,
    /// Hex digest of the encrypted artifact
    pub checksum: String,
    /// Hex digest of the raw dump
    pub content_checksum: String,
    /// Byte length of the raw dump
    pub raw_size: u64,
}

/// One backup attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Stable external correlation identifier
    #[serde(rename = "backupId")]
    pub id: BackupId,

    /// Creation time, immutable
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub backup_type: BackupType,

    pub status: BackupStatus,

    /// Size of the encrypted artifact in bytes
    #[serde(default)]
    pub size: u64,

    /// Hex digest of the encrypted artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Hex digest of the raw dump bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_checksum: Option<String>,

    pub encrypted: bool,

    /// Wall-clock milliseconds of the full pipeline
    #[serde(default, rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Location of the encrypted artifact
    pub path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,

    /// Encrypted size divided by raw dump size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,

    /// Why an automatic backup was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BackupRecord {
    /// Create a new pending record for an artifact that will live at `path`
    pub fn new(id: BackupId, backup_type: BackupType, path: PathBuf) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            backup_type,
            status: BackupStatus::Pending,
            size: 0,
            checksum: None,
            content_checksum: None,
            encrypted: true,
            duration_ms: None,
            error: None,
            path,
            database_version: None,
            schema_version: None,
            record_count: None,
            compression_ratio: None,
            started_at: None,
            completed_at: None,
            restored_at: None,
            restored_by: None,
            created_by: None,
            branch_id: None,
            reason: None,
        }
    }

    /// Transition `pending -> running`
    pub fn start(&mut self) -> BackupResult<()> {
        if self.status != BackupStatus::Pending {
            return Err(self.illegal_transition(BackupStatus::Running));
        }
        self.status = BackupStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transition `running -> completed`
    pub fn complete(&mut self, details: CompletionDetails, duration_ms: u64) -> BackupResult<()> {
        if self.status != BackupStatus::Running {
            return Err(self.illegal_transition(BackupStatus::Completed));
        }
        if details.checksum.is_empty() || details.size == 0 {
            return Err(BackupError::InvalidState(format!(
                "Backup {} cannot complete without a checksum and a non-empty artifact",
                self.id
            )));
        }

        self.status = BackupStatus::Completed;
        self.size = details.size;
        self.compression_ratio = if details.raw_size > 0 {
            Some(details.size as f64 / details.raw_size as f64)
        } else {
            None
        };
        self.checksum = Some(details.checksum);
        self.content_checksum = Some(details.content_checksum);
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.error = None;
        Ok(())
    }

    /// Transition `pending | running -> failed`
    pub fn fail(&mut self, error: impl Into<String>, duration_ms: u64) -> BackupResult<()> {
        if self.status.is_terminal() {
            return Err(self.illegal_transition(BackupStatus::Failed));
        }

        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown failure".to_string();
        }

        self.status = BackupStatus::Failed;
        self.error = Some(error);
        self.checksum = None;
        self.content_checksum = None;
        self.size = 0;
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    /// Whether the record satisfies the terminal-state invariants
    ///
    /// `completed` requires a checksum, a non-zero size and the artifact on
    /// disk; `failed` requires an error message.
    pub fn satisfies_invariants(&self) -> bool {
        match self.status {
            BackupStatus::Completed => {
                self.checksum.as_deref().map_or(false, |c| !c.is_empty())
                    && self.size > 0
                    && self.path.exists()
            }
            BackupStatus::Failed => self.error.as_deref().map_or(false, |e| !e.is_empty()),
            BackupStatus::Pending | BackupStatus::Running => true,
        }
    }

    /// Whether this record can be used as a restore source
    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Completed
    }

    fn illegal_transition(&self, to: BackupStatus) -> BackupError {
        BackupError::InvalidState(format!(
            "Backup {} cannot move from {} to {}",
            self.id, self.status, to
        ))
    }
}

/// Aggregate counts and sizes over all records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub manual: usize,
    pub scheduled: usize,
    pub automatic: usize,
    /// Sum of completed artifact sizes
    pub total_size: u64,
    pub average_duration_ms: Option<u64>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_successful_at: Option<DateTime<Utc>>,
}

impl BackupStats {
    /// Fold a set of records into aggregate stats
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a BackupRecord>) -> Self {
        let mut stats = Self::default();
        let mut duration_total: u64 = 0;

        for record in records {
            stats.total += 1;
            match record.status {
                BackupStatus::Pending => stats.pending += 1,
                BackupStatus::Running => stats.running += 1,
                BackupStatus::Completed => {
                    stats.completed += 1;
                    stats.total_size += record.size;
                    duration_total += record.duration_ms.unwrap_or(0);
                    if stats.last_successful_at.map_or(true, |t| record.timestamp > t) {
                        stats.last_successful_at = Some(record.timestamp);
                    }
                }
                BackupStatus::Failed => stats.failed += 1,
            }
            match record.backup_type {
                BackupType::Manual => stats.manual += 1,
                BackupType::Scheduled => stats.scheduled += 1,
                BackupType::Automatic => stats.automatic += 1,
            }
            if stats.last_backup_at.map_or(true, |t| record.timestamp > t) {
                stats.last_backup_at = Some(record.timestamp);
            }
        }

        if stats.completed > 0 {
            stats.average_duration_ms = Some(duration_total / stats.completed as u64);
        }

        stats
    }
}
