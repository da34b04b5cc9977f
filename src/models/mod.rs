//! Core data models for the backup engine
//!
//! Backup records, their lifecycle statuses and aggregate statistics.

pub mod ids;
pub mod record;

pub use ids::BackupId;
pub use record::{BackupRecord, BackupStats, BackupStatus, BackupType, CompletionDetails};
