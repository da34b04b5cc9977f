//! pos-backup - Backup and restore engine for the point-of-sale data store
//!
//! Dumps the relational store with external tools, encrypts and checksums
//! the result, tracks every attempt as a `BackupRecord`, and restores
//! verified artifacts on request.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Paths, settings and connection descriptors
//! - `error`: Custom error types
//! - `models`: Backup records, ids and statistics
//! - `storage`: Metadata store over an atomically written JSON file
//! - `crypto`: Key derivation and the artifact codec
//! - `integrity`: SHA-256 digests of artifacts
//! - `process`: Supervised dump and restore tool invocations
//! - `audit`: JSONL audit trail
//! - `backup`: Orchestration of create, restore, delete and retention
//! - `scheduler`: Periodic scheduled backups
//! - `cli` / `display`: Command-line surface
//!
//! # Example
//!
//! ```rust,ignore
//! use pos_backup::backup::BackupOrchestrator;
//! use pos_backup::config::{EnginePaths, Settings};
//! use pos_backup::crypto::EncryptionKey;
//! use pos_backup::models::BackupType;
//!
//! let paths = EnginePaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let params = settings.encryption.key_params.clone().unwrap_or_default();
//! let key = EncryptionKey::from_env(&params)?;
//! let orchestrator = BackupOrchestrator::open(&paths, &settings, key).await?;
//! let record = orchestrator.create(BackupType::Manual, None).await?;
//! ```

pub mod audit;
pub mod backup;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod display;
pub mod error;
pub mod integrity;
pub mod logging;
pub mod models;
pub mod process;
pub mod scheduler;
pub mod storage;

pub use backup::{BackupOrchestrator, RestoreOptions, RestoreOutcome};
pub use error::{BackupError, BackupResult};
pub use models::{BackupId, BackupRecord, BackupStats, BackupStatus, BackupType};
