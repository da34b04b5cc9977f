//! Storage layer for backup metadata
//!
//! Provides JSON file storage with atomic writes, advisory file locks and
//! the metadata store port used by the orchestrator.

pub mod file_io;
pub mod metadata;

pub use file_io::{read_json, read_lock_note, update_json, write_json_atomic, FileLock};
pub use metadata::{JsonMetadataStore, MetadataStore, RecordFilter};
