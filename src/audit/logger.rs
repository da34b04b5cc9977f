//! Audit logger for the append-only audit log
//!
//! Each entry is written as a single JSON line and flushed immediately.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use crate::crypto::{redact, SecureString};
use crate::error::{BackupError, BackupResult};

use super::entry::AuditEntry;

/// Destination for audit entries
///
/// Callers treat audit as fire-and-forget: an error here is logged and
/// never fails the audited operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> BackupResult<()>;
}

/// Writes audit entries to a JSONL file
pub struct AuditLogger {
    log_path: PathBuf,
    /// Scrubbed from every line before it is written
    secret: Option<SecureString>,
}

impl AuditLogger {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            secret: None,
        }
    }

    /// Redact `secret` from all written entries
    pub fn with_secret(mut self, secret: Option<SecureString>) -> Self {
        self.secret = secret;
        self
    }

    /// Append an entry and flush
    pub fn log(&self, entry: &AuditEntry) -> BackupResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| BackupError::Io(format!("Failed to open audit log: {}", e)))?;

        let json = serde_json::to_string(entry)
            .map_err(|e| BackupError::Json(format!("Failed to serialize audit entry: {}", e)))?;
        let json = redact(&json, self.secret.as_ref());

        writeln!(file, "{}", json)
            .map_err(|e| BackupError::Io(format!("Failed to write audit entry: {}", e)))?;

        file.flush()
            .map_err(|e| BackupError::Io(format!("Failed to flush audit log: {}", e)))?;

        Ok(())
    }

    /// Read all audit entries, oldest first
    pub fn read_all(&self) -> BackupResult<Vec<AuditEntry>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .map_err(|e| BackupError::Io(format!("Failed to open audit log: {}", e)))?;

        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                BackupError::Io(format!("Failed to read audit log line {}: {}", line_num + 1, e))
            })?;

            if line.trim().is_empty() {
                continue;
            }

            let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
                BackupError::Json(format!(
                    "Failed to parse audit entry at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;

            entries.push(entry);
        }

        Ok(entries)
    }

    /// Read the most recent N entries from the log
    pub fn read_recent(&self, count: usize) -> BackupResult<Vec<AuditEntry>> {
        let all_entries = self.read_all()?;
        let start = all_entries.len().saturating_sub(count);
        Ok(all_entries[start..].to_vec())
    }

    /// Number of entries in the audit log
    pub fn entry_count(&self) -> BackupResult<usize> {
        if !self.log_path.exists() {
            return Ok(0);
        }

        let file = File::open(&self.log_path)
            .map_err(|e| BackupError::Io(format!("Failed to open audit log: {}", e)))?;

        let reader = BufReader::new(file);
        let count = reader
            .lines()
            .filter_map(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .count();

        Ok(count)
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl AuditSink for AuditLogger {
    fn record(&self, entry: &AuditEntry) -> BackupResult<()> {
        self.log(entry)
    }
}
