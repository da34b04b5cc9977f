//! Restore pipeline
//!
//! Verifies an artifact and, unless only verification was requested, takes
//! a safety backup of the current state before loading the artifact into the
//! target database.

use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::audit::{AuditAction, AuditEntry};
use crate::error::{BackupError, BackupResult};
use crate::models::{BackupId, BackupRecord, BackupType};

use super::orchestrator::{elapsed_ms, BackupOrchestrator, CreateOptions, SYSTEM_ACTOR};
use super::remove_if_exists;
use super::slot::SlotGuard;

/// Options for one restore call
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Database to load into; the configured database when unset
    pub target_database: Option<String>,
    /// Drop existing objects before recreating them
    pub drop_existing: bool,
    /// Check integrity only; the restore tool is never run
    pub verify_only: bool,
    pub requested_by: Option<String>,
    pub cancel: CancellationToken,
}

impl RestoreOptions {
    pub fn verify_only() -> Self {
        Self {
            verify_only: true,
            ..Self::default()
        }
    }

    fn actor(&self) -> &str {
        self.requested_by.as_deref().unwrap_or(SYSTEM_ACTOR)
    }
}

/// What a restore call did
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub backup_id: BackupId,
    /// Artifact digest and content digest both matched
    pub verified: bool,
    /// The restore tool ran and succeeded
    pub restored: bool,
    /// Safety backup taken before restoring
    pub safety_backup: Option<BackupRecord>,
    pub target_database: String,
    pub duration_ms: u64,
}

impl RestoreOutcome {
    pub fn summary(&self) -> String {
        if !self.restored {
            return format!("Backup {} verified: checksums match", self.backup_id);
        }
        let mut summary = format!(
            "Backup {} restored into '{}' in {} ms",
            self.backup_id, self.target_database, self.duration_ms
        );
        if let Some(safety) = &self.safety_backup {
            summary.push_str(&format!(" (safety backup {})", safety.id));
        }
        summary
    }
}

impl BackupOrchestrator {
    /// Verify or restore a completed backup
    pub async fn restore(
        &self,
        id: BackupId,
        target_database: Option<String>,
        drop_existing: bool,
        verify_only: bool,
    ) -> BackupResult<RestoreOutcome> {
        self.restore_with(
            id,
            RestoreOptions {
                target_database,
                drop_existing,
                verify_only,
                ..RestoreOptions::default()
            },
        )
        .await
    }

    /// Verify or restore with full options
    #[instrument(skip(self, options), fields(backup_id = %id, verify_only = options.verify_only))]
    pub async fn restore_with(&self, id: BackupId, options: RestoreOptions) -> BackupResult<RestoreOutcome> {
        let result = self.guarded_restore(id, &options).await;

        let action = if options.verify_only {
            AuditAction::Verify
        } else {
            AuditAction::Restore
        };
        let entry = match &result {
            Ok(outcome) => AuditEntry::success(action, options.actor(), Some(id)).with_details(
                serde_json::json!({
                    "targetDatabase": outcome.target_database,
                    "dropExisting": options.drop_existing,
                    "safetyBackup": outcome.safety_backup.as_ref().map(|r| r.id.full()),
                }),
            ),
            Err(e) => AuditEntry::failure(action, options.actor(), Some(id), e),
        };
        self.audit_entry(entry);

        result
    }

    async fn guarded_restore(&self, id: BackupId, options: &RestoreOptions) -> BackupResult<RestoreOutcome> {
        // Lookups first so an unknown or unusable id touches nothing
        let record = self.get(id).await?;
        if !record.is_restorable() {
            return Err(BackupError::InvalidState(format!(
                "Backup {} is {}; only completed backups can be restored",
                id, record.status
            )));
        }

        let guard = self.slot.try_acquire(format!("restore of {}", id))?;
        // a delete may have finished between the lookup and the slot
        let record = self.get(id).await?;
        self.run_restore(record, options, &guard).await
    }

    async fn run_restore(
        &self,
        record: BackupRecord,
        options: &RestoreOptions,
        guard: &SlotGuard,
    ) -> BackupResult<RestoreOutcome> {
        let started = Instant::now();
        self.ensure_dirs().await?;

        let target_database = options
            .target_database
            .clone()
            .unwrap_or_else(|| self.config.connection.database.clone());

        self.verify_artifact(&record, &options.cancel, started).await?;
        info!(backup_id = %record.id, "Artifact verified");

        if options.verify_only {
            return Ok(RestoreOutcome {
                backup_id: record.id,
                verified: true,
                restored: false,
                safety_backup: None,
                target_database,
                duration_ms: elapsed_ms(started),
            });
        }

        let safety_options = CreateOptions::new(BackupType::Automatic)
            .with_reason(Some(format!("pre-restore safety backup for {}", record.id.full())))
            .created_by(options.actor())
            .with_cancel(options.cancel.clone());
        let safety = self.run_backup_pipeline(&safety_options, guard).await?;
        info!(backup_id = %record.id, safety_id = %safety.id, "Safety backup taken");

        let staged = self.scratch_path(record.id, "restore");
        let applied = async {
            self.checkpoint(&options.cancel, started)?;
            self.codec.decrypt_to(&record.path, &staged).await?;

            let limits = self.limits(&options.cancel, started)?;
            let target = self.config.connection.with_database(target_database.clone());
            self.tool
                .restore(&staged, &target, options.drop_existing, &limits)
                .await
                .map_err(|e| self.normalize_timeout(e))
        }
        .await;
        remove_if_exists(&staged).await;
        applied?;

        self.mark_restored(record.id, options.actor()).await;

        info!(backup_id = %record.id, target = %target_database, "Restore completed");
        Ok(RestoreOutcome {
            backup_id: record.id,
            verified: true,
            restored: true,
            safety_backup: Some(safety),
            target_database,
            duration_ms: elapsed_ms(started),
        })
    }

    /// Stamp the current copy of the source record; a record that vanished
    /// meanwhile is not written back
    async fn mark_restored(&self, id: BackupId, actor: &str) {
        let current = match self.store.find(id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(backup_id = %id, "Source record disappeared during restore");
                return;
            }
            Err(e) => {
                warn!(backup_id = %id, error = %e, "Restore succeeded but record lookup failed");
                return;
            }
        };

        let mut restored = current;
        restored.restored_at = Some(Utc::now());
        restored.restored_by = Some(actor.to_string());
        if let Err(e) = self.store.upsert(&restored).await {
            warn!(backup_id = %id, error = %e, "Restore succeeded but record update failed");
        }
    }

    /// Check the stored artifact digest, then decrypt to scratch and check
    /// the content digest
    async fn verify_artifact(
        &self,
        record: &BackupRecord,
        cancel: &CancellationToken,
        started: Instant,
    ) -> BackupResult<()> {
        let expected = record.checksum.as_deref().ok_or_else(|| {
            BackupError::InvalidState(format!("Backup {} has no recorded checksum", record.id))
        })?;
        if !record.path.exists() {
            return Err(BackupError::Io(format!(
                "Artifact for backup {} is missing: {}",
                record.id,
                record.path.display()
            )));
        }

        self.checkpoint(cancel, started)?;
        self.verifier.require(&record.path, expected).await?;

        let Some(content_checksum) = record.content_checksum.as_deref() else {
            return Ok(());
        };

        self.checkpoint(cancel, started)?;
        let staged = self.scratch_path(record.id, "verify");
        let checked = async {
            self.codec.decrypt_to(&record.path, &staged).await?;
            self.verifier.require(&staged, content_checksum).await
        }
        .await;
        remove_if_exists(&staged).await;
        checked.map(|_| ())
    }
}
