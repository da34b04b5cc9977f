//! Backup orchestrator
//!
//! Drives the create pipeline (dump, checksum, encrypt, verify, record) under
//! the global execution slot and owns every write to the metadata store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLogger, AuditSink};
use crate::config::{ConnectionConfig, EnginePaths, Settings};
use crate::crypto::{ArtifactCodec, EncryptionKey};
use crate::error::{BackupError, BackupResult};
use crate::integrity::IntegrityVerifier;
use crate::models::{BackupId, BackupRecord, BackupStats, BackupStatus, BackupType, CompletionDetails};
use crate::process::{DatabaseTool, ProcessRunner, RunLimits};
use crate::storage::{JsonMetadataStore, MetadataStore, RecordFilter};

use super::retention;
use super::slot::{ExecutionSlot, SlotGuard};
use super::remove_if_exists;

/// Actor recorded when no user is attached to an operation
pub const SYSTEM_ACTOR: &str = "system";

/// Static inputs of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub connection: ConnectionConfig,
    /// Where encrypted artifacts live
    pub backup_dir: PathBuf,
    /// Where decrypted copies are staged during verify and restore
    pub scratch_dir: PathBuf,
    /// Maximum wall-clock duration of one pipeline
    pub max_run: Option<Duration>,
    /// Lock file shared with other processes on the same base directory;
    /// `None` keeps the execution slot process-local
    pub engine_lock: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn from_settings(paths: &EnginePaths, settings: &Settings) -> Self {
        Self {
            connection: settings.connection.clone(),
            backup_dir: paths.backup_dir(),
            scratch_dir: paths.scratch_dir(),
            max_run: settings.max_run_duration(),
            engine_lock: Some(paths.engine_lock()),
        }
    }
}

/// Options for one create call
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub trigger: BackupType,
    pub reason: Option<String>,
    pub created_by: Option<String>,
    pub branch_id: Option<String>,
    pub cancel: CancellationToken,
}

impl CreateOptions {
    pub fn new(trigger: BackupType) -> Self {
        Self {
            trigger,
            reason: None,
            created_by: None,
            branch_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    pub fn branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn actor(&self) -> &str {
        self.created_by.as_deref().unwrap_or(SYSTEM_ACTOR)
    }
}

/// Coordinates backup creation, restore and record management
pub struct BackupOrchestrator {
    pub(super) config: OrchestratorConfig,
    pub(super) store: Arc<dyn MetadataStore>,
    pub(super) tool: Arc<dyn DatabaseTool>,
    pub(super) codec: ArtifactCodec,
    pub(super) verifier: IntegrityVerifier,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) slot: ExecutionSlot,
}

impl BackupOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn MetadataStore>,
        tool: Arc<dyn DatabaseTool>,
        codec: ArtifactCodec,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let slot = match &config.engine_lock {
            Some(path) => ExecutionSlot::with_lock_file(path.clone()),
            None => ExecutionSlot::new(),
        };
        Self {
            config,
            store,
            tool,
            codec,
            verifier: IntegrityVerifier::new(),
            audit,
            slot,
        }
    }

    /// Build an orchestrator over the on-disk store, the real dump tools and
    /// the file audit log
    ///
    /// Records left `pending` or `running` by an earlier process are marked
    /// failed, unless another process currently holds the engine lock.
    pub async fn open(
        paths: &EnginePaths,
        settings: &Settings,
        key: EncryptionKey,
    ) -> BackupResult<Self> {
        settings.connection.validate()?;
        paths.ensure_directories()?;

        let store = JsonMetadataStore::open(paths.metadata_file())?;
        let tool = ProcessRunner::new(settings.tools.clone(), settings.max_artifact_bytes);
        let audit = AuditLogger::new(paths.audit_log())
            .with_secret(settings.connection.password.clone());

        let orchestrator = Self::new(
            OrchestratorConfig::from_settings(paths, settings),
            Arc::new(store),
            Arc::new(tool),
            ArtifactCodec::new(key),
            Arc::new(audit),
        );
        orchestrator.recover_interrupted().await?;
        Ok(orchestrator)
    }

    /// Whether a pipeline in this or another process holds the slot
    pub fn is_busy(&self) -> bool {
        self.slot.is_held()
    }

    /// Create a backup
    pub async fn create(&self, trigger: BackupType, reason: Option<String>) -> BackupResult<BackupRecord> {
        self.create_with(CreateOptions::new(trigger).with_reason(reason))
            .await
    }

    /// Create a backup with full options
    #[instrument(skip(self, options), fields(trigger = %options.trigger))]
    pub async fn create_with(&self, options: CreateOptions) -> BackupResult<BackupRecord> {
        let result = match self.slot.try_acquire(format!("{} backup", options.trigger)) {
            Ok(guard) => self.run_backup_pipeline(&options, &guard).await,
            Err(e) => Err(e),
        };

        let entry = match &result {
            Ok(record) => AuditEntry::success(AuditAction::Create, options.actor(), Some(record.id))
                .with_details(serde_json::json!({
                    "type": record.backup_type,
                    "size": record.size,
                    "durationMs": record.duration_ms,
                })),
            Err(e) => AuditEntry::failure(AuditAction::Create, options.actor(), None, e)
                .with_details(serde_json::json!({ "type": options.trigger })),
        };
        self.audit_entry(entry);

        result
    }

    /// The create pipeline proper; the caller must hold the slot
    ///
    /// Restore reuses this for its safety backup under its own guard.
    pub(super) async fn run_backup_pipeline(
        &self,
        options: &CreateOptions,
        _guard: &SlotGuard,
    ) -> BackupResult<BackupRecord> {
        let started = Instant::now();
        self.ensure_dirs().await?;

        let id = BackupId::new();
        let now = Utc::now();
        let artifact = self.config.backup_dir.join(artifact_file_name(id, now));

        let mut record = BackupRecord::new(id, options.trigger, artifact);
        record.timestamp = now;
        record.reason = options.reason.clone();
        record.created_by = options.created_by.clone();
        record.branch_id = options.branch_id.clone();
        self.store.upsert(&record).await?;

        match self.execute_backup(&mut record, options, started).await {
            Ok(()) => {
                info!(
                    backup_id = %record.id,
                    size = record.size,
                    duration_ms = record.duration_ms,
                    "Backup completed"
                );
                Ok(record)
            }
            Err(e) => {
                remove_if_exists(&raw_dump_path(&record.path)).await;
                remove_if_exists(&record.path).await;

                let elapsed = elapsed_ms(started);
                if let Err(state_err) = record.fail(e.to_string(), elapsed) {
                    warn!(backup_id = %record.id, error = %state_err, "Could not mark backup failed");
                } else if let Err(store_err) = self.store.upsert(&record).await {
                    warn!(backup_id = %record.id, error = %store_err, "Failed to persist failed backup record");
                }

                error!(backup_id = %record.id, kind = e.kind(), error = %e, "Backup failed");
                Err(e)
            }
        }
    }

    async fn execute_backup(
        &self,
        record: &mut BackupRecord,
        options: &CreateOptions,
        started: Instant,
    ) -> BackupResult<()> {
        record.start()?;
        self.store.upsert(record).await?;
        info!(backup_id = %record.id, trigger = %record.backup_type, "Backup started");

        let raw = raw_dump_path(&record.path);
        let limits = self.limits(&options.cancel, started)?;
        let raw_size = self
            .tool
            .dump(&self.config.connection, &raw, &limits)
            .await
            .map_err(|e| self.normalize_timeout(e))?;

        self.checkpoint(&options.cancel, started)?;
        let content_checksum = self.verifier.checksum(&raw).await?;

        self.checkpoint(&options.cancel, started)?;
        let artifact = self.codec.encrypt(&raw).await?;
        remove_if_exists(&raw).await;
        if artifact != record.path {
            return Err(BackupError::Encryption(format!(
                "Artifact written to unexpected path {}",
                artifact.display()
            )));
        }

        self.checkpoint(&options.cancel, started)?;
        let checksum = self.verifier.checksum(&artifact).await?;
        self.verifier.require(&artifact, &checksum).await?;

        let size = tokio::fs::metadata(&artifact).await?.len();

        let limits = self.limits(&options.cancel, started)?;
        let database_version = self.tool.version(&limits).await;
        self.checkpoint(&options.cancel, started)?;

        let mut completed = record.clone();
        completed.database_version = database_version;
        completed.complete(
            CompletionDetails {
                size,
                checksum,
                content_checksum,
                raw_size,
            },
            elapsed_ms(started),
        )?;
        self.store.upsert(&completed).await?;

        *record = completed;
        Ok(())
    }

    /// Records matching `filter`, newest first
    pub async fn list(&self, filter: &RecordFilter) -> BackupResult<Vec<BackupRecord>> {
        self.store.list(filter).await
    }

    /// Fetch one record or fail with `NotFound`
    pub async fn get(&self, id: BackupId) -> BackupResult<BackupRecord> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| BackupError::backup_not_found(id.full()))
    }

    /// Turn user input into a backup id
    ///
    /// Accepts `latest` (newest completed backup), a full id with or without
    /// the `bkp-` prefix, or a unique id prefix.
    pub async fn resolve(&self, selector: &str) -> BackupResult<BackupId> {
        let selector = selector.trim();

        if selector.eq_ignore_ascii_case("latest") {
            let latest = self
                .store
                .list(&RecordFilter::all().with_status(BackupStatus::Completed).limit(1))
                .await?;
            return latest
                .first()
                .map(|r| r.id)
                .ok_or_else(|| BackupError::backup_not_found("latest"));
        }

        if let Ok(id) = BackupId::parse(selector) {
            return Ok(id);
        }

        let prefix = selector
            .strip_prefix("bkp-")
            .unwrap_or(selector)
            .to_ascii_lowercase();
        if prefix.is_empty() {
            return Err(BackupError::backup_not_found(selector));
        }

        let matches: Vec<BackupId> = self
            .store
            .list(&RecordFilter::all())
            .await?
            .into_iter()
            .filter(|r| r.id.full().starts_with(&prefix))
            .map(|r| r.id)
            .collect();

        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(BackupError::backup_not_found(selector)),
            _ => Err(BackupError::InvalidState(format!(
                "'{}' matches {} backups; use a longer prefix",
                selector,
                matches.len()
            ))),
        }
    }

    pub async fn stats(&self) -> BackupResult<BackupStats> {
        self.store.aggregate_stats().await
    }

    /// Delete a backup's artifact and record
    pub async fn delete(&self, id: BackupId) -> BackupResult<BackupRecord> {
        self.delete_as(id, SYSTEM_ACTOR).await
    }

    /// Delete on behalf of `actor`
    ///
    /// Takes the execution slot, so nothing can be deleted while a backup,
    /// restore or verify is running. Records of pipelines still in flight
    /// cannot be deleted either.
    pub async fn delete_as(&self, id: BackupId, actor: &str) -> BackupResult<BackupRecord> {
        match self.slot.try_acquire(format!("delete of {}", id)) {
            Ok(guard) => self.delete_held(id, actor, &guard).await,
            Err(e) => {
                self.audit_entry(AuditEntry::failure(AuditAction::Delete, actor, Some(id), &e));
                Err(e)
            }
        }
    }

    /// Delete while the caller holds the slot
    pub(super) async fn delete_held(
        &self,
        id: BackupId,
        actor: &str,
        _guard: &SlotGuard,
    ) -> BackupResult<BackupRecord> {
        let result = self.delete_record(id).await;

        let entry = match &result {
            Ok(record) => AuditEntry::success(AuditAction::Delete, actor, Some(id))
                .with_details(serde_json::json!({ "status": record.status, "size": record.size })),
            Err(e) => AuditEntry::failure(AuditAction::Delete, actor, Some(id), e),
        };
        self.audit_entry(entry);

        result
    }

    async fn delete_record(&self, id: BackupId) -> BackupResult<BackupRecord> {
        let record = self.get(id).await?;
        if record.status.is_active() {
            return Err(BackupError::InvalidState(format!(
                "Backup {} is {} and cannot be deleted",
                id, record.status
            )));
        }

        match tokio::fs::remove_file(&record.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backup_id = %id, path = %record.path.display(), "Artifact already missing");
            }
            Err(e) => {
                return Err(BackupError::Io(format!(
                    "Failed to delete artifact {}: {}",
                    record.path.display(),
                    e
                )))
            }
        }

        self.store.delete(id).await?;
        info!(backup_id = %id, "Backup deleted");
        Ok(record)
    }

    /// Delete completed backups older than `days`; returns how many went
    pub async fn prune_older_than(&self, days: u32) -> BackupResult<usize> {
        retention::prune(self, days, Utc::now()).await
    }

    /// Fail records a previous process left in flight
    ///
    /// Every live pipeline holds the slot, so records are only touched when
    /// the slot is free; otherwise nothing is recovered.
    pub async fn recover_interrupted(&self) -> BackupResult<usize> {
        let _guard = match self.slot.try_acquire("startup recovery") {
            Ok(guard) => guard,
            Err(e) if e.is_concurrency() => {
                info!(error = %e, "Engine busy, skipping recovery of interrupted backups");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut recovered = 0;
        for mut record in self.store.list(&RecordFilter::all()).await? {
            if !record.status.is_active() {
                continue;
            }
            remove_if_exists(&raw_dump_path(&record.path)).await;
            remove_if_exists(&record.path).await;
            record.fail("interrupted before completion", record.duration_ms.unwrap_or(0))?;
            self.store.upsert(&record).await?;
            warn!(backup_id = %record.id, "Marked interrupted backup as failed");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub(super) fn audit_entry(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(&entry) {
            warn!(action = %entry.action, error = %e, "Failed to write audit entry");
        }
    }

    pub(super) async fn ensure_dirs(&self) -> BackupResult<()> {
        for dir in [&self.config.backup_dir, &self.config.scratch_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                BackupError::Io(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Fail with `Cancelled` or `Timeout` between pipeline steps
    pub(super) fn checkpoint(&self, cancel: &CancellationToken, started: Instant) -> BackupResult<()> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        if let Some(max_run) = self.config.max_run {
            if started.elapsed() >= max_run {
                return Err(BackupError::Timeout {
                    seconds: max_run.as_secs(),
                });
            }
        }
        Ok(())
    }

    /// Limits for a tool invocation given the time already spent
    pub(super) fn limits(&self, cancel: &CancellationToken, started: Instant) -> BackupResult<RunLimits> {
        self.checkpoint(cancel, started)?;
        let remaining = self
            .config
            .max_run
            .map(|max_run| max_run.saturating_sub(started.elapsed()));
        Ok(RunLimits::new(cancel.clone(), remaining))
    }

    /// Report tool timeouts against the whole run budget
    pub(super) fn normalize_timeout(&self, error: BackupError) -> BackupError {
        match (error, self.config.max_run) {
            (BackupError::Timeout { .. }, Some(max_run)) => BackupError::Timeout {
                seconds: max_run.as_secs(),
            },
            (other, _) => other,
        }
    }

    pub(super) fn scratch_path(&self, id: BackupId, purpose: &str) -> PathBuf {
        self.config
            .scratch_dir
            .join(format!("{}-{}.dump", id.full(), purpose))
    }
}

/// `backup-YYYYMMDD-HHMMSS-mmm-<uuid>.dump.enc`
pub fn artifact_file_name(id: BackupId, at: DateTime<Utc>) -> String {
    format!(
        "backup-{}-{:03}-{}.dump.enc",
        at.format("%Y%m%d-%H%M%S"),
        at.timestamp_subsec_millis(),
        id.full()
    )
}

/// The raw dump sits next to its artifact without the `.enc` suffix
fn raw_dump_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("")
}

pub(super) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
