//! Backup and restore engine
//!
//! # Architecture
//!
//! - `BackupOrchestrator`: the lifecycle state machine; creates, restores,
//!   lists and deletes backups and is the only writer of backup records
//! - `ExecutionSlot`: the single global slot serializing create and restore
//! - `RetentionManager`: prunes completed backups past the retention window
//!
//! # Artifact format
//!
//! Each backup is one file in the backup directory named
//! `backup-YYYYMMDD-HHMMSS-mmm-<uuid>.dump.enc`, holding a 16-byte nonce
//! followed by the AES-256-CBC ciphertext of the raw database dump.
//!
//! # Example
//!
//! ```rust,ignore
//! use pos_backup::backup::BackupOrchestrator;
//! use pos_backup::models::BackupType;
//!
//! let orchestrator = BackupOrchestrator::open(&paths, &settings, key).await?;
//! let record = orchestrator.create(BackupType::Manual, None).await?;
//! orchestrator.restore(record.id, None, false, true).await?;
//! ```

mod orchestrator;
mod restore;
mod retention;
mod slot;

pub use orchestrator::{
    artifact_file_name, BackupOrchestrator, CreateOptions, OrchestratorConfig, SYSTEM_ACTOR,
};
pub use restore::{RestoreOptions, RestoreOutcome};
pub use retention::{select_expired, RetentionManager};
pub use slot::{ExecutionSlot, SlotGuard};

use std::path::Path;

use tracing::warn;

/// Remove a file, treating "already gone" as success
pub(crate) async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::{BackupOrchestrator, OrchestratorConfig};
    use crate::audit::AuditLogger;
    use crate::config::{ConnectionConfig, EnginePaths};
    use crate::crypto::test_support::test_key;
    use crate::crypto::ArtifactCodec;
    use crate::error::{BackupError, BackupResult};
    use crate::process::{DatabaseTool, RunLimits};
    use crate::storage::JsonMetadataStore;

    #[derive(Debug, Clone)]
    pub struct RestoreCall {
        pub database: String,
        pub drop_existing: bool,
        pub content: Vec<u8>,
    }

    /// Scripted stand-in for the dump/restore tools
    pub struct FakeTool {
        pub payload: Vec<u8>,
        pub dumps: AtomicUsize,
        pub restores: AtomicUsize,
        fail_dump: bool,
        fail_restore: bool,
        gate: Option<Arc<Notify>>,
        restore_gate: Option<Arc<Notify>>,
        events: Mutex<Vec<&'static str>>,
        restore_calls: Mutex<Vec<RestoreCall>>,
    }

    impl FakeTool {
        pub fn new() -> Self {
            Self {
                payload: (0..4096).map(|i| (i % 251) as u8).collect(),
                dumps: AtomicUsize::new(0),
                restores: AtomicUsize::new(0),
                fail_dump: false,
                fail_restore: false,
                gate: None,
                restore_gate: None,
                events: Mutex::new(Vec::new()),
                restore_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail_dump: true,
                ..Self::new()
            }
        }

        pub fn failing_restore() -> Self {
            Self {
                fail_restore: true,
                ..Self::new()
            }
        }

        /// Dumps block until the returned notify fires
        pub fn gated() -> (Self, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let tool = Self {
                gate: Some(Arc::clone(&gate)),
                ..Self::new()
            };
            (tool, gate)
        }

        /// Restores block until the returned notify fires
        pub fn gated_restore() -> (Self, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let tool = Self {
                restore_gate: Some(Arc::clone(&gate)),
                ..Self::new()
            };
            (tool, gate)
        }

        pub fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        pub fn last_restore(&self) -> Option<RestoreCall> {
            self.restore_calls.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl DatabaseTool for FakeTool {
        async fn dump(
            &self,
            _connection: &ConnectionConfig,
            output: &Path,
            limits: &RunLimits,
        ) -> BackupResult<u64> {
            self.dumps.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("dump");

            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = limits.cancel.cancelled() => return Err(BackupError::Cancelled),
                }
            }
            if self.fail_dump {
                tokio::fs::write(output, b"partial").await?;
                return Err(BackupError::DumpFailure {
                    status: Some(1),
                    stderr: "connection refused".into(),
                });
            }

            tokio::fs::write(output, &self.payload).await?;
            Ok(self.payload.len() as u64)
        }

        async fn restore(
            &self,
            input: &Path,
            connection: &ConnectionConfig,
            drop_existing: bool,
            limits: &RunLimits,
        ) -> BackupResult<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push("restore");

            if let Some(gate) = &self.restore_gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = limits.cancel.cancelled() => return Err(BackupError::Cancelled),
                }
            }
            if self.fail_restore {
                return Err(BackupError::RestoreFailure {
                    status: Some(1),
                    stderr: "relation already exists".into(),
                });
            }

            let content = tokio::fs::read(input).await?;
            self.restore_calls.lock().unwrap().push(RestoreCall {
                database: connection.database.clone(),
                drop_existing,
                content,
            });
            Ok(())
        }

        async fn version(&self, _limits: &RunLimits) -> Option<String> {
            Some("fake-dump 1.0".to_string())
        }
    }

    pub struct Harness {
        pub orchestrator: Arc<BackupOrchestrator>,
        pub tool: Arc<FakeTool>,
        pub store: Arc<JsonMetadataStore>,
        pub audit: Arc<AuditLogger>,
        pub paths: EnginePaths,
        pub temp: TempDir,
    }

    pub fn harness() -> Harness {
        harness_with(FakeTool::new())
    }

    pub fn harness_with(tool: FakeTool) -> Harness {
        let temp = TempDir::new().unwrap();
        let paths = EnginePaths::with_base_dir(temp.path().join("engine"));
        paths.ensure_directories().unwrap();

        let tool = Arc::new(tool);
        let store = Arc::new(JsonMetadataStore::open(paths.metadata_file()).unwrap());
        let audit = Arc::new(AuditLogger::new(paths.audit_log()));
        let orchestrator = build(&paths, store.clone(), tool.clone(), audit.clone());

        Harness {
            orchestrator,
            tool,
            store,
            audit,
            paths,
            temp,
        }
    }

    /// An independent engine over the same directories, as a second
    /// process would open it
    pub fn engine_over(paths: &EnginePaths, tool: Arc<FakeTool>) -> Arc<BackupOrchestrator> {
        let store = Arc::new(JsonMetadataStore::open(paths.metadata_file()).unwrap());
        let audit = Arc::new(AuditLogger::new(paths.audit_log()));
        build(paths, store, tool, audit)
    }

    fn build(
        paths: &EnginePaths,
        store: Arc<JsonMetadataStore>,
        tool: Arc<FakeTool>,
        audit: Arc<AuditLogger>,
    ) -> Arc<BackupOrchestrator> {
        let config = OrchestratorConfig {
            connection: ConnectionConfig::default().with_database("pos"),
            backup_dir: paths.backup_dir(),
            scratch_dir: paths.scratch_dir(),
            engine_lock: Some(paths.engine_lock()),
            max_run: Some(Duration::from_secs(60)),
        };
        Arc::new(BackupOrchestrator::new(
            config,
            store,
            tool,
            ArtifactCodec::new(test_key()),
            audit,
        ))
    }
}
