//! Retention policy
//!
//! Completed backups older than the retention window are deleted, artifact
//! and record together. Pending, running and failed records are never
//! touched.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEntry};
use crate::error::BackupResult;
use crate::models::{BackupRecord, BackupStatus};
use crate::storage::RecordFilter;

use super::orchestrator::{BackupOrchestrator, SYSTEM_ACTOR};

/// Records eligible for pruning: completed and strictly older than
/// `now - days`
pub fn select_expired<'a>(
    records: impl IntoIterator<Item = &'a BackupRecord>,
    days: u32,
    now: DateTime<Utc>,
) -> Vec<&'a BackupRecord> {
    let cutoff = now - Duration::days(i64::from(days));
    records
        .into_iter()
        .filter(|r| r.status == BackupStatus::Completed && r.timestamp < cutoff)
        .collect()
}

/// Applies the retention window through the orchestrator
pub struct RetentionManager {
    orchestrator: Arc<BackupOrchestrator>,
    retention_days: u32,
}

impl RetentionManager {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, retention_days: u32) -> Self {
        Self {
            orchestrator,
            retention_days,
        }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Prune with the configured window
    pub async fn prune(&self) -> BackupResult<usize> {
        self.prune_older_than(self.retention_days).await
    }

    /// Prune completed backups older than `days`; returns how many went
    pub async fn prune_older_than(&self, days: u32) -> BackupResult<usize> {
        prune(&self.orchestrator, days, Utc::now()).await
    }
}

pub(super) async fn prune(
    orchestrator: &BackupOrchestrator,
    days: u32,
    now: DateTime<Utc>,
) -> BackupResult<usize> {
    // Held for the whole pass
    let guard = match orchestrator.slot.try_acquire("retention prune") {
        Ok(guard) => guard,
        Err(e) => {
            orchestrator.audit_entry(
                AuditEntry::failure(AuditAction::Prune, SYSTEM_ACTOR, None, &e)
                    .with_details(serde_json::json!({ "days": days, "deleted": 0 })),
            );
            return Err(e);
        }
    };

    let candidates = orchestrator
        .list(&RecordFilter::all().with_status(BackupStatus::Completed))
        .await?;
    let expired = select_expired(&candidates, days, now);

    let mut deleted = 0;
    for record in expired {
        match orchestrator.delete_held(record.id, SYSTEM_ACTOR, &guard).await {
            Ok(_) => deleted += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(backup_id = %record.id, error = %e, "Failed to prune backup");
                orchestrator.audit_entry(
                    AuditEntry::failure(AuditAction::Prune, SYSTEM_ACTOR, Some(record.id), &e)
                        .with_details(serde_json::json!({ "days": days, "deleted": deleted })),
                );
                return Err(e);
            }
        }
    }

    orchestrator.audit_entry(
        AuditEntry::success(AuditAction::Prune, SYSTEM_ACTOR, None)
            .with_details(serde_json::json!({ "days": days, "deleted": deleted })),
    );
    info!(days, deleted, "Retention pass finished");
    Ok(deleted)
}
