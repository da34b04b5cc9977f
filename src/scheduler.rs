//! Scheduled backups
//!
//! Holds its own timer and, on every tick, takes a scheduled backup and then
//! applies the retention window. Nothing here knows about calendars or cron
//! syntax; the interval comes from settings.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backup::{BackupOrchestrator, CreateOptions, RetentionManager, SYSTEM_ACTOR};
use crate::models::{BackupId, BackupType};

/// What one scheduled run did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub backup_id: Option<BackupId>,
    pub error: Option<String>,
    pub pruned: usize,
}

pub struct BackupScheduler {
    orchestrator: Arc<BackupOrchestrator>,
    retention: RetentionManager,
    interval: Duration,
}

impl BackupScheduler {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, interval: Duration, retention_days: u32) -> Self {
        Self {
            retention: RetentionManager::new(Arc::clone(&orchestrator), retention_days),
            orchestrator,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take one scheduled backup, then prune if it succeeded
    ///
    /// Errors are logged, not returned; the orchestrator has already
    /// persisted the failed record.
    pub async fn run_once(&self, cancel: &CancellationToken) -> TickReport {
        let options = CreateOptions::new(BackupType::Scheduled)
            .created_by(SYSTEM_ACTOR)
            .with_cancel(cancel.child_token());

        let record = match self.orchestrator.create_with(options).await {
            Ok(record) => record,
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Scheduled backup failed");
                return TickReport {
                    error: Some(e.to_string()),
                    ..TickReport::default()
                };
            }
        };

        let mut report = TickReport {
            backup_id: Some(record.id),
            ..TickReport::default()
        };
        match self.retention.prune().await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => {
                error!(error = %e, "Retention pass after scheduled backup failed");
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// Run until `shutdown` is cancelled; the first backup happens one full
    /// interval after start
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "Backup scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_once(&shutdown).await;
                    if let Some(id) = report.backup_id {
                        info!(backup_id = %id, pruned = report.pruned, "Scheduled backup finished");
                    }
                }
            }
        }

        info!("Backup scheduler stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{harness, harness_with, FakeTool};
    use crate::models::BackupStatus;
    use crate::storage::RecordFilter;

    #[tokio::test]
    async fn test_run_once_creates_scheduled_backup() {
        let h = harness();
        let scheduler = BackupScheduler::new(h.orchestrator.clone(), Duration::from_secs(3600), 30);

        let report = scheduler.run_once(&CancellationToken::new()).await;
        assert!(report.error.is_none());
        assert_eq!(report.pruned, 0);

        let record = h.orchestrator.get(report.backup_id.unwrap()).await.unwrap();
        assert_eq!(record.backup_type, BackupType::Scheduled);
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.created_by.as_deref(), Some(SYSTEM_ACTOR));
    }

    #[tokio::test]
    async fn test_run_once_swallows_failure() {
        let h = harness_with(FakeTool::failing());
        let scheduler = BackupScheduler::new(h.orchestrator.clone(), Duration::from_secs(3600), 30);

        let report = scheduler.run_once(&CancellationToken::new()).await;
        assert!(report.backup_id.is_none());
        assert!(report.error.unwrap().contains("Dump failed"));

        let records = h.orchestrator.list(&RecordFilter::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_ticks_and_stops() {
        let h = harness();
        let scheduler = BackupScheduler::new(h.orchestrator.clone(), Duration::from_millis(50), 30);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let done = h
                .orchestrator
                .list(&RecordFilter::all().with_status(BackupStatus::Completed))
                .await
                .unwrap();
            if !done.is_empty() || std::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();

        let stats = h.orchestrator.stats().await.unwrap();
        assert!(stats.scheduled >= 1);
    }
}
