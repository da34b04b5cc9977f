//! Backup metadata persistence
//!
//! The [`MetadataStore`] port and its JSON implementation, which rewrites
//! backups.json atomically under a file lock on each mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackupError, BackupResult};
use crate::models::{BackupId, BackupRecord, BackupStats, BackupStatus, BackupType};

use super::file_io::{read_json, update_json};

/// Criteria for listing records; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<BackupStatus>,
    pub backup_type: Option<BackupType>,
    /// Only records created strictly before this instant
    pub older_than: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, backup_type: BackupType) -> Self {
        self.backup_type = Some(backup_type);
        self
    }

    pub fn older_than(mut self, cutoff: DateTime<Utc>) -> Self {
        self.older_than = Some(cutoff);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.backup_type.map_or(true, |t| record.backup_type == t)
            && self.older_than.map_or(true, |cutoff| record.timestamp < cutoff)
    }
}

/// Persistence port for backup records
///
/// Implementations hold no business rules; state transitions are decided
/// by the orchestrator.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the record with the same id
    async fn upsert(&self, record: &BackupRecord) -> BackupResult<()>;

    async fn find(&self, id: BackupId) -> BackupResult<Option<BackupRecord>>;

    /// Records matching `filter`, newest first
    async fn list(&self, filter: &RecordFilter) -> BackupResult<Vec<BackupRecord>>;

    /// Remove a record, returning whether it existed
    async fn delete(&self, id: BackupId) -> BackupResult<bool>;

    async fn aggregate_stats(&self) -> BackupResult<BackupStats>;
}

/// Serializable metadata file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetadataFile {
    records: Vec<BackupRecord>,
}

/// [`MetadataStore`] backed by a single JSON file
///
/// Several processes may open the same file. Every mutation re-reads the
/// file under an exclusive lock on `<file>.lock` and rewrites it before the
/// lock is released; every query re-reads the file first. The in-memory map
/// is the last snapshot seen.
pub struct JsonMetadataStore {
    path: PathBuf,
    lock_path: PathBuf,
    data: RwLock<HashMap<BackupId, BackupRecord>>,
}

impl JsonMetadataStore {
    /// Open the store at `path`, loading existing records if the file exists
    pub fn open(path: PathBuf) -> BackupResult<Self> {
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");

        let store = Self {
            path,
            lock_path: PathBuf::from(lock_name),
            data: RwLock::new(HashMap::new()),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reload records from disk
    pub fn load(&self) -> BackupResult<()> {
        let file_data: MetadataFile = read_json(&self.path)?;
        let count = self.replace_snapshot(file_data.records)?;
        debug!(path = %self.path.display(), count, "Loaded backup metadata");
        Ok(())
    }

    fn replace_snapshot(&self, records: Vec<BackupRecord>) -> BackupResult<usize> {
        let mut data = self
            .data
            .write()
            .map_err(|e| BackupError::Storage(format!("Failed to acquire write lock: {}", e)))?;

        data.clear();
        for record in records {
            data.insert(record.id, record);
        }
        Ok(data.len())
    }

    /// Locked read-modify-write of the whole file, off the async workers
    async fn mutate<F, R>(&self, update: F) -> BackupResult<R>
    where
        F: FnOnce(&mut Vec<BackupRecord>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let (file_data, result) = tokio::task::spawn_blocking(move || {
            update_json(&path, &lock_path, |file: &mut MetadataFile| {
                let result = update(&mut file.records);
                file.records
                    .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
                result
            })
        })
        .await
        .map_err(|e| BackupError::Storage(format!("Metadata writer task failed: {}", e)))??;

        self.replace_snapshot(file_data.records)?;
        Ok(result)
    }

    /// Re-read the file and run `query` over the fresh snapshot
    fn query<F, R>(&self, query: F) -> BackupResult<R>
    where
        F: FnOnce(&HashMap<BackupId, BackupRecord>) -> R,
    {
        let file_data: MetadataFile = read_json(&self.path)?;
        self.replace_snapshot(file_data.records)?;
        let data = self
            .data
            .read()
            .map_err(|e| BackupError::Storage(format!("Failed to acquire read lock: {}", e)))?;
        Ok(query(&data))
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn upsert(&self, record: &BackupRecord) -> BackupResult<()> {
        let record = record.clone();
        self.mutate(move |records| {
            records.retain(|r| r.id != record.id);
            records.push(record);
        })
        .await
    }

    async fn find(&self, id: BackupId) -> BackupResult<Option<BackupRecord>> {
        self.query(|data| data.get(&id).cloned())
    }

    async fn list(&self, filter: &RecordFilter) -> BackupResult<Vec<BackupRecord>> {
        self.query(|data| {
            let mut records: Vec<BackupRecord> =
                data.values().filter(|r| filter.matches(r)).cloned().collect();
            records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
            if let Some(limit) = filter.limit {
                records.truncate(limit);
            }
            records
        })
    }

    async fn delete(&self, id: BackupId) -> BackupResult<bool> {
        self.mutate(move |records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        })
        .await
    }

    async fn aggregate_stats(&self) -> BackupResult<BackupStats> {
        self.query(|data| BackupStats::from_records(data.values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(backup_type: BackupType, age_days: i64) -> BackupRecord {
        let mut record = BackupRecord::new(BackupId::new(), backup_type, PathBuf::from("a.enc"));
        record.timestamp = Utc::now() - Duration::days(age_days);
        record
    }

    fn store(temp_dir: &TempDir) -> JsonMetadataStore {
        JsonMetadataStore::open(temp_dir.path().join("backups.json")).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let mut rec = record(BackupType::Manual, 0);
        store.upsert(&rec).await.unwrap();
        assert_eq!(store.find(rec.id).await.unwrap(), Some(rec.clone()));

        rec.start().unwrap();
        store.upsert(&rec).await.unwrap();
        let found = store.find(rec.id).await.unwrap().unwrap();
        assert_eq!(found.status, BackupStatus::Running);
    }

    #[tokio::test]
    async fn test_persisted_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let rec = record(BackupType::Scheduled, 1);
        {
            let store = store(&temp_dir);
            store.upsert(&rec).await.unwrap();
        }

        let reopened = store(&temp_dir);
        assert_eq!(reopened.find(rec.id).await.unwrap(), Some(rec));

        let raw = std::fs::read_to_string(temp_dir.path().join("backups.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["records"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filter() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let old = record(BackupType::Manual, 10);
        let mid = record(BackupType::Scheduled, 5);
        let new = record(BackupType::Manual, 0);
        for r in [&old, &mid, &new] {
            store.upsert(r).await.unwrap();
        }

        let all = store.list(&RecordFilter::all()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![new.id, mid.id, old.id]);

        let manual = store
            .list(&RecordFilter::all().with_type(BackupType::Manual))
            .await
            .unwrap();
        assert_eq!(manual.len(), 2);

        let cutoff = Utc::now() - Duration::days(3);
        let older = store
            .list(&RecordFilter::all().older_than(cutoff))
            .await
            .unwrap();
        assert_eq!(older.len(), 2);

        let limited = store.list(&RecordFilter::all().limit(1)).await.unwrap();
        assert_eq!(limited[0].id, new.id);
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let rec = record(BackupType::Manual, 0);
        store.upsert(&rec).await.unwrap();

        assert!(store.delete(rec.id).await.unwrap());
        assert!(!store.delete(rec.id).await.unwrap());
        assert!(store.find(rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_handles_on_one_file_keep_both_records() {
        let temp_dir = TempDir::new().unwrap();
        let first = store(&temp_dir);
        let second = store(&temp_dir);

        let a = record(BackupType::Manual, 0);
        let b = record(BackupType::Scheduled, 0);
        first.upsert(&a).await.unwrap();
        second.upsert(&b).await.unwrap();

        // Each handle sees the other's write without reopening
        assert_eq!(first.find(b.id).await.unwrap(), Some(b.clone()));
        assert_eq!(second.find(a.id).await.unwrap(), Some(a.clone()));

        assert!(first.delete(b.id).await.unwrap());
        assert!(second.find(b.id).await.unwrap().is_none());
        assert_eq!(store(&temp_dir).list(&RecordFilter::all()).await.unwrap(), vec![a]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_lose_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backups.json");

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let store = JsonMetadataStore::open(path.clone()).unwrap();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..5 {
                    let rec = record(BackupType::Manual, 0);
                    store.upsert(&rec).await.unwrap();
                    ids.push(rec.id);
                }
                ids
            }));
        }

        let mut written = Vec::new();
        for task in tasks {
            written.extend(task.await.unwrap());
        }

        let reopened = JsonMetadataStore::open(path).unwrap();
        assert_eq!(reopened.list(&RecordFilter::all()).await.unwrap().len(), 30);
        for id in written {
            assert!(reopened.find(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_aggregate_stats() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let mut failed = record(BackupType::Automatic, 0);
        failed.fail("boom", 10).unwrap();
        store.upsert(&failed).await.unwrap();
        store.upsert(&record(BackupType::Manual, 0)).await.unwrap();

        let stats = store.aggregate_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.automatic, 1);
    }
}
