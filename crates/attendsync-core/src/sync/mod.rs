//! Bidirectional reconciliation between the local cache and the remote store.
//!
//! A sync is push then pull:
//!
//! - push submits every local-only record, adopting the id of an existing
//!   remote row with the same natural key instead of inserting a duplicate
//! - pull replaces synced records with the remote collections and keeps
//!   local-only records the remote does not know yet
//!
//! Remote calls all happen before the cache is touched, so a failure leaves
//! the cache exactly as it was. Only one sync runs at a time per orchestrator.

mod merge;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{RemoteError, RemoteStore};
use crate::cache::{LocalCacheStore, StorageError};
use crate::models::OfflineData;

use merge::{adopt_server_ids, merge_pulled};

/// Shortest accepted period for scheduled syncs.
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Failed to update local cache: {0}")]
    Storage(#[from] StorageError),

    #[error("A sync is already in progress")]
    InProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub students_added: usize,
    pub records_added: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub pushed: PushSummary,
    pub students: usize,
    pub attendance_records: usize,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sync_errors: u32,
}

/// Clears the in-progress flag however the sync ends, including when the
/// task running it is aborted.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SyncError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| SyncError::InProgress)
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteStore>,
    store: Arc<LocalCacheStore>,
    syncing: Arc<AtomicBool>,
    status: Arc<RwLock<SyncStatus>>,
    scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncOrchestrator {
    pub fn new(remote: Arc<dyn RemoteStore>, store: Arc<LocalCacheStore>) -> Self {
        Self {
            remote,
            store,
            syncing: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(SyncStatus::default())),
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &Arc<LocalCacheStore> {
        &self.store
    }

    /// Submit every local-only record and adopt the ids the remote store
    /// assigned. Counts only rows that were actually inserted.
    pub async fn push_local_to_remote(&self) -> Result<PushSummary, SyncError> {
        let _guard = SyncGuard::acquire(&self.syncing)?;
        let result = self.push().await;
        self.record(&result, None).await;
        result
    }

    /// Replace the cached collections with the remote ones, keeping
    /// unsynced local records, and stamp `last_sync`.
    pub async fn pull_remote_to_local(&self) -> Result<OfflineData, SyncError> {
        let _guard = SyncGuard::acquire(&self.syncing)?;
        let result = self.pull().await;
        let synced_at = result.as_ref().ok().and_then(|data| data.last_sync);
        self.record(&result, synced_at).await;
        result
    }

    /// Push then pull.
    pub async fn force_sync(&self) -> Result<SyncReport, SyncError> {
        let _guard = SyncGuard::acquire(&self.syncing)?;
        let result = self.sync_once().await;
        let synced_at = result.as_ref().ok().map(|report| report.synced_at);
        self.record(&result, synced_at).await;
        result
    }

    /// Sync every `interval` in the background until [`stop`](Self::stop).
    /// The first sync runs immediately.
    pub fn start(&self, interval: Duration) {
        let interval = interval.max(MIN_SYNC_INTERVAL);
        let orchestrator = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match orchestrator.force_sync().await {
                    Ok(report) => debug!(?report.pushed, "Scheduled sync finished"),
                    Err(SyncError::InProgress) => debug!("Skipping scheduled sync, one is already running"),
                    // Already recorded in the status
                    Err(_) => {}
                }
            }
        });

        let mut slot = self.scheduler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Periodic sync started");
    }

    /// Cancel periodic syncing. A sync in flight is abandoned before it
    /// writes the cache.
    pub fn stop(&self) {
        let mut slot = self.scheduler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
            info!("Periodic sync stopped");
        }
    }

    pub fn is_scheduled(&self) -> bool {
        let slot = self.scheduler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false)
    }

    pub async fn status(&self) -> SyncStatus {
        let mut status = self.status.read().await.clone();
        status.is_syncing = self.syncing.load(Ordering::Acquire);
        status
    }

    async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        let pushed = self.push().await?;
        let data = self.pull().await?;
        Ok(SyncReport {
            pushed,
            students: data.students.len(),
            attendance_records: data.attendance_records.len(),
            synced_at: data.last_sync.unwrap_or_else(Utc::now),
        })
    }

    async fn push(&self) -> Result<PushSummary, SyncError> {
        let snapshot = self.store.read().await;
        let mut summary = PushSummary::default();

        let mut student_ids = HashMap::new();
        for student in snapshot.students.iter().filter(|s| s.is_local_only()) {
            let server = match self.remote.find_student(student.natural_key()).await? {
                Some(existing) => existing,
                None => {
                    summary.students_added += 1;
                    self.remote.insert_student(student).await?
                }
            };
            student_ids.insert(student.id.clone(), server.id);
        }

        let mut record_ids = HashMap::new();
        for entry in snapshot.attendance_records.iter().filter(|r| r.is_local_only()) {
            let server = match self.remote.find_attendance(&entry.natural_key()).await? {
                Some(existing) => existing,
                None => {
                    summary.records_added += 1;
                    self.remote.insert_attendance(entry).await?
                }
            };
            record_ids.insert(entry.id.clone(), server.id);
        }

        if student_ids.is_empty() && record_ids.is_empty() {
            debug!("Nothing to push");
            return Ok(summary);
        }

        let (dropped, _) = self
            .store
            .modify(
                |data| {
                    adopt_server_ids(&mut data.students, &student_ids, |s, id| s.id = id)
                        + adopt_server_ids(&mut data.attendance_records, &record_ids, |r, id| r.id = id)
                },
                |_| true,
            )
            .await?;

        info!(
            students_added = summary.students_added,
            records_added = summary.records_added,
            confirmed = student_ids.len() + record_ids.len(),
            dropped,
            "Pushed local records"
        );
        Ok(summary)
    }

    async fn pull(&self) -> Result<OfflineData, SyncError> {
        let students = self.remote.fetch_students().await?;
        let records = self.remote.fetch_attendance(None).await?;
        let now = Utc::now();

        let (_, data) = self
            .store
            .modify(|data| merge_pulled(data, students, records, now), |_| true)
            .await?;

        info!(
            students = data.students.len(),
            records = data.attendance_records.len(),
            unsynced = data.unsynced_records(),
            "Pulled remote data"
        );
        Ok(data)
    }

    async fn record<T>(&self, result: &Result<T, SyncError>, synced_at: Option<DateTime<Utc>>) {
        let mut status = self.status.write().await;
        match result {
            Ok(_) => {
                status.last_error = None;
                if synced_at.is_some() {
                    status.last_sync = synced_at;
                }
            }
            Err(e) => {
                warn!(error = %e, "Sync failed");
                status.last_error = Some(e.to_string());
                status.sync_errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceEntry, AttendanceMethod, AttendanceType, OfflineDataPatch, Student};
    use crate::testing::MemoryRemoteStore;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap() + ChronoDuration::minutes(minutes)
    }

    fn scan(id: &str, student: &str, minutes: i64) -> AttendanceEntry {
        AttendanceEntry::new(id, student, "Jane", at(minutes), AttendanceType::CheckIn, AttendanceMethod::Barcode)
    }

    fn setup(remote: MemoryRemoteStore) -> (Arc<MemoryRemoteStore>, SyncOrchestrator) {
        let remote = Arc::new(remote);
        let store = Arc::new(LocalCacheStore::in_memory());
        let orchestrator = SyncOrchestrator::new(remote.clone(), store);
        (remote, orchestrator)
    }

    #[tokio::test]
    async fn test_push_inserts_once_and_adopts_server_ids() {
        let (remote, sync) = setup(MemoryRemoteStore::new());
        sync.store().add_student(Student::new("", "S1", "Jane")).await.unwrap();
        sync.store().add_attendance(scan("", "S1", 0)).await.unwrap();
        sync.store().add_attendance(scan("", "S1", 5)).await.unwrap();

        let first = sync.push_local_to_remote().await.unwrap();
        assert_eq!(first, PushSummary { students_added: 1, records_added: 2 });

        let data = sync.store().read().await;
        assert_eq!(data.unsynced_students() + data.unsynced_records(), 0);
        let remote_ids: Vec<String> = remote.records().into_iter().map(|r| r.id).collect();
        assert!(data.attendance_records.iter().all(|r| remote_ids.contains(&r.id)));

        let second = sync.push_local_to_remote().await.unwrap();
        assert_eq!(second, PushSummary::default());
        assert_eq!(remote.insert_count(), 3);
    }

    #[tokio::test]
    async fn test_push_adopts_existing_remote_row_by_natural_key() {
        let (remote, sync) = setup(MemoryRemoteStore::new().with_records(vec![scan("srv-1", "S1", 0)]));
        sync.store().add_attendance(scan("local_a", "S1", 0)).await.unwrap();

        let summary = sync.push_local_to_remote().await.unwrap();
        assert_eq!(summary.records_added, 0);
        assert_eq!(remote.insert_count(), 0);
        assert_eq!(sync.store().read().await.attendance_records[0].id, "srv-1");
    }

    #[tokio::test]
    async fn test_push_does_not_duplicate_row_delivered_by_realtime() {
        let (remote, sync) = setup(MemoryRemoteStore::new());
        sync.store().add_attendance(scan("local_a", "S1", 0)).await.unwrap();
        // The server id issued on insert is predictable, and a realtime
        // insert for it lands in the cache before the push finishes.
        let server_id = remote.next_id();
        sync.store().add_attendance(scan(&server_id, "S1", 0)).await.unwrap();

        sync.push_local_to_remote().await.unwrap();
        let data = sync.store().read().await;
        assert_eq!(data.attendance_records.len(), 1);
        assert_eq!(data.attendance_records[0].id, server_id);
    }

    #[tokio::test]
    async fn test_pull_keeps_unsynced_local_records() {
        let (_remote, sync) = setup(
            MemoryRemoteStore::new()
                .with_students(vec![Student::new("s1", "S1", "Jane")])
                .with_records(vec![scan("srv-1", "S1", 0), scan("srv-2", "S1", 10)]),
        );
        sync.store().add_attendance(scan("local_x", "S2", 5)).await.unwrap();
        sync.store()
            .write(OfflineDataPatch::students(vec![Student::new("stale", "S3", "Removed")]))
            .await
            .unwrap();

        let data = sync.pull_remote_to_local().await.unwrap();
        let ids: Vec<&str> = data.attendance_records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-2", "local_x", "srv-1"]);
        assert_eq!(data.students.len(), 1);
        assert!(data.last_sync.is_some());
        assert_eq!(sync.status().await.last_sync, data.last_sync);
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_cache_untouched() {
        let (remote, sync) = setup(MemoryRemoteStore::new());
        sync.store().add_attendance(scan("local_a", "S1", 0)).await.unwrap();
        let before = sync.store().read().await;

        remote.set_failing(true);
        assert!(matches!(sync.force_sync().await, Err(SyncError::Remote(_))));
        assert!(sync.pull_remote_to_local().await.is_err());
        assert_eq!(sync.store().read().await, before);

        let status = sync.status().await;
        assert!(!status.is_syncing);
        assert_eq!(status.sync_errors, 2);
        assert!(status.last_error.is_some());
        assert!(status.last_sync.is_none());

        remote.set_failing(false);
        let report = sync.force_sync().await.unwrap();
        assert_eq!(report.pushed.records_added, 1);
        assert_eq!(report.attendance_records, 1);
        assert!(sync.status().await.last_error.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let (_remote, sync) = setup(MemoryRemoteStore::new());
        let _held = SyncGuard::acquire(&sync.syncing).unwrap();
        assert!(matches!(sync.force_sync().await, Err(SyncError::InProgress)));
        assert!(sync.status().await.is_syncing);
    }

    #[tokio::test]
    async fn test_start_and_stop_schedule() {
        let (_remote, sync) = setup(MemoryRemoteStore::new().with_students(vec![Student::new("s1", "S1", "Jane")]));
        sync.start(std::time::Duration::from_secs(3600));
        assert!(sync.is_scheduled());

        // The first tick fires immediately
        for _ in 0..50 {
            if sync.status().await.last_sync.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(sync.store().read().await.students.len(), 1);

        sync.stop();
        assert!(!sync.is_scheduled());
    }
}
