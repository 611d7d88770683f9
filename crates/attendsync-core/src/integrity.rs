//! Read-only audit of the local cache against the remote store.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{RemoteStore, TimeWindow};
use crate::cache::LocalCacheStore;
use crate::config::DEFAULT_UNSYNCED_BACKLOG_THRESHOLD;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub local_records: usize,
    /// `None` when the remote store could not be asked
    pub supabase_records: Option<u64>,
    pub unsynced_records: usize,
    pub synced_records: usize,
    pub yesterday_local: usize,
    pub yesterday_remote: Option<u64>,
    pub issues: Vec<String>,
    pub remote_reachable: bool,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct DataIntegrityChecker {
    store: Arc<LocalCacheStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    backlog_threshold: usize,
}

impl DataIntegrityChecker {
    /// `remote` is `None` when no remote store is configured; the report
    /// then covers local data only.
    pub fn new(store: Arc<LocalCacheStore>, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            store,
            remote,
            backlog_threshold: DEFAULT_UNSYNCED_BACKLOG_THRESHOLD,
        }
    }

    pub fn with_backlog_threshold(mut self, threshold: usize) -> Self {
        self.backlog_threshold = threshold;
        self
    }

    /// Audit with "yesterday" taken in the local timezone.
    pub async fn check(&self) -> IntegrityReport {
        let today = Local::now().date_naive();
        let window = today.pred_opt().and_then(|day| day_window(&Local, day));
        self.check_window(window).await
    }

    /// Audit comparing counts inside `window` as the daily spot check.
    pub async fn check_window(&self, window: Option<TimeWindow>) -> IntegrityReport {
        let data = self.store.read().await;
        let local_records = data.attendance_records.len();
        let unsynced_records = data.unsynced_records();
        let synced_records = local_records - unsynced_records;

        let (yesterday_local, yesterday_synced) = match window {
            Some((start, end)) => data
                .attendance_records
                .iter()
                .filter(|r| r.within(start, end))
                .fold((0, 0), |(all, synced), r| (all + 1, synced + usize::from(!r.is_local_only()))),
            None => (0, 0),
        };

        let mut issues = Vec::new();

        if unsynced_records > self.backlog_threshold {
            issues.push(format!(
                "{} attendance records are waiting to be synced (threshold {})",
                unsynced_records, self.backlog_threshold
            ));
        }

        let (remote_reachable, supabase_records, yesterday_remote) = match &self.remote {
            None => {
                issues.push("Remote store is not configured; only local data was checked".to_string());
                (false, None, None)
            }
            Some(remote) => match remote.count_attendance(None).await {
                Ok(total) => {
                    let yesterday = match window {
                        Some(window) => match remote.count_attendance(Some(window)).await {
                            Ok(count) => Some(count),
                            Err(e) => {
                                issues.push(format!("Could not count yesterday's remote records: {}", e));
                                None
                            }
                        },
                        None => None,
                    };
                    (true, Some(total), yesterday)
                }
                Err(e) if e.is_offline() => {
                    issues.push(format!("Remote store unreachable (offline?), counts are local only: {}", e));
                    (false, None, None)
                }
                Err(e) => {
                    issues.push(format!("Remote store rejected the count request: {}", e));
                    (true, None, None)
                }
            },
        };

        if let Some(total) = supabase_records {
            if total != synced_records as u64 {
                issues.push(format!(
                    "Record count mismatch: {} synced locally, {} in the remote store",
                    synced_records, total
                ));
            }
        }

        if let Some(remote_count) = yesterday_remote {
            if remote_count != yesterday_synced as u64 {
                issues.push(format!(
                    "Yesterday's counts differ: {} synced locally, {} in the remote store",
                    yesterday_synced, remote_count
                ));
            }
        }

        let report = IntegrityReport {
            local_records,
            supabase_records,
            unsynced_records,
            synced_records,
            yesterday_local,
            yesterday_remote,
            issues,
            remote_reachable,
            checked_at: Utc::now(),
        };

        if report.is_healthy() {
            info!(local = local_records, unsynced = unsynced_records, "Integrity check passed");
        } else {
            warn!(issues = report.issues.len(), "Integrity check found issues");
        }
        report
    }
}

/// `[midnight, next midnight)` of `day` in `tz`, as UTC.
fn day_window<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> Option<TimeWindow> {
    let start = tz.from_local_datetime(&day.and_hms_opt(0, 0, 0)?).earliest()?;
    let next = day.succ_opt()?;
    let end = tz.from_local_datetime(&next.and_hms_opt(0, 0, 0)?).earliest()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceEntry, AttendanceMethod, AttendanceType, OfflineDataPatch};
    use crate::testing::MemoryRemoteStore;
    use chrono::{Duration, FixedOffset};

    fn scan(id: &str, at: DateTime<Utc>) -> AttendanceEntry {
        AttendanceEntry::new(id, "S1", "Jane", at, AttendanceType::CheckIn, AttendanceMethod::Rfid)
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
    }

    async fn store_with(records: Vec<AttendanceEntry>) -> Arc<LocalCacheStore> {
        let store = Arc::new(LocalCacheStore::in_memory());
        store.write(OfflineDataPatch::attendance_records(records)).await.unwrap();
        store
    }

    fn synced_and_local(synced: usize, local: usize) -> (Vec<AttendanceEntry>, Vec<AttendanceEntry>) {
        let remote: Vec<_> = (0..synced)
            .map(|i| scan(&format!("srv-{}", i), base() + Duration::minutes(i as i64)))
            .collect();
        let mut cached = remote.clone();
        cached.extend((0..local).map(|i| scan(&format!("local_{}", i), base() + Duration::hours(1 + i as i64))));
        (remote, cached)
    }

    #[tokio::test]
    async fn test_unsynced_records_do_not_count_as_mismatch() {
        let (remote, cached) = synced_and_local(7, 3);
        let checker = DataIntegrityChecker::new(
            store_with(cached).await,
            Some(Arc::new(MemoryRemoteStore::new().with_records(remote))),
        );

        let report = checker.check_window(None).await;
        assert_eq!(report.local_records, 10);
        assert_eq!(report.supabase_records, Some(7));
        assert_eq!(report.unsynced_records, 3);
        assert_eq!(report.synced_records, 7);
        assert!(report.remote_reachable);
        assert!(report.is_healthy(), "unexpected issues: {:?}", report.issues);
    }

    #[tokio::test]
    async fn test_flags_mismatch_and_backlog() {
        let (mut remote, cached) = synced_and_local(2, 4);
        remote.push(scan("srv-extra", base() - Duration::days(3)));
        let checker = DataIntegrityChecker::new(
            store_with(cached).await,
            Some(Arc::new(MemoryRemoteStore::new().with_records(remote))),
        )
        .with_backlog_threshold(3);

        let report = checker.check_window(None).await;
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().any(|i| i.contains("waiting to be synced")));
        assert!(report.issues.iter().any(|i| i.contains("count mismatch")));
    }

    #[tokio::test]
    async fn test_offline_remote_still_reports_local_counts() {
        let (_, cached) = synced_and_local(5, 1);
        let remote = MemoryRemoteStore::new();
        remote.set_offline(true);
        let checker = DataIntegrityChecker::new(store_with(cached).await, Some(Arc::new(remote)));

        let report = checker.check().await;
        assert!(!report.remote_reachable);
        assert_eq!(report.local_records, 6);
        assert_eq!(report.supabase_records, None);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("unreachable"));
    }

    #[tokio::test]
    async fn test_rejected_count_is_not_reported_as_offline() {
        let (_, cached) = synced_and_local(2, 0);
        let remote = MemoryRemoteStore::new();
        remote.set_rejecting(true);
        let checker = DataIntegrityChecker::new(store_with(cached).await, Some(Arc::new(remote)));

        let report = checker.check_window(None).await;
        assert!(report.remote_reachable);
        assert_eq!(report.supabase_records, None);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].starts_with("Remote store rejected"));
        assert!(report.issues[0].contains("anon key"));
        assert!(!report.issues[0].contains("unreachable"));
    }

    #[tokio::test]
    async fn test_server_failure_is_a_rejection() {
        let remote = MemoryRemoteStore::new();
        remote.set_failing(true);
        let checker = DataIntegrityChecker::new(store_with(Vec::new()).await, Some(Arc::new(remote)));

        let report = checker.check_window(None).await;
        assert!(report.remote_reachable);
        assert!(report.issues[0].contains("simulated outage"));
    }

    #[tokio::test]
    async fn test_yesterday_window_comparison() {
        let day = base().date_naive();
        let window = day_window(&Utc, day).unwrap();
        let (mut remote, cached) = synced_and_local(3, 1);
        // Remote knows a row from that day the cache never saw
        remote.push(scan("srv-missing", base() + Duration::hours(5)));
        let checker = DataIntegrityChecker::new(
            store_with(cached).await,
            Some(Arc::new(MemoryRemoteStore::new().with_records(remote))),
        );

        let report = checker.check_window(Some(window)).await;
        assert_eq!(report.yesterday_local, 4);
        assert_eq!(report.yesterday_remote, Some(4));
        assert!(report.issues.iter().any(|i| i.starts_with("Yesterday's counts differ: 3 synced locally, 4")));
    }

    #[test]
    fn test_day_window_respects_timezone() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let (start, end) = day_window(&tz, NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 5, 16, 0, 0).unwrap());
        assert_eq!(end - start, Duration::hours(24));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = IntegrityReport {
            local_records: 1,
            supabase_records: Some(1),
            unsynced_records: 0,
            synced_records: 1,
            yesterday_local: 0,
            yesterday_remote: None,
            issues: vec![],
            remote_reachable: true,
            checked_at: base(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["localRecords"], 1);
        assert_eq!(json["supabaseRecords"], 1);
        assert_eq!(json["remoteReachable"], true);
    }
}
