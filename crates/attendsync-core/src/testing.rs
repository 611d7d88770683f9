//! In-memory stand-ins for the remote store and the realtime feed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::api::{RemoteError, RemoteStore, TimeWindow};
use crate::models::{AttendanceEntry, AttendanceKey, Student};
use crate::realtime::{ChangeFeed, Collection, RealtimeError, Subscription};

/// Remote store backed by vectors. Server ids are `srv-<n>`.
#[derive(Default)]
pub(crate) struct MemoryRemoteStore {
    students: Mutex<Vec<Student>>,
    records: Mutex<Vec<AttendanceEntry>>,
    failing: AtomicBool,
    offline: AtomicBool,
    rejecting: AtomicBool,
    next_id: AtomicUsize,
    inserts: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_students(self, students: Vec<Student>) -> Self {
        *self.students.lock().unwrap() = students;
        self
    }

    pub fn with_records(self, records: Vec<AttendanceEntry>) -> Self {
        *self.records.lock().unwrap() = records;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail with a real connection error, as when the network is down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answer every call as a 401 would.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AttendanceEntry> {
        self.records.lock().unwrap().clone()
    }

    /// Id the next insert will be assigned.
    pub fn next_id(&self) -> String {
        format!("srv-{}", self.next_id.load(Ordering::SeqCst) + 1)
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(refused_connection().await);
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(RemoteError::Unauthorized);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::ServerError("simulated outage".to_string()));
        }
        Ok(())
    }

    fn issue_id(&self) -> String {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch_students(&self) -> Result<Vec<Student>, RemoteError> {
        self.check().await?;
        Ok(self.students.lock().unwrap().clone())
    }

    async fn fetch_attendance(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AttendanceEntry>, RemoteError> {
        self.check().await?;
        let mut records: Vec<AttendanceEntry> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| since.map(|s| r.timestamp >= s).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn find_student(&self, student_id: &str) -> Result<Option<Student>, RemoteError> {
        self.check().await?;
        Ok(self.students.lock().unwrap().iter().find(|s| s.student_id == student_id).cloned())
    }

    async fn find_attendance(&self, key: &AttendanceKey) -> Result<Option<AttendanceEntry>, RemoteError> {
        self.check().await?;
        Ok(self.records.lock().unwrap().iter().find(|r| &r.natural_key() == key).cloned())
    }

    async fn insert_student(&self, student: &Student) -> Result<Student, RemoteError> {
        self.check().await?;
        let mut stored = student.clone();
        stored.id = self.issue_id();
        self.students.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn insert_attendance(&self, entry: &AttendanceEntry) -> Result<AttendanceEntry, RemoteError> {
        self.check().await?;
        let mut stored = entry.clone();
        stored.id = self.issue_id();
        self.records.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn count_attendance(&self, window: Option<TimeWindow>) -> Result<u64, RemoteError> {
        self.check().await?;
        let records = self.records.lock().unwrap();
        let count = match window {
            Some((start, end)) => records.iter().filter(|r| r.within(start, end)).count(),
            None => records.len(),
        };
        Ok(count as u64)
    }
}

/// Error from connecting to a loopback port nobody listens on.
async fn refused_connection() -> RemoteError {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    match reqwest::get(format!("http://{}/", addr)).await {
        Err(e) => RemoteError::NetworkError(e),
        Ok(response) => panic!("closed port {} answered with {}", addr, response.status()),
    }
}

/// Change feed whose events are pushed by the test through [`sender`](Self::sender).
#[derive(Default)]
pub(crate) struct ChannelFeed {
    senders: Mutex<HashMap<Collection, mpsc::Sender<Value>>>,
    failing: HashSet<Collection>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subscriptions to `collection` fail.
    pub fn failing(mut self, collection: Collection) -> Self {
        self.failing.insert(collection);
        self
    }

    pub fn sender(&self, collection: Collection) -> Option<mpsc::Sender<Value>> {
        self.senders.lock().unwrap().get(&collection).cloned()
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn subscribe(&self, collection: Collection) -> Result<Subscription, RealtimeError> {
        if self.failing.contains(&collection) {
            return Err(RealtimeError::Connect(format!("{} refused", collection)));
        }
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().unwrap().insert(collection, tx);
        Ok(Subscription::new(collection, rx, None))
    }
}
