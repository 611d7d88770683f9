use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{apply_change, ChangeEvent, ChangeFeed, Collection, RealtimeError, Subscription, SubscriptionHandle};
use crate::cache::LocalCacheStore;
use crate::models::{attendance_from_value, student_from_value, AttendanceEntry, Student};

/// Invoked with the refreshed collections after every applied change.
pub type ChangeCallback = Arc<dyn Fn(&[Student], &[AttendanceEntry]) + Send + Sync>;

/// What happened to a single change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The cache changed and was persisted.
    Applied,
    /// Valid event with nothing to do (duplicate insert, unknown id).
    Ignored,
    /// Malformed event.
    Dropped,
    /// The cache could not be written.
    Failed,
}

/// Mirrors remote row changes into the local cache while running.
pub struct RealtimeListener {
    store: Arc<LocalCacheStore>,
    callback: Option<ChangeCallback>,
    handles: Vec<SubscriptionHandle>,
    worker: Option<JoinHandle<()>>,
}

impl RealtimeListener {
    pub fn new(store: Arc<LocalCacheStore>) -> Self {
        Self {
            store,
            callback: None,
            handles: Vec::new(),
            worker: None,
        }
    }

    pub fn on_change(
        mut self,
        callback: impl Fn(&[Student], &[AttendanceEntry]) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Subscribe to both collections and start applying changes.
    ///
    /// A collection whose subscription fails is logged and skipped; this
    /// only errors when neither subscription could be opened.
    pub async fn start(&mut self, feed: &dyn ChangeFeed) -> Result<(), RealtimeError> {
        if self.worker.is_some() || !self.handles.is_empty() {
            self.destroy().await;
        }

        let mut students = None;
        let mut attendance = None;
        let mut last_error = None;

        for collection in Collection::ALL {
            match feed.subscribe(collection).await {
                Ok(Subscription { events, handle }) => {
                    info!(table = collection.table(), "Subscribed to realtime changes");
                    self.handles.push(handle);
                    match collection {
                        Collection::Students => students = Some(events),
                        Collection::Attendance => attendance = Some(events),
                    }
                }
                Err(e) => {
                    warn!(table = collection.table(), error = %e, "Realtime subscription failed");
                    last_error = Some(e);
                }
            }
        }

        if students.is_none() && attendance.is_none() {
            return Err(last_error.unwrap_or(RealtimeError::Closed));
        }

        let store = Arc::clone(&self.store);
        let callback = self.callback.clone();
        self.worker = Some(tokio::spawn(run_worker(store, callback, students, attendance)));
        Ok(())
    }

    /// Stop applying changes and release every open subscription.
    pub async fn destroy(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
        for mut handle in self.handles.drain(..) {
            handle.unsubscribe();
        }
        debug!("Realtime listener destroyed");
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| !w.is_finished()).unwrap_or(false)
    }

    /// Collections with a live subscription.
    pub fn subscribed(&self) -> Vec<Collection> {
        self.handles
            .iter()
            .filter(|h| h.is_active())
            .map(|h| h.collection())
            .collect()
    }

    /// Apply one raw `{eventType, new, old}` event outside the worker.
    pub async fn handle_event(&self, collection: Collection, raw: Value) -> ApplyOutcome {
        apply_raw(&self.store, self.callback.as_ref(), collection, raw).await
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn run_worker(
    store: Arc<LocalCacheStore>,
    callback: Option<ChangeCallback>,
    mut students: Option<mpsc::Receiver<Value>>,
    mut attendance: Option<mpsc::Receiver<Value>>,
) {
    loop {
        let (collection, raw) = tokio::select! {
            Some(raw) = recv_opt(&mut students) => (Collection::Students, raw),
            Some(raw) = recv_opt(&mut attendance) => (Collection::Attendance, raw),
            else => break,
        };
        apply_raw(&store, callback.as_ref(), collection, raw).await;
    }
    debug!("All realtime streams ended");
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<Value>>) -> Option<Value> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

async fn apply_raw(
    store: &LocalCacheStore,
    callback: Option<&ChangeCallback>,
    collection: Collection,
    raw: Value,
) -> ApplyOutcome {
    let event = match ChangeEvent::parse(raw) {
        Ok(event) => event,
        Err(e) => return dropped(collection, e),
    };
    let kind = event.event_type;

    let result = match collection {
        Collection::Students => match event.into_change(student_from_value) {
            Ok(change) => {
                store
                    .modify(|data| apply_change(&mut data.students, change), |changed| *changed)
                    .await
            }
            Err(e) => return dropped(collection, e),
        },
        Collection::Attendance => match event.into_change(attendance_from_value) {
            Ok(change) => {
                store
                    .modify(|data| apply_change(&mut data.attendance_records, change), |changed| *changed)
                    .await
            }
            Err(e) => return dropped(collection, e),
        },
    };

    match result {
        Ok((true, data)) => {
            debug!(table = collection.table(), ?kind, "Applied realtime change");
            if let Some(callback) = callback {
                callback(&data.students, &data.attendance_records);
            }
            ApplyOutcome::Applied
        }
        Ok((false, _)) => {
            debug!(table = collection.table(), ?kind, "Realtime change already reflected locally");
            ApplyOutcome::Ignored
        }
        Err(e) => {
            warn!(table = collection.table(), error = %e, "Failed to persist realtime change");
            ApplyOutcome::Failed
        }
    }
}

fn dropped(collection: Collection, error: RealtimeError) -> ApplyOutcome {
    warn!(table = collection.table(), error = %error, "Dropping malformed change event");
    ApplyOutcome::Dropped
}
