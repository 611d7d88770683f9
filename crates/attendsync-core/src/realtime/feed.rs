use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Collection;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Failed to connect to realtime service: {0}")]
    Connect(String),

    #[error("Realtime protocol error: {0}")]
    Protocol(String),

    #[error("Malformed change event: {0}")]
    Malformed(String),

    #[error("Realtime channel closed")]
    Closed,
}

/// Source of per-collection change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription delivering normalised `{eventType, new, old}`
    /// values for `collection`.
    async fn subscribe(&self, collection: Collection) -> Result<Subscription, RealtimeError>;
}

/// An open subscription: the event stream plus the handle that releases it.
pub struct Subscription {
    pub events: mpsc::Receiver<Value>,
    pub handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(collection: Collection, events: mpsc::Receiver<Value>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            events,
            handle: SubscriptionHandle::new(collection, task),
        }
    }

    pub fn collection(&self) -> Collection {
        self.handle.collection()
    }
}

/// Owns the transport task behind a subscription. Unsubscribing (or
/// dropping the handle) stops the task and releases its connection.
pub struct SubscriptionHandle {
    collection: Collection,
    task: Option<JoinHandle<()>>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn new(collection: Collection, task: Option<JoinHandle<()>>) -> Self {
        Self {
            collection,
            task,
            active: true,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn is_active(&self) -> bool {
        self.active && self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(true)
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.active = false;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
