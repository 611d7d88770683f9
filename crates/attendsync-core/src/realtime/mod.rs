//! Realtime change subscriptions.
//!
//! The remote store publishes row changes per table. This module holds:
//!
//! - `ChangeFeed`: the port a listener subscribes through, one
//!   `Subscription` per collection
//! - `PhoenixFeed`: the websocket transport speaking the hosted realtime
//!   service's channel protocol, with reconnect and backoff
//! - `apply`: the idempotent insert/update/delete rules
//! - `RealtimeListener`: applies incoming changes to the local cache and
//!   notifies a callback
//!
//! Every change is normalised to `{eventType, new, old}` before it reaches
//! the listener; payloads that do not fit are dropped.

pub mod apply;
pub mod event;
pub mod feed;
pub mod listener;
pub mod phoenix;

pub use apply::{apply_change, Change};
pub use event::{ChangeEvent, ChangeKind, Collection};
pub use feed::{ChangeFeed, RealtimeError, Subscription, SubscriptionHandle};
pub use listener::{ApplyOutcome, ChangeCallback, RealtimeListener};
pub use phoenix::{Backoff, PhoenixFeed};
