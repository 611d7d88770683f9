//! Remote store access.
//!
//! This module defines the `RemoteStore` port the sync orchestrator and the
//! integrity checker talk to, and `SupabaseClient`, its implementation over
//! the hosted database's PostgREST interface.
//!
//! Requests authenticate with the project's anon key sent both as the
//! `apikey` header and as a bearer token.

pub mod client;
pub mod error;
pub mod remote;

pub use client::SupabaseClient;
pub use error::RemoteError;
pub use remote::{RemoteStore, TimeWindow};
