//! Display helpers shared by the CLI and status reporting.

pub mod format;

pub use format::{format_age, format_local_time, truncate_string};
