//! Application configuration management.
//!
//! This module handles loading and saving the sync configuration: the
//! remote project URL and key, the library (tenant) tag, which storage
//! backend to prefer and how often to sync.
//!
//! Configuration is stored at `~/.config/attendsync/config.json`.
//! Environment variables (`SUPABASE_URL`, `SUPABASE_ANON_KEY`,
//! `ATTENDSYNC_LIBRARY`) override the file.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::BackendKind;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "attendsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default interval between periodic syncs
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// Default number of unsynced records before the integrity check complains
pub const DEFAULT_UNSYNCED_BACKLOG_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
    /// Tenant tag; when set, only this library's rows are pulled
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default)]
    pub storage_backend: BackendKind,
    /// Overrides the platform cache directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_backlog_threshold")]
    pub unsynced_backlog_threshold: usize,
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_backlog_threshold() -> usize {
    DEFAULT_UNSYNCED_BACKLOG_THRESHOLD
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            library: None,
            storage_backend: BackendKind::default(),
            data_dir: None,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            unsynced_backlog_threshold: DEFAULT_UNSYNCED_BACKLOG_THRESHOLD,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("SUPABASE_URL") {
            self.supabase_url = Some(url);
        }
        if let Some(key) = non_empty("SUPABASE_ANON_KEY") {
            self.supabase_anon_key = Some(key);
        }
        if let Some(library) = non_empty("ATTENDSYNC_LIBRARY") {
            self.library = Some(library);
        }
    }

    /// Directory holding the offline cache, separated per library.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let base = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?
                .join(APP_NAME),
        };
        Ok(match &self.library {
            Some(library) => base.join(library),
            None => base,
        })
    }

    /// Remote URL and key, if both are configured.
    pub fn remote_credentials(&self) -> Option<(&str, &str)> {
        match (&self.supabase_url, &self.supabase_anon_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }
}
