//! Runtime configuration, loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_event_history_capacity() -> usize {
    crate::events::DEFAULT_HISTORY_CAPACITY
}

fn default_graceful_timeout_secs() -> u64 {
    crate::exec::DEFAULT_GRACE_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Bound on retained event records; oldest entries are evicted first.
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,

    /// Seconds to wait for a child process to exit gracefully before it is
    /// forcefully killed.
    #[serde(default = "default_graceful_timeout_secs")]
    pub graceful_timeout_secs: u64,

    /// Plugin libraries to load at startup. A path that fails to load is
    /// logged and skipped; it never aborts startup.
    #[serde(default)]
    pub plugin_paths: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_history_capacity: default_event_history_capacity(),
            graceful_timeout_secs: default_graceful_timeout_secs(),
            plugin_paths: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }
}
