//! Lifecycle hook points exposed to extensions.
//!
//! Hooks form a fixed, closed set: the host application fires them at defined
//! points (startup, file save, before/after running user code, ...) and the
//! [`PluginHost`](crate::plugins::PluginHost) fans each one out to registered
//! callbacks. New hook points are added here, never created at runtime.

use serde::{Deserialize, Serialize};

/// A lifecycle integration point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Startup,
    Shutdown,
    ProjectOpen,
    ProjectClose,
    FileSave,
    FileOpen,
    ModelLoaded,
    ModelUnloaded,
    GithubConnected,
    GithubDisconnected,
    BeforeCodeExecution,
    AfterCodeExecution,
}

impl Hook {
    /// Every hook point, in declaration order. Used by diagnostics surfaces
    /// that enumerate registrations.
    pub const ALL: &'static [Hook] = &[
        Hook::Startup,
        Hook::Shutdown,
        Hook::ProjectOpen,
        Hook::ProjectClose,
        Hook::FileSave,
        Hook::FileOpen,
        Hook::ModelLoaded,
        Hook::ModelUnloaded,
        Hook::GithubConnected,
        Hook::GithubDisconnected,
        Hook::BeforeCodeExecution,
        Hook::AfterCodeExecution,
    ];

    /// Stable string form, matching the serialized (snake_case) name.
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Startup => "startup",
            Hook::Shutdown => "shutdown",
            Hook::ProjectOpen => "project_open",
            Hook::ProjectClose => "project_close",
            Hook::FileSave => "file_save",
            Hook::FileOpen => "file_open",
            Hook::ModelLoaded => "model_loaded",
            Hook::ModelUnloaded => "model_unloaded",
            Hook::GithubConnected => "github_connected",
            Hook::GithubDisconnected => "github_disconnected",
            Hook::BeforeCodeExecution => "before_code_execution",
            Hook::AfterCodeExecution => "after_code_execution",
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_matches_serde_form() {
        for hook in Hook::ALL {
            let json = serde_json::to_string(hook).unwrap();
            assert_eq!(json, format!("\"{}\"", hook.as_str()));
        }
    }

    #[test]
    fn all_table_is_exhaustive() {
        // The match in as_str cannot miss a variant; this guards the table.
        assert_eq!(Hook::ALL.len(), 12);
    }

    #[test]
    fn round_trips_through_serde() {
        for hook in Hook::ALL {
            let json = serde_json::to_string(hook).unwrap();
            let back: Hook = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *hook);
        }
    }
}
