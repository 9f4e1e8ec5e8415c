//! Plugin system: dynamic loading, lifecycle, and hook fan-out.

mod host;
mod loader;
mod traits;

pub use host::{PluginHost, PluginInfo, PluginSource};
pub use traits::{HookCallback, Plugin, PluginContext, PluginEntry, PluginExport, ENTRY_SYMBOL};

use std::path::PathBuf;
use thiserror::Error;

/// Typed error for plugin lifecycle operations.
///
/// `NotFound` / `Load` / `MissingEntry` cover module resolution failures;
/// `InitFailed` / `ShutdownFailed` cover contract failures. All are expected,
/// recoverable conditions reported to the direct caller; a failed load
/// simply never registers the plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No module exists at the given path.
    #[error("plugin module not found: {0}")]
    NotFound(PathBuf),

    /// The module exists but could not be opened as a dynamic library.
    #[error("failed to load plugin module {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// The module does not export the well-known plugin entry symbol.
    #[error("module {path} does not export a plugin entry point: {source}")]
    MissingEntry {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// The plugin's `initialize()` returned an error or panicked; it was
    /// never registered.
    #[error("plugin '{name}' failed to initialize: {reason}")]
    InitFailed { name: String, reason: String },

    /// A plugin with this name is already registered.
    #[error("plugin '{0}' is already loaded")]
    Duplicate(String),

    /// No plugin with this name is registered.
    #[error("no plugin named '{0}'")]
    Unknown(String),

    /// The plugin's `shutdown()` returned an error or panicked; the unload
    /// was aborted and the plugin remains registered.
    #[error("plugin '{name}' failed to shut down: {reason}")]
    ShutdownFailed { name: String, reason: String },
}
