//! Top-level runtime wiring the event bus, plugin host, and execution
//! engine together.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::events::EventBus;
use crate::exec::{ExecError, ExecutionEngine, ExecutionRequest};
use crate::hooks::Hook;
use crate::plugins::PluginHost;

/// Owns the three runtime subsystems and drives their shared lifecycle.
///
/// Construction is cheap and infallible; plugin paths from the configuration
/// are loaded eagerly, with per-path failures logged and skipped.
pub struct Runtime {
    events: Arc<EventBus>,
    plugins: Arc<PluginHost>,
    exec: ExecutionEngine,
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_history_capacity));
        let plugins = Arc::new(PluginHost::new());
        let exec = ExecutionEngine::with_grace(config.graceful_timeout());

        // Completion of any execution fans out to plugins and listeners.
        {
            let plugins = plugins.clone();
            let events = events.clone();
            exec.on_finished(move |code| {
                let arg = json!(code);
                events.emit("execution.finished", std::slice::from_ref(&arg));
                plugins.trigger_hook(Hook::AfterCodeExecution, &[arg]);
            });
        }

        let runtime = Self {
            events,
            plugins,
            exec,
        };
        for path in &config.plugin_paths {
            runtime.load_plugin_path(path);
        }
        runtime
    }

    fn load_plugin_path(&self, path: &Path) {
        // SAFETY: plugin libraries are trusted code the user configured;
        // loading arbitrary native code is inherently unsound to verify.
        match unsafe { self.plugins.load_plugin(path) } {
            Ok(name) => info!(plugin = %name, path = %path.display(), "plugin loaded"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load plugin"),
        }
    }

    /// Fire the startup hook across all loaded plugins and record the event.
    pub fn startup(&self) {
        info!("runtime starting");
        self.plugins.trigger_hook(Hook::Startup, &[]);
        self.events.emit("runtime.startup", &[]);
    }

    /// Fire the shutdown hook, stop any in-flight execution, and unload all
    /// plugins. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        self.plugins.trigger_hook(Hook::Shutdown, &[]);
        self.events.emit("runtime.shutdown", &[]);
        self.exec.stop().await;

        for info in self.plugins.list_plugins() {
            if let Err(e) = self.plugins.unload_plugin(&info.name) {
                warn!(plugin = %info.name, error = %e, "failed to unload plugin");
            }
        }
    }

    /// Notify plugins and event listeners that a file was saved.
    pub fn file_saved(&self, path: &Path) {
        let arg = json!(path.display().to_string());
        self.plugins
            .trigger_hook(Hook::FileSave, std::slice::from_ref(&arg));
        self.events.emit("file.saved", &[arg]);
    }

    /// Notify plugins and event listeners that a file was opened.
    pub fn file_opened(&self, path: &Path) {
        let arg = json!(path.display().to_string());
        self.plugins
            .trigger_hook(Hook::FileOpen, std::slice::from_ref(&arg));
        self.events.emit("file.opened", &[arg]);
    }

    /// Run a program through the execution engine, bracketing it with the
    /// before/after execution hooks. The before hook fires on this thread
    /// ahead of the spawn; the after hook fires from the engine's worker
    /// when the process completes.
    pub fn execute_program(&self, request: ExecutionRequest) -> Result<(), ExecError> {
        let arg = json!(request.target().display().to_string());
        self.plugins
            .trigger_hook(Hook::BeforeCodeExecution, std::slice::from_ref(&arg));
        self.events.emit("execution.started", &[arg]);
        self.exec.execute(request)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    pub fn exec(&self) -> &ExecutionEngine {
        &self.exec
    }
}
