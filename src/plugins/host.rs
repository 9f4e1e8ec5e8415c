//! The plugin host: registry, lifecycle, and hook dispatch.
//!
//! All registry state lives behind one host-wide mutex. `trigger_hook`
//! snapshots the callback list under that lock and dispatches outside it, so
//! callbacks may call back into the host; load/unload running concurrently
//! with a dispatch affects the next trigger, not the in-flight one.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use libloading::Library;
use serde_json::Value;
use tracing::{info, warn};

use super::loader;
use super::traits::{HookCallback, Plugin, PluginContext};
use super::PluginError;
use crate::hooks::Hook;

/// Where a registered plugin came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Compiled into the host application.
    Builtin,
    /// Loaded from a dynamic module on disk.
    File(PathBuf),
}

impl std::fmt::Display for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginSource::Builtin => f.write_str("(builtin)"),
            PluginSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Read-only view of a registered plugin, as returned by
/// [`PluginHost::list_plugins`].
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub source: PluginSource,
}

struct PluginSlot {
    name: String,
    version: String,
    enabled: bool,
    hooks: HashMap<Hook, Vec<HookCallback>>,
    // `plugin` is declared before `library`: the instance must drop before
    // the code backing it is unmapped. `library` is held only for that
    // lifetime tie, never read.
    plugin: Box<dyn Plugin>,
    #[allow(dead_code)]
    library: Option<Library>,
    source: PluginSource,
}

struct GlobalHookEntry {
    /// `None` for host-application registrations; `Some(plugin)` for entries
    /// registered during a plugin's `initialize()`, which are muted while
    /// that plugin is disabled and removed when it unloads.
    owner: Option<String>,
    callback: HookCallback,
}

struct HostInner {
    /// Registry order is dispatch order.
    plugins: Vec<PluginSlot>,
    global_hooks: HashMap<Hook, Vec<GlobalHookEntry>>,
}

/// Owns the plugin registry and fans lifecycle hooks out to callbacks.
pub struct PluginHost {
    inner: Mutex<HostInner>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HostInner {
                plugins: Vec::new(),
                global_hooks: HashMap::new(),
            }),
        }
    }

    /// Load a plugin from a dynamic module on disk.
    ///
    /// Resolves the module, calls its exported factory, runs `initialize()`,
    /// and registers the plugin enabled under its declared name. Returns the
    /// name. Duplicate names are rejected; see [`Self::load_plugin_with`].
    ///
    /// # Safety
    /// Loading a module executes arbitrary code with full host privileges.
    pub unsafe fn load_plugin(&self, path: impl AsRef<Path>) -> Result<String, PluginError> {
        unsafe { self.load_plugin_with(path, false) }
    }

    /// Like [`Self::load_plugin`], but when `replace` is set an existing
    /// plugin with the same name is cleanly unloaded first (its `shutdown()`
    /// runs; a failure there aborts the whole load).
    ///
    /// # Safety
    /// See [`Self::load_plugin`].
    pub unsafe fn load_plugin_with(
        &self,
        path: impl AsRef<Path>,
        replace: bool,
    ) -> Result<String, PluginError> {
        let path = path.as_ref();
        let module = unsafe { loader::load_module(path) }?;
        self.register_instance(
            module.plugin,
            Some(module.library),
            PluginSource::File(path.to_path_buf()),
            replace,
        )
    }

    /// Register a compiled-in plugin through the same initialize/registry
    /// path as dynamic modules.
    pub fn load_builtin(&self, plugin: Box<dyn Plugin>) -> Result<String, PluginError> {
        self.load_builtin_with(plugin, false)
    }

    /// [`Self::load_builtin`] with the replace semantics of
    /// [`Self::load_plugin_with`].
    pub fn load_builtin_with(
        &self,
        plugin: Box<dyn Plugin>,
        replace: bool,
    ) -> Result<String, PluginError> {
        self.register_instance(plugin, None, PluginSource::Builtin, replace)
    }

    fn register_instance(
        &self,
        mut plugin: Box<dyn Plugin>,
        library: Option<Library>,
        source: PluginSource,
        replace: bool,
    ) -> Result<String, PluginError> {
        let name = plugin.name().to_string();
        let version = plugin.version().to_string();

        // Resolve name collisions before running the new plugin's
        // initialize(), so a failed replacement leaves the incumbent's
        // lifecycle untouched.
        if self.is_loaded(&name) {
            if !replace {
                return Err(PluginError::Duplicate(name));
            }
            self.unload_plugin(&name)?;
        }

        let mut ctx = PluginContext::new();
        let init = std::panic::catch_unwind(AssertUnwindSafe(|| plugin.initialize(&mut ctx)));
        match init {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(plugin = %name, error = %e, "plugin initialization failed");
                return Err(PluginError::InitFailed {
                    name,
                    reason: format!("initialize() returned error: {e}"),
                });
            }
            Err(_) => {
                warn!(plugin = %name, "plugin initialization panicked");
                return Err(PluginError::InitFailed {
                    name,
                    reason: "initialize() panicked".into(),
                });
            }
        }

        let mut hooks: HashMap<Hook, Vec<HookCallback>> = HashMap::new();
        for (hook, callback) in ctx.hooks {
            hooks.entry(hook).or_default().push(callback);
        }
        let hook_count: usize = hooks.values().map(Vec::len).sum();
        let global_count = ctx.global_hooks.len();

        let mut inner = self.inner.lock().unwrap();
        // Re-check under the lock in case a concurrent load won the race.
        if inner.plugins.iter().any(|p| p.name == name) {
            return Err(PluginError::Duplicate(name));
        }
        for (hook, callback) in ctx.global_hooks {
            inner
                .global_hooks
                .entry(hook)
                .or_default()
                .push(GlobalHookEntry {
                    owner: Some(name.clone()),
                    callback,
                });
        }
        info!(
            plugin = %name,
            version = %version,
            source = %source,
            hooks = hook_count,
            global_hooks = global_count,
            "plugin registered"
        );
        inner.plugins.push(PluginSlot {
            name: name.clone(),
            version,
            enabled: true,
            hooks,
            plugin,
            library,
            source,
        });
        Ok(name)
    }

    /// Unload a plugin by name. Its `shutdown()` runs first; if that fails
    /// (error or panic) the unload is aborted and the plugin remains
    /// registered, still receiving hooks.
    pub fn unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .plugins
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| PluginError::Unknown(name.to_string()))?;

        let slot = &mut inner.plugins[idx];
        let shutdown = std::panic::catch_unwind(AssertUnwindSafe(|| slot.plugin.shutdown()));
        match shutdown {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(plugin = %name, error = %e, "plugin shutdown failed; unload aborted");
                return Err(PluginError::ShutdownFailed {
                    name: name.to_string(),
                    reason: format!("shutdown() returned error: {e}"),
                });
            }
            Err(_) => {
                warn!(plugin = %name, "plugin shutdown panicked; unload aborted");
                return Err(PluginError::ShutdownFailed {
                    name: name.to_string(),
                    reason: "shutdown() panicked".into(),
                });
            }
        }

        inner.plugins.remove(idx);
        for entries in inner.global_hooks.values_mut() {
            entries.retain(|e| e.owner.as_deref() != Some(name));
        }
        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Register a host-application callback for `hook`. Additive; no
    /// deduplication. Global callbacks run before all per-plugin callbacks.
    pub fn register_hook(
        &self,
        hook: Hook,
        callback: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .global_hooks
            .entry(hook)
            .or_default()
            .push(GlobalHookEntry {
                owner: None,
                callback: std::sync::Arc::new(callback),
            });
    }

    /// Fire `hook`: global callbacks first (registration order, skipping
    /// entries owned by disabled plugins), then each enabled plugin's
    /// callbacks in registry order.
    ///
    /// Callback failures are logged and contained; dispatch always reaches
    /// every remaining callback. Returns the successful callbacks' return
    /// values in call order.
    pub fn trigger_hook(&self, hook: Hook, args: &[Value]) -> Vec<Value> {
        let snapshot: Vec<(String, HookCallback)> = {
            let inner = self.inner.lock().unwrap();
            let enabled =
                |name: &str| inner.plugins.iter().any(|p| p.name == name && p.enabled);

            let mut callbacks = Vec::new();
            if let Some(globals) = inner.global_hooks.get(&hook) {
                for entry in globals {
                    match &entry.owner {
                        Some(owner) if !enabled(owner) => {}
                        Some(owner) => callbacks.push((owner.clone(), entry.callback.clone())),
                        None => callbacks.push(("(host)".to_string(), entry.callback.clone())),
                    }
                }
            }
            for slot in inner.plugins.iter().filter(|p| p.enabled) {
                if let Some(plugin_callbacks) = slot.hooks.get(&hook) {
                    for callback in plugin_callbacks {
                        callbacks.push((slot.name.clone(), callback.clone()));
                    }
                }
            }
            callbacks
        };

        let mut results = Vec::with_capacity(snapshot.len());
        for (owner, callback) in snapshot {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(args))) {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) => {
                    warn!(hook = %hook, plugin = %owner, error = %err, "hook callback failed");
                }
                Err(_) => {
                    warn!(hook = %hook, plugin = %owner, "hook callback panicked");
                }
            }
        }
        results
    }

    /// Mark a plugin enabled. Returns `false` for unknown names. Does not
    /// re-run `initialize()`; enable/disable is a runtime mute, not a
    /// lifecycle transition.
    pub fn enable_plugin(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Mark a plugin disabled: all its hook callbacks (including global
    /// entries it registered) are skipped until re-enabled. Returns `false`
    /// for unknown names.
    pub fn disable_plugin(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.plugins.iter_mut().find(|p| p.name == name) {
            Some(slot) => {
                slot.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Whether a plugin with this name is registered.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .plugins
            .iter()
            .any(|p| p.name == name)
    }

    /// Registered plugins in registry order.
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.inner
            .lock()
            .unwrap()
            .plugins
            .iter()
            .map(|p| PluginInfo {
                name: p.name.clone(),
                version: p.version.clone(),
                enabled: p.enabled,
                source: p.source.clone(),
            })
            .collect()
    }
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}
