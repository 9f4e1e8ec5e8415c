//! The extension contract implemented by plugins.
//!
//! A plugin is a unit of editor extension with an explicit lifecycle:
//! `initialize()` runs once when the host loads it (registering hook
//! callbacks through the provided [`PluginContext`]), `shutdown()` runs when
//! it is unloaded. Dynamic modules export a single well-known factory symbol
//! declared with [`declare_plugin!`](crate::declare_plugin); the host resolves
//! and calls that factory directly, with no module introspection.

use serde_json::Value;
use std::sync::Arc;

use crate::hooks::Hook;

/// Callback invoked when a hook fires. Failures are contained by the host and
/// never affect sibling callbacks.
pub type HookCallback = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Contract implemented by every plugin.
pub trait Plugin: Send {
    /// Unique registry key. Loading a second plugin under the same name is
    /// rejected unless the caller asks for replacement.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Called once at load time, before the plugin is registered. Hook
    /// callbacks are registered through `ctx`. Returning an error aborts the
    /// load: the plugin is never registered.
    fn initialize(&mut self, ctx: &mut PluginContext) -> anyhow::Result<()>;

    /// Called at unload time. Returning an error aborts the unload: the
    /// plugin stays registered and keeps receiving hooks.
    fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Registration surface handed to [`Plugin::initialize`].
///
/// Per-plugin hooks are muted while the plugin is disabled and removed when
/// it unloads. Global hooks registered here behave like host-level
/// registrations but stay attributed to the plugin, so they are muted and
/// removed along with it.
#[derive(Default)]
pub struct PluginContext {
    pub(crate) hooks: Vec<(Hook, HookCallback)>,
    pub(crate) global_hooks: Vec<(Hook, HookCallback)>,
}

impl PluginContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a per-plugin callback for `hook`. Additive; no deduplication.
    pub fn register_hook(
        &mut self,
        hook: Hook,
        callback: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        self.hooks.push((hook, Arc::new(callback)));
    }

    /// Register a global callback for `hook`, attributed to this plugin.
    /// Global callbacks run before all per-plugin callbacks when the hook
    /// fires.
    pub fn register_global_hook(
        &mut self,
        hook: Hook,
        callback: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        self.global_hooks.push((hook, Arc::new(callback)));
    }
}

/// Name of the factory symbol a dynamic plugin module must export.
pub const ENTRY_SYMBOL: &str = "vellum_plugin_entry";

/// Signature of the exported factory. Produced by [`declare_plugin!`];
/// resolved by the host loader.
pub type PluginEntry = extern "C" fn() -> PluginExport;

/// Transport wrapper carrying a freshly constructed plugin instance across
/// the module boundary. Host and module are compiled against the same crate,
/// so the fat-pointer layout agrees on both sides of the `extern "C"` seam.
#[repr(transparent)]
pub struct PluginExport {
    plugin: Box<dyn Plugin>,
}

impl PluginExport {
    pub fn new(plugin: Box<dyn Plugin>) -> Self {
        Self { plugin }
    }

    pub fn into_plugin(self) -> Box<dyn Plugin> {
        self.plugin
    }
}

/// Declare the well-known entry point for a dynamic plugin module.
///
/// The expression must evaluate to a type implementing [`Plugin`].
///
/// ```ignore
/// use vellum_runtime::declare_plugin;
///
/// struct WordCount;
/// impl vellum_runtime::plugins::Plugin for WordCount { /* ... */ }
///
/// declare_plugin!(WordCount);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($ctor:expr) => {
        #[unsafe(no_mangle)]
        // Not a C-facing ABI: the symbol is only resolved by a host built
        // against this same crate, so the trait-object return is fine.
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn vellum_plugin_entry() -> $crate::plugins::PluginExport {
            $crate::plugins::PluginExport::new(Box::new($ctor))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NullPlugin;

    impl Plugin for NullPlugin {
        fn name(&self) -> &str {
            "null"
        }
        fn initialize(&mut self, _ctx: &mut PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn shutdown(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_version() {
        assert_eq!(NullPlugin.version(), "0.1.0");
    }

    #[test]
    fn context_collects_registrations_in_order() {
        let mut ctx = PluginContext::new();
        ctx.register_hook(Hook::FileSave, |_| Ok(json!(1)));
        ctx.register_hook(Hook::FileSave, |_| Ok(json!(2)));
        ctx.register_global_hook(Hook::Startup, |_| Ok(json!(3)));

        assert_eq!(ctx.hooks.len(), 2);
        assert_eq!(ctx.hooks[0].0, Hook::FileSave);
        assert_eq!(ctx.global_hooks.len(), 1);
        assert_eq!((ctx.hooks[0].1)(&[]).unwrap(), json!(1));
        assert_eq!((ctx.hooks[1].1)(&[]).unwrap(), json!(2));
    }

    #[test]
    fn export_round_trips_the_instance() {
        let export = PluginExport::new(Box::new(NullPlugin));
        assert_eq!(export.into_plugin().name(), "null");
    }
}
