//! Dynamic plugin module loading.
//!
//! A plugin module is a cdylib exporting the [`ENTRY_SYMBOL`] factory
//! (declared via `declare_plugin!`). The loader opens the library, resolves
//! the symbol, and calls the factory once to obtain the plugin instance.
//! The library handle must outlive the instance it produced; the host keeps
//! both and drops the plugin first.

use std::path::Path;

use libloading::Library;

use super::traits::{Plugin, PluginEntry, ENTRY_SYMBOL};
use super::PluginError;

/// A plugin instance paired with the library that produced it.
///
/// Field order is load-bearing: `plugin` is declared before `library` so the
/// instance is dropped before the code backing its vtable is unmapped.
pub(crate) struct LoadedModule {
    pub(crate) plugin: Box<dyn Plugin>,
    pub(crate) library: Library,
}

/// Open the module at `path` and construct its plugin via the exported
/// factory.
///
/// # Safety
/// Loading a dynamic library runs arbitrary initialization code with full
/// host privileges. The caller vouches for the module's provenance.
pub(crate) unsafe fn load_module(path: &Path) -> Result<LoadedModule, PluginError> {
    if !path.exists() {
        return Err(PluginError::NotFound(path.to_path_buf()));
    }

    let library = unsafe { Library::new(path) }.map_err(|source| PluginError::Load {
        path: path.to_path_buf(),
        source,
    })?;

    let plugin = {
        let entry = unsafe { library.get::<PluginEntry>(ENTRY_SYMBOL.as_bytes()) }.map_err(
            |source| PluginError::MissingEntry {
                path: path.to_path_buf(),
                source,
            },
        )?;
        entry().into_plugin()
    };

    Ok(LoadedModule { plugin, library })
}
