#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Extension and execution runtime for the Vellum code editor.
//!
//! Three subsystems, composable independently or through [`Runtime`]:
//! - [`events`]: priority-ordered pub/sub with a bounded event history.
//! - [`plugins`]: dynamic plugin loading, lifecycle, and hook fan-out.
//! - [`exec`]: asynchronous child-process execution with streamed output
//!   and bounded cancellation.

pub mod config;
pub mod events;
pub mod exec;
pub mod hooks;
pub mod plugins;
pub mod runtime;

pub use config::RuntimeConfig;
pub use events::{EventBus, EventRecord, ListenerHandle};
pub use exec::{ExecError, ExecState, ExecutionEngine, ExecutionRequest};
pub use hooks::Hook;
pub use plugins::{Plugin, PluginContext, PluginError, PluginExport, PluginHost, PluginInfo};
pub use runtime::Runtime;
