//! Plugin model for the Tessera framework.
//!
//! # Architecture
//!
//! A [`Plugin`] is a capability record: a name, a version, the names of the
//! plugins it depends on, hook handlers, and optional `install`, `start`,
//! `stop` and `health` callbacks.  The [`PluginManager`] drives it through
//! its lifecycle and rolls it back on failure.
//!
//! A [`PluginDescriptor`] is the *static, `Copy` handle* to a plugin: a name
//! and a factory function pointer.  Hosts supply a table of descriptors and
//! the manager calls [`PluginDescriptor::instantiate`] to create fresh
//! instances, so no module is ever loaded by path.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use tessera::prelude::*;
//!
//! fn audit() -> Plugin {
//!     Plugin::builder("audit")
//!         .version("1.0.0")
//!         .depends_on("storage")
//!         .on_install(|ctx| async move {
//!             let store = ctx.services().get::<Store>("storage.kv");
//!             ctx.subscribe(PLUGIN_INSTALLED, 0, move |event| {
//!                 let store = store.clone();
//!                 async move { record(store, &event.payload).await }
//!             });
//!             Ok(())
//!         })
//!         .build()
//! }
//!
//! pub static AUDIT: PluginDescriptor = PluginDescriptor::new("audit", audit);
//! ```
//!
//! # Configuration
//!
//! Each plugin's config section is handed to it through
//! [`PluginContext::get_config`].  With the runtime, sections live under
//! `plugins.settings.<name>`:
//!
//! ```toml
//! [plugins]
//! enabled = ["audit"]
//!
//! [plugins.settings.audit]
//! retention_days = 30
//! ```
//!
//! [`PluginManager`]: crate::manager::PluginManager

// ─── Submodules ──────────────────────────────────────────────────────────────
pub mod context;
pub mod core;
pub mod descriptor;
pub mod hooks;

// ─── Re-exports from submodules ──────────────────────────────────────────────
pub use context::PluginContext;
pub use core::{
    HealthFn, HealthReport, HealthStatus, InstallFn, LifecycleFn, Plugin, PluginBuilder,
};
pub use descriptor::{PluginDescriptor, TESSERA_PLUGIN_API_VERSION};
pub use hooks::{HookHandler, HookRegistry, HookSpec};

// ─── Lifecycle event channels ────────────────────────────────────────────────

/// Published with `{ "name": … }` after a plugin reaches `Running`.
pub const PLUGIN_INSTALLED: &str = "plugin:installed";
/// Published with `{ "name": … }` after a plugin reaches `Stopped`.
pub const PLUGIN_UNINSTALLED: &str = "plugin:uninstalled";
/// Published with `{ "name": …, "error": … }` after a plugin moves to `Failed`.
pub const PLUGIN_FAILED: &str = "plugin:failed";
