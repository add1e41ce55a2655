//! # Tessera Framework
//!
//! Request pipeline and plugin lifecycle for the Tessera intent server.
//!
//! This layer provides:
//! - [`AppContext`], the explicit process-wide context, and the per-request
//!   [`RequestContext`]
//! - The onion-model [`MiddlewarePipeline`] with error phase and timeout race
//! - The plugin model ([`Plugin`], [`PluginDescriptor`], hooks) and the
//!   [`PluginManager`] driving dependency-ordered install, rollback and
//!   uninstall
//! - [`RequestDispatcher`], which routes a [`DispatchRequest`] through the
//!   pipeline to the bound intent handler
//!
//! The leaf registries live in `tessera-core`; configuration, logging and
//! boot orchestration in `tessera-runtime`.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod middleware;
pub mod plugin;
pub mod response;

pub use context::{AppContext, RequestContext};
pub use dispatcher::{DispatcherConfig, IntentHandler, RequestDispatcher};
pub use error::{HookError, PipelineError, PluginError, PluginResult};
pub use manager::{PluginInfo, PluginManager, PluginState};
pub use middleware::{Endpoint, Middleware, MiddlewareDescriptor, MiddlewarePipeline, Next, Phase};
pub use plugin::{
    HealthReport, HealthStatus, HookRegistry, HookSpec, PLUGIN_FAILED, PLUGIN_INSTALLED,
    PLUGIN_UNINSTALLED, Plugin, PluginBuilder, PluginContext, PluginDescriptor,
    TESSERA_PLUGIN_API_VERSION,
};
pub use response::{DispatchRequest, DispatchResponse};
