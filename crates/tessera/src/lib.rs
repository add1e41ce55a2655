//! # Tessera
//!
//! An intent-routing server core: callers name an *intent* and pass a
//! parameter bag; Tessera validates the parameters against the intent's
//! schema, runs the request through an ordered middleware pipeline, invokes
//! the bound handler and answers with the component that renders the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────── pipeline ─────────────────────────────┐
//! │ Transport │──▶│ global ▶ request ▶ [resolve ▶ validate ▶ handler] ▶ response ◀─── │──▶ DispatchResponse
//! └───────────┘   └─────────────────────────────── error middleware on failure ───────┘
//!                         │                          │
//!                 IntentRegistry            ServiceRegistry / EventBus ◀── Plugins
//! ```
//!
//! - **Core** (`tessera-core`): schema validation, intent registry, event bus,
//!   service registry, error taxonomy
//! - **Framework** (`tessera-framework`): request context, middleware
//!   pipeline, plugin manager, dispatcher
//! - **Runtime** (`tessera-runtime`): configuration, logging, boot and
//!   shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera::prelude::*;
//!
//! async fn get_weather(ctx: Arc<RequestContext>) -> DispatchResult<Value> {
//!     let location = ctx.parameters()["location"].clone();
//!     Ok(json!({ "location": location, "temperature": 21 }))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = TesseraRuntime::new();
//!     runtime.bind_handler("get_weather", get_weather);
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use tessera_core as core;
pub use tessera_framework as framework;
pub use tessera_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use tessera_runtime::{RuntimeError, TesseraConfig, TesseraRuntime};

    // Plugin system
    pub use tessera_framework::{
        HealthReport, HealthStatus, HookSpec, PLUGIN_FAILED, PLUGIN_INSTALLED, PLUGIN_UNINSTALLED,
        Plugin, PluginContext, PluginDescriptor, PluginError, PluginState,
    };

    // Request pipeline
    pub use tessera_framework::{
        DispatchRequest, DispatchResponse, MiddlewareDescriptor, Next, Phase, RequestContext,
        RequestDispatcher,
    };

    // Intents, validation and shared registries
    pub use tessera_core::{
        AliasMatcher, BoxError, DispatchError, DispatchResult, ErrorKind, Event, EventBus,
        IntentDefinition, IntentMatch, IntentMatcher, Schema, ServiceRegistry, UnknownPolicy,
    };

    pub use serde_json::{Value, json};
    pub use std::sync::Arc;
}
