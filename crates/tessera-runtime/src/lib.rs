//! Tessera Runtime - boot and shutdown orchestration for the Tessera intent server.
//!
//! This crate provides:
//! - Layered configuration (`TesseraConfig`, `ConfigLoader`) with validation
//! - Logging initialisation from configuration (`logging`)
//! - The `TesseraRuntime` that registers configured intents, installs
//!   enabled plugins and serves dispatch requests until shutdown
//!
//! ```ignore
//! use tessera_runtime::TesseraRuntime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = TesseraRuntime::new();
//!     runtime.register_plugin(WEATHER)?;
//!     runtime.bind_handler("get_weather", get_weather);
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{
    ConfigError, ConfigLoader, ConfigResult, LoggingConfig, PluginsConfig, ServerConfig,
    TesseraConfig, load_config, load_config_from_file, validate_config,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, TesseraRuntime};

// Re-export tracing for use by plugins and hosts
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for hosts and plugins.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
