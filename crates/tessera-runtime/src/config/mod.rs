//! Configuration module for the Tessera runtime.
//!
//! This module provides figment-based configuration loading and validation
//! for logging, dispatch settings, declarative intents and plugins.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LoggingConfig, PluginsConfig, ServerConfig, SpanEventConfig,
    TesseraConfig,
};
pub use validation::validate_config;
