//! Configuration schema definitions.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{IntentDefinition, UnknownPolicy};
use tessera_framework::DispatcherConfig;

/// Root configuration structure.
///
/// ```toml
/// [logging]
/// level = "debug"
///
/// [server]
/// request_timeout_ms = 5000
/// unknown_properties = "strict"
///
/// [[intents]]
/// name = "get_weather"
/// component = "weather-card"
/// parameters = { type = "object", required = ["location"], properties = { location = { type = "string" } } }
///
/// [plugins]
/// enabled = ["weather"]
///
/// [plugins.settings.weather]
/// api_key = "..."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TesseraConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Declarative intents registered at boot.
    #[serde(default)]
    pub intents: Vec<IntentDefinition>,

    #[serde(default)]
    pub plugins: PluginsConfig,
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Which span lifecycle transitions are logged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Required when `output = "file"`.  The file is appended to and never
    /// rotated.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line number in each line.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module overrides, e.g. `tessera_framework = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
            filters: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Dispatch settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Per-request time limit in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Expose internal error messages in responses.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub unknown_properties: UnknownPolicy,

    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_timeout_ms(),
            debug: false,
            unknown_properties: UnknownPolicy::default(),
            match_threshold: default_match_threshold(),
        }
    }
}

impl ServerConfig {
    /// Converts to the dispatcher's settings.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            timeout: Some(Duration::from_millis(self.request_timeout_ms)),
            unknown_properties: self.unknown_properties,
            debug: self.debug,
            match_threshold: self.match_threshold,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_match_threshold() -> f64 {
    0.75
}

// =============================================================================
// Plugins
// =============================================================================

/// Plugins installed at boot and their config sections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginsConfig {
    /// Names looked up in the host's descriptor table.
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Config section per plugin name.
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: TesseraConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.server.request_timeout_ms, 30000);
        assert_eq!(config.server.unknown_properties, UnknownPolicy::Strip);
        assert!(config.intents.is_empty());
        assert!(config.plugins.enabled.is_empty());
    }

    #[test]
    fn test_declarative_intent() {
        let config: TesseraConfig = serde_json::from_value(json!({
            "intents": [{
                "name": "get_weather",
                "component": "weather-card",
                "parameters": {
                    "type": "object",
                    "required": ["location"],
                    "properties": { "location": { "type": "string" } }
                }
            }]
        }))
        .unwrap();

        let intent = &config.intents[0];
        assert_eq!(intent.name, "get_weather");
        assert_eq!(intent.handler_ref(), "get_weather");
        assert!(intent.parameters.is_required("location"));
    }

    #[test]
    fn test_dispatcher_config() {
        let server = ServerConfig {
            request_timeout_ms: 250,
            unknown_properties: UnknownPolicy::Strict,
            ..Default::default()
        };
        let dispatcher = server.dispatcher_config();
        assert_eq!(dispatcher.timeout, Some(Duration::from_millis(250)));
        assert_eq!(dispatcher.unknown_properties, UnknownPolicy::Strict);
        assert_eq!(dispatcher.match_threshold, 0.75);
    }

    #[test]
    fn test_unknown_level_rejected() {
        let result: Result<LoggingConfig, _> = serde_json::from_value(json!({ "level": "loud" }));
        assert!(result.is_err());
    }
}
