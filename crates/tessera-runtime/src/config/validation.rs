//! Configuration validation utilities.

use std::collections::HashSet;

use tessera_core::IntentDefinition;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, PluginsConfig, ServerConfig, TesseraConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &TesseraConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_server_config(&config.server)?;
    validate_intents(&config.intents)?;
    validate_plugins_config(&config.plugins)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }

    if logging.filters.keys().any(|module| module.trim().is_empty()) {
        return Err(ConfigError::validation("Log filter module cannot be empty"));
    }

    Ok(())
}

fn validate_server_config(server: &ServerConfig) -> ConfigResult<()> {
    if server.request_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "Request timeout must be greater than 0",
        ));
    }

    // NaN fails both comparisons.
    if !(0.0..=1.0).contains(&server.match_threshold) {
        return Err(ConfigError::validation(format!(
            "Match threshold must be within [0, 1], got {}",
            server.match_threshold
        )));
    }

    Ok(())
}

fn validate_intents(intents: &[IntentDefinition]) -> ConfigResult<()> {
    let mut seen = HashSet::new();

    for intent in intents {
        if intent.name.trim().is_empty() {
            return Err(ConfigError::missing_field("intents.name"));
        }

        if !seen.insert(intent.name.as_str()) {
            return Err(ConfigError::DuplicateIntent(intent.name.clone()));
        }

        intent
            .parameters
            .check()
            .map_err(|e| ConfigError::InvalidSchema {
                intent: intent.name.clone(),
                reason: e.to_string(),
            })?;
    }

    Ok(())
}

fn validate_plugins_config(plugins: &PluginsConfig) -> ConfigResult<()> {
    let mut seen = HashSet::new();

    for name in &plugins.enabled {
        if name.trim().is_empty() {
            return Err(ConfigError::validation("Enabled plugin name cannot be empty"));
        }
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::DuplicatePlugin(name.clone()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Schema;

    #[test]
    fn test_validate_empty_config() {
        let config = TesseraConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_file_output_without_path() {
        let mut config = TesseraConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_validate_server_bounds() {
        let mut config = TesseraConfig::default();
        config.server.request_timeout_ms = 0;
        assert!(validate_config(&config).is_err());

        let mut config = TesseraConfig::default();
        config.server.match_threshold = 1.5;
        assert!(validate_config(&config).is_err());

        config.server.match_threshold = f64::NAN;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_duplicate_intent() {
        let intent = IntentDefinition::new("get_weather", "weather-card");
        let config = TesseraConfig {
            intents: vec![intent.clone(), intent],
            ..Default::default()
        };

        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::DuplicateIntent(name)) if name == "get_weather"));
    }

    #[test]
    fn test_validate_malformed_intent_schema() {
        let intent = IntentDefinition::new("search", "results").with_parameters(
            Schema::object().property("q", Schema::string().pattern("(unclosed")),
        );
        let config = TesseraConfig {
            intents: vec![intent],
            ..Default::default()
        };

        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidSchema { intent, .. }) if intent == "search"
        ));
    }

    #[test]
    fn test_validate_duplicate_plugin() {
        let mut config = TesseraConfig::default();
        config.plugins.enabled = vec!["weather".into(), "weather".into()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::DuplicatePlugin(_))
        ));
    }
}
