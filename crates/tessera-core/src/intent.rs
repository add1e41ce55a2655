//! Intent definitions and the intent registry.
//!
//! An intent is a named, schema-validated request type mapped to a handler
//! and a UI component.  Definitions are immutable once registered; the
//! registry hands out `Arc<IntentDefinition>` snapshots so in-flight requests
//! keep a consistent view even if the definition is unregistered meanwhile.
//!
//! Resolution is exact-name lookup.  An optional [`IntentMatcher`] may be
//! consulted by the dispatcher first; see [`AliasMatcher`] for the bundled
//! implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::schema::Schema;

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A registered intent.
///
/// Deserialises from the declarative form used in configuration files:
///
/// ```json
/// {
///   "name": "get_weather",
///   "description": "Current conditions for a location",
///   "parameters": { "type": "object", "required": ["location"],
///                   "properties": { "location": { "type": "string" } } },
///   "component": "weather-card",
///   "version": "1.0.0"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentDefinition {
    /// Unique key.
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Schema of the parameter bag.
    #[serde(default = "Schema::object")]
    pub parameters: Schema,

    /// Component descriptor name the result is rendered with.
    #[serde(default)]
    pub component: String,

    /// Handler reference resolved at call time.  Defaults to [`name`](Self::name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    #[serde(default)]
    pub crawlable: bool,

    #[serde(default)]
    pub deprecated: bool,
}

impl IntentDefinition {
    /// Creates a definition with an empty object schema.
    pub fn new(name: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            parameters: Schema::object(),
            component: component.into(),
            handler: None,
            crawlable: false,
            deprecated: false,
        }
    }

    pub fn with_parameters(mut self, schema: Schema) -> Self {
        self.parameters = schema;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn crawlable(mut self, crawlable: bool) -> Self {
        self.crawlable = crawlable;
        self
    }

    pub fn deprecated(mut self, deprecated: bool) -> Self {
        self.deprecated = deprecated;
        self
    }

    /// The handler reference used to look up the bound handler.
    pub fn handler_ref(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }
}

// =============================================================================
// IntentRegistry
// =============================================================================

/// Process-wide directory of intent definitions.
#[derive(Debug, Default)]
pub struct IntentRegistry {
    intents: RwLock<HashMap<String, Arc<IntentDefinition>>>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition.
    ///
    /// Fails with [`RegistryError::DuplicateIntent`] if the name is taken (the
    /// existing definition is untouched) and with
    /// [`RegistryError::InvalidSchema`] if the parameter schema is malformed.
    pub fn register(&self, definition: IntentDefinition) -> RegistryResult<Arc<IntentDefinition>> {
        definition
            .parameters
            .check()
            .map_err(|source| RegistryError::InvalidSchema {
                intent: definition.name.clone(),
                source,
            })?;

        let mut intents = self.intents.write();
        if intents.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateIntent(definition.name));
        }
        let name = definition.name.clone();
        let definition = Arc::new(definition);
        intents.insert(name.clone(), Arc::clone(&definition));
        info!(intent = %name, version = %definition.version, "Intent registered");
        Ok(definition)
    }

    /// Resolves an intent by exact name.
    pub fn resolve(&self, name: &str) -> RegistryResult<Arc<IntentDefinition>> {
        self.intents
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::IntentNotFound(name.to_string()))
    }

    /// Removes a definition, returning it if it was present.
    ///
    /// Requests that already resolved the intent keep their snapshot.
    pub fn unregister(&self, name: &str) -> Option<Arc<IntentDefinition>> {
        let removed = self.intents.write().remove(name);
        if removed.is_some() {
            debug!(intent = %name, "Intent unregistered");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.intents.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.intents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.read().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.intents.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of every definition, sorted by name.
    pub fn list(&self) -> Vec<Arc<IntentDefinition>> {
        let mut all: Vec<_> = self.intents.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Definitions that are crawlable and not deprecated, sorted by name.
    pub fn crawlable(&self) -> Vec<Arc<IntentDefinition>> {
        self.list()
            .into_iter()
            .filter(|d| d.crawlable && !d.deprecated)
            .collect()
    }
}

// =============================================================================
// IntentMatcher
// =============================================================================

/// A candidate produced by an [`IntentMatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct IntentMatch {
    /// Name of a registered intent.
    pub name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Optional strategy consulted before exact lookup.
///
/// The dispatcher accepts a match only when its confidence reaches the
/// configured threshold and the named intent is registered; otherwise it
/// falls back to exact-name resolution of the requested name.
#[async_trait]
pub trait IntentMatcher: Send + Sync {
    async fn match_intent(
        &self,
        requested: &str,
        parameters: &Value,
        candidates: &[Arc<IntentDefinition>],
    ) -> Option<IntentMatch>;
}

/// Maps alternate names onto canonical intents with full confidence.
#[derive(Debug, Clone, Default)]
pub struct AliasMatcher {
    aliases: HashMap<String, String>,
}

impl AliasMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an alias (builder pattern).  Aliases are case-insensitive.
    pub fn alias(mut self, alias: impl AsRef<str>, intent: impl Into<String>) -> Self {
        self.aliases
            .insert(alias.as_ref().to_lowercase(), intent.into());
        self
    }
}

#[async_trait]
impl IntentMatcher for AliasMatcher {
    async fn match_intent(
        &self,
        requested: &str,
        _parameters: &Value,
        candidates: &[Arc<IntentDefinition>],
    ) -> Option<IntentMatch> {
        let target = self.aliases.get(&requested.to_lowercase())?;
        candidates
            .iter()
            .find(|d| &d.name == target)
            .map(|d| IntentMatch {
                name: d.name.clone(),
                confidence: 1.0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn weather() -> IntentDefinition {
        IntentDefinition::new("get_weather", "weather-card")
            .with_parameters(Schema::object().required_property("location", Schema::string()))
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = IntentRegistry::new();
        registry.register(weather().with_version("1.0.0")).unwrap();

        let err = registry
            .register(weather().with_version("2.0.0"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateIntentError);

        let resolved = registry.resolve("get_weather").unwrap();
        assert_eq!(resolved.version, "1.0.0");
    }

    #[test]
    fn test_resolve_unknown_and_unregister() {
        let registry = IntentRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(RegistryError::IntentNotFound(name)) if name == "nope"
        ));

        registry.register(weather()).unwrap();
        let held = registry.resolve("get_weather").unwrap();
        assert!(registry.unregister("get_weather").is_some());
        assert!(registry.unregister("get_weather").is_none());
        assert!(registry.resolve("get_weather").is_err());
        assert_eq!(held.component, "weather-card");
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        let registry = IntentRegistry::new();
        let bad = IntentDefinition::new("bad", "x")
            .with_parameters(Schema::object().property("p", Schema::string().pattern("[")));
        assert!(matches!(
            registry.register(bad),
            Err(RegistryError::InvalidSchema { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_declarative_form_and_crawlable() {
        let def: IntentDefinition = serde_json::from_value(json!({
            "name": "search_products",
            "description": "Product search",
            "parameters": { "type": "object", "properties": { "q": { "type": "string" } } },
            "component": "product-grid",
            "version": "2.1.0",
            "crawlable": true
        }))
        .unwrap();
        assert_eq!(def.handler_ref(), "search_products");

        let registry = IntentRegistry::new();
        registry.register(def).unwrap();
        registry.register(weather().deprecated(true).crawlable(true)).unwrap();
        registry
            .register(IntentDefinition::new("admin_panel", "admin"))
            .unwrap();

        let crawlable: Vec<String> = registry
            .crawlable()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(crawlable, vec!["search_products"]);
        assert_eq!(
            registry.names(),
            vec!["admin_panel", "get_weather", "search_products"]
        );
    }

    #[test]
    fn test_alias_matcher() {
        let registry = IntentRegistry::new();
        registry.register(weather()).unwrap();
        let matcher = AliasMatcher::new().alias("Forecast", "get_weather");
        let candidates = registry.list();

        let hit = tokio_test::block_on(matcher.match_intent("forecast", &json!({}), &candidates))
            .unwrap();
        assert_eq!(hit.name, "get_weather");
        assert_eq!(hit.confidence, 1.0);

        let miss = tokio_test::block_on(matcher.match_intent("unknown", &json!({}), &candidates));
        assert!(miss.is_none());
    }
}
