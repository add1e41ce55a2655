//! Parameter schema model.
//!
//! A [`Schema`] is a JSON-Schema-like tree describing an intent's parameter
//! bag.  It deserialises directly from the `parameters` object of a
//! declarative intent definition:
//!
//! ```json
//! {
//!   "type": "object",
//!   "required": ["location"],
//!   "properties": {
//!     "location": { "type": "string", "minLength": 1 },
//!     "units":    { "type": "string", "enum": ["metric", "imperial"], "default": "metric" },
//!     "days":     { "type": "integer", "minimum": 1, "maximum": 14, "required": false }
//!   },
//!   "additionalProperties": false
//! }
//! ```
//!
//! `required` may be given either as the object-level list of property
//! names (JSON Schema style) or as a boolean on the property itself.
//! `additionalProperties` accepts `true`/`false` or a policy name
//! (`"strict"`, `"strip"`, `"allow"`) and overrides the per-call
//! [`UnknownPolicy`] for that object only.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::SchemaError;
use crate::validator::ParameterValidator;

/// Primitive type tag of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }
}

/// What to do with properties an object schema does not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownPolicy {
    /// Report each unknown property as a field error.
    Strict,
    /// Drop unknown properties silently.
    #[default]
    Strip,
    /// Pass unknown properties through unchanged.
    Allow,
}

/// The two accepted spellings of `required`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Required {
    /// Object-level list of required property names.
    Fields(Vec<String>),
    /// Property-level flag.
    Flag(bool),
}

impl Default for Required {
    fn default() -> Self {
        Self::Fields(Vec::new())
    }
}

impl Required {
    fn is_empty(&self) -> bool {
        matches!(self, Self::Fields(f) if f.is_empty()) || matches!(self, Self::Flag(false))
    }
}

/// A node of the parameter schema tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SchemaType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,

    #[serde(default, skip_serializing_if = "Required::is_empty")]
    pub required: Required,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(
        default,
        deserialize_with = "deserialize_policy",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<UnknownPolicy>,
}

fn deserialize_policy<'de, D>(deserializer: D) -> Result<Option<UnknownPolicy>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Flag(bool),
        Policy(UnknownPolicy),
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        None => None,
        Some(Repr::Flag(true)) => Some(UnknownPolicy::Allow),
        Some(Repr::Flag(false)) => Some(UnknownPolicy::Strict),
        Some(Repr::Policy(p)) => Some(p),
    })
}

impl Schema {
    fn typed(kind: SchemaType) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// An untyped schema accepting any value.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn object() -> Self {
        Self::typed(SchemaType::Object)
    }

    pub fn string() -> Self {
        Self::typed(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::typed(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::typed(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::typed(SchemaType::Boolean)
    }

    pub fn array(items: Schema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed(SchemaType::Array)
        }
    }

    /// Adds an optional property.
    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Adds a property and marks it required.
    pub fn required_property(self, name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        self.property(name.clone(), schema).require(name)
    }

    /// Marks an already declared (or future) property as required.
    pub fn require(mut self, name: impl Into<String>) -> Self {
        match &mut self.required {
            Required::Fields(fields) => fields.push(name.into()),
            Required::Flag(_) => self.required = Required::Fields(vec![name.into()]),
        }
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.enum_values = Some(values.into_iter().collect());
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.minimum = min;
        self.maximum = max;
        self
    }

    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn items_between(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_items = min;
        self.max_items = max;
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn unknown_properties(mut self, policy: UnknownPolicy) -> Self {
        self.additional_properties = Some(policy);
        self
    }

    /// The type this node validates against.
    ///
    /// An untyped node with declared properties is treated as an object.
    pub fn effective_type(&self) -> Option<SchemaType> {
        self.kind.or_else(|| {
            (!self.properties.is_empty()).then_some(SchemaType::Object)
        })
    }

    /// Returns `true` when the child property `name` must be present.
    pub fn is_required(&self, name: &str) -> bool {
        let listed = matches!(&self.required, Required::Fields(f) if f.iter().any(|n| n == name));
        let flagged = self
            .properties
            .get(name)
            .is_some_and(|p| matches!(p.required, Required::Flag(true)));
        listed || flagged
    }

    /// Checks that the schema itself is well formed: patterns compile,
    /// bounds are ordered and defaults satisfy their own node.
    pub fn check(&self) -> Result<(), SchemaError> {
        ParameterValidator::new().check_schema(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_object_level_required() {
        let schema: Schema = serde_json::from_value(json!({
            "type": "object",
            "required": ["location"],
            "properties": { "location": { "type": "string" } }
        }))
        .unwrap();

        assert_eq!(schema.kind, Some(SchemaType::Object));
        assert!(schema.is_required("location"));
        assert!(!schema.is_required("units"));
    }

    #[test]
    fn test_deserialize_property_level_required() {
        let schema: Schema = serde_json::from_value(json!({
            "properties": {
                "zip": { "type": "string", "required": true, "pattern": "^[0-9]{5}$" }
            }
        }))
        .unwrap();

        assert_eq!(schema.effective_type(), Some(SchemaType::Object));
        assert!(schema.is_required("zip"));
        assert_eq!(schema.properties["zip"].pattern.as_deref(), Some("^[0-9]{5}$"));
    }

    #[test]
    fn test_additional_properties_forms() {
        let strict: Schema =
            serde_json::from_value(json!({ "type": "object", "additionalProperties": false }))
                .unwrap();
        assert_eq!(strict.additional_properties, Some(UnknownPolicy::Strict));

        let allow: Schema =
            serde_json::from_value(json!({ "type": "object", "additionalProperties": "allow" }))
                .unwrap();
        assert_eq!(allow.additional_properties, Some(UnknownPolicy::Allow));
    }

    #[test]
    fn test_builder_matches_json_form() {
        let built = Schema::object()
            .required_property("location", Schema::string())
            .property("days", Schema::integer().range(Some(1.0), Some(14.0)));
        let parsed: Schema = serde_json::from_value(json!({
            "type": "object",
            "required": ["location"],
            "properties": {
                "location": { "type": "string" },
                "days": { "type": "integer", "minimum": 1.0, "maximum": 14.0 }
            }
        }))
        .unwrap();
        assert_eq!(built, parsed);
    }
}
