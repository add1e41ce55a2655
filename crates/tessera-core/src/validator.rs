//! Parameter validation and coercion.
//!
//! [`ParameterValidator::validate`] walks a [`Schema`] against an input value
//! and produces a [`ValidationReport`]: the coerced value (defaults applied,
//! unknown properties handled per [`UnknownPolicy`]) together with an ordered
//! list of [`FieldError`]s.  Malformed *input* never produces an `Err`; only a
//! malformed *schema* does.
//!
//! Coerced output is a fixed point: validating it again with the same schema
//! and policy yields the same value and no errors.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Number, Value};
use tracing::trace;

use crate::error::{FieldError, SchemaError};
use crate::schema::{Schema, SchemaType, UnknownPolicy};

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// The coerced value.  Only meaningful when `errors` is empty.
    pub value: Value,
    /// Field errors in schema walk order.
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts into the coerced value or the non-empty error list.
    pub fn into_result(self) -> Result<Value, Vec<FieldError>> {
        if self.errors.is_empty() {
            Ok(self.value)
        } else {
            Err(self.errors)
        }
    }
}

/// Validates and coerces parameter bags against schemas.
///
/// Compiled `pattern` regexes are cached for the lifetime of the validator,
/// so one instance should be shared per process.
#[derive(Debug, Default)]
pub struct ParameterValidator {
    patterns: Mutex<HashMap<String, Regex>>,
}

impl ParameterValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `input` against `schema`.
    ///
    /// A `null` root is treated as an empty object when the schema describes
    /// an object, so an absent parameter bag behaves like `{}`.
    pub fn validate(
        &self,
        schema: &Schema,
        input: &Value,
        policy: UnknownPolicy,
    ) -> Result<ValidationReport, SchemaError> {
        let empty = Value::Object(Map::new());
        let input = match (input, schema.effective_type()) {
            (Value::Null, Some(SchemaType::Object)) => &empty,
            _ => input,
        };

        let mut errors = Vec::new();
        let value = self.walk(schema, input, "", policy, &mut errors)?;
        trace!(errors = errors.len(), "Parameter validation finished");
        Ok(ValidationReport { value, errors })
    }

    /// Checks a schema tree for programmer errors.
    pub fn check_schema(&self, schema: &Schema) -> Result<(), SchemaError> {
        self.check_node(schema, "")
    }

    fn check_node(&self, schema: &Schema, path: &str) -> Result<(), SchemaError> {
        if let Some(pattern) = &schema.pattern {
            self.regex(pattern, path)?;
        }
        if let (Some(min), Some(max)) = (schema.minimum, schema.maximum)
            && min > max
        {
            return Err(SchemaError::InvalidBounds {
                path: display_path(path),
                reason: format!("minimum {min} exceeds maximum {max}"),
            });
        }
        if let (Some(min), Some(max)) = (schema.min_length, schema.max_length)
            && min > max
        {
            return Err(SchemaError::InvalidBounds {
                path: display_path(path),
                reason: format!("minLength {min} exceeds maxLength {max}"),
            });
        }
        if let (Some(min), Some(max)) = (schema.min_items, schema.max_items)
            && min > max
        {
            return Err(SchemaError::InvalidBounds {
                path: display_path(path),
                reason: format!("minItems {min} exceeds maxItems {max}"),
            });
        }

        for (name, child) in &schema.properties {
            self.check_node(child, &join(path, name))?;
        }
        if let Some(items) = &schema.items {
            self.check_node(items, &format!("{path}[]"))?;
        }

        if let Some(default) = &schema.default {
            let mut errors = Vec::new();
            self.walk(schema, default, path, UnknownPolicy::Allow, &mut errors)?;
            if let Some(first) = errors.first() {
                return Err(SchemaError::InvalidDefault {
                    path: display_path(path),
                    reason: first.to_string(),
                });
            }
        }
        Ok(())
    }

    fn regex(&self, pattern: &str, path: &str) -> Result<Regex, SchemaError> {
        let mut cache = self.patterns.lock();
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern).map_err(|e| SchemaError::InvalidPattern {
            path: display_path(path),
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        cache.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    fn walk(
        &self,
        schema: &Schema,
        value: &Value,
        path: &str,
        policy: UnknownPolicy,
        errors: &mut Vec<FieldError>,
    ) -> Result<Value, SchemaError> {
        let value = match schema.effective_type() {
            Some(kind) => match coerce(kind, value) {
                Some(v) => v,
                None => {
                    errors.push(FieldError::new(
                        path,
                        format!("expected {}, got {}", kind.as_str(), type_name(value)),
                    ));
                    return Ok(value.clone());
                }
            },
            None => value.clone(),
        };

        if let Some(allowed) = &schema.enum_values
            && !allowed.contains(&value)
        {
            let listed: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.push(FieldError::new(
                path,
                format!("must be one of [{}]", listed.join(", ")),
            ));
        }

        match value {
            Value::Number(ref n) => {
                let x = n.as_f64().unwrap_or(f64::NAN);
                if let Some(min) = schema.minimum
                    && x < min
                {
                    errors.push(FieldError::new(path, format!("must be >= {min}")));
                }
                if let Some(max) = schema.maximum
                    && x > max
                {
                    errors.push(FieldError::new(path, format!("must be <= {max}")));
                }
                Ok(value)
            }
            Value::String(ref s) => {
                let len = s.chars().count();
                if let Some(min) = schema.min_length
                    && len < min
                {
                    errors.push(FieldError::new(
                        path,
                        format!("must be at least {min} characters"),
                    ));
                }
                if let Some(max) = schema.max_length
                    && len > max
                {
                    errors.push(FieldError::new(
                        path,
                        format!("must be at most {max} characters"),
                    ));
                }
                if let Some(pattern) = &schema.pattern
                    && !self.regex(pattern, path)?.is_match(s)
                {
                    errors.push(FieldError::new(path, format!("must match pattern {pattern}")));
                }
                Ok(value)
            }
            Value::Array(items) => {
                if let Some(min) = schema.min_items
                    && items.len() < min
                {
                    errors.push(FieldError::new(path, format!("must have at least {min} items")));
                }
                if let Some(max) = schema.max_items
                    && items.len() > max
                {
                    errors.push(FieldError::new(path, format!("must have at most {max} items")));
                }
                let Some(item_schema) = &schema.items else {
                    return Ok(Value::Array(items));
                };
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    out.push(self.walk(item_schema, item, &item_path, policy, errors)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) if schema.effective_type() == Some(SchemaType::Object) => {
                self.walk_object(schema, map, path, policy, errors)
            }
            other => Ok(other),
        }
    }

    fn walk_object(
        &self,
        schema: &Schema,
        map: Map<String, Value>,
        path: &str,
        policy: UnknownPolicy,
        errors: &mut Vec<FieldError>,
    ) -> Result<Value, SchemaError> {
        let mut out = Map::new();

        for (name, child) in &schema.properties {
            let child_path = join(path, name);
            let present = map
                .get(name)
                .filter(|v| !v.is_null() || child.kind == Some(SchemaType::Null));

            match present {
                Some(v) => {
                    let coerced = self.walk(child, v, &child_path, policy, errors)?;
                    out.insert(name.clone(), coerced);
                }
                None => {
                    if let Some(default) = &child.default {
                        let filled = self.walk(child, default, &child_path, policy, errors)?;
                        out.insert(name.clone(), filled);
                    } else if schema.is_required(name) {
                        errors.push(FieldError::new(child_path, "is required"));
                    }
                }
            }
        }

        let policy_here = schema.additional_properties.unwrap_or(policy);
        for (name, v) in map {
            if schema.properties.contains_key(&name) {
                continue;
            }
            match policy_here {
                UnknownPolicy::Strict => {
                    errors.push(FieldError::new(join(path, &name), "unknown property"));
                }
                UnknownPolicy::Strip => {}
                UnknownPolicy::Allow => {
                    out.insert(name, v);
                }
            }
        }

        Ok(Value::Object(out))
    }
}

/// Coerces `value` to `kind`, or returns `None` on a type mismatch.
fn coerce(kind: SchemaType, value: &Value) -> Option<Value> {
    match (kind, value) {
        (SchemaType::String, Value::String(_))
        | (SchemaType::Boolean, Value::Bool(_))
        | (SchemaType::Object, Value::Object(_))
        | (SchemaType::Array, Value::Array(_))
        | (SchemaType::Null, Value::Null)
        | (SchemaType::Number, Value::Number(_)) => Some(value.clone()),

        (SchemaType::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                Some(value.clone())
            } else {
                let f = n.as_f64()?;
                (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then(|| Value::from(f as i64))
            }
        }
        (SchemaType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (SchemaType::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }
        (SchemaType::Boolean, Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}
