//! The request surface consumed from a transport, and its result shape.
//!
//! A transport turns a wire request into a [`DispatchRequest`] and serialises
//! the returned [`DispatchResponse`] as one of:
//!
//! ```json
//! { "success": true,  "component": "weather-card", "data": { … } }
//! { "success": false, "errorKind": "ValidationError", "message": "…", "details": [ … ] }
//! ```

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tessera_core::{DispatchError, ErrorKind};

/// An incoming intent request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub intent_name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DispatchRequest {
    pub fn new(intent_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            intent_name: intent_name.into(),
            parameters,
            metadata: Map::new(),
        }
    }

    /// Adds a metadata entry (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The outward result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResponse {
    Success {
        component: String,
        data: Value,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        details: Option<Value>,
    },
}

const GENERIC_MESSAGE: &str = "internal server error";

impl DispatchResponse {
    pub fn success(component: impl Into<String>, data: Value) -> Self {
        Self::Success {
            component: component.into(),
            data,
        }
    }

    /// Builds the caller-facing failure for `err`.
    ///
    /// Outside debug mode internal messages are replaced with a generic one
    /// and `details` are dropped, except for validation errors whose field
    /// list is part of the contract.
    pub fn failure(err: &DispatchError, debug: bool) -> Self {
        let internal = matches!(
            err.kind,
            ErrorKind::InternalError | ErrorKind::MultipleNextInvocationError
        );
        let message = if internal && !debug {
            GENERIC_MESSAGE.to_string()
        } else {
            err.message.clone()
        };
        let details = if debug || err.kind == ErrorKind::ValidationError {
            err.details.clone()
        } else {
            None
        };
        Self::Failure {
            kind: err.kind,
            message,
            details,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failure { kind, .. } => Some(*kind),
            Self::Success { .. } => None,
        }
    }

    pub fn component(&self) -> Option<&str> {
        match self {
            Self::Success { component, .. } => Some(component),
            Self::Failure { .. } => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Failure { .. } => None,
        }
    }

    /// Serialises into the wire shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for DispatchResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Self::Success { component, data } => {
                map.serialize_entry("success", &true)?;
                map.serialize_entry("component", component)?;
                map.serialize_entry("data", data)?;
            }
            Self::Failure {
                kind,
                message,
                details,
            } => {
                map.serialize_entry("success", &false)?;
                map.serialize_entry("errorKind", kind)?;
                map.serialize_entry("message", message)?;
                if let Some(details) = details {
                    map.serialize_entry("details", details)?;
                }
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::FieldError;

    #[test]
    fn test_request_wire_form() {
        let req: DispatchRequest = serde_json::from_value(json!({
            "intentName": "get_weather",
            "parameters": { "location": "NYC" },
            "metadata": { "token": "t" }
        }))
        .unwrap();
        assert_eq!(req.intent_name, "get_weather");
        assert_eq!(req.metadata["token"], "t");
    }

    #[test]
    fn test_success_shape() {
        let resp = DispatchResponse::success("weather-card", json!({ "temp": 21 }));
        assert_eq!(
            resp.to_value(),
            json!({ "success": true, "component": "weather-card", "data": { "temp": 21 } })
        );
    }

    #[test]
    fn test_internal_failure_is_sanitised() {
        let err = DispatchError::internal("db password rejected").with_details(json!("trace"));
        let public = DispatchResponse::failure(&err, false).to_value();
        assert_eq!(
            public,
            json!({
                "success": false,
                "errorKind": "InternalError",
                "message": "internal server error"
            })
        );

        let debug = DispatchResponse::failure(&err, true).to_value();
        assert_eq!(debug["message"], "db password rejected");
        assert_eq!(debug["details"], "trace");
    }

    #[test]
    fn test_validation_details_always_public() {
        let err = DispatchError::validation(vec![FieldError::new("location", "is required")]);
        let resp = DispatchResponse::failure(&err, false);
        assert_eq!(resp.error_kind(), Some(ErrorKind::ValidationError));
        assert_eq!(resp.to_value()["details"][0]["path"], "location");
    }
}
