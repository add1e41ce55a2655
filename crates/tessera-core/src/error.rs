//! Unified error types for the Tessera core.
//!
//! [`ErrorKind`] is the closed taxonomy every outward failure is reported
//! with.  [`DispatchError`] is the error value that travels through the
//! middleware pipeline and out of intent handlers; registry and schema
//! failures have their own enums below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Error taxonomy
// =============================================================================

/// The kind of a request-level failure.
///
/// Serialises to the exact variant name (`"ValidationError"`, …), which is the
/// `errorKind` field of a failed dispatch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad or missing parameters.
    ValidationError,
    /// Unknown intent.
    NotFoundError,
    DuplicateIntentError,
    AuthenticationError,
    AuthorizationError,
    RateLimitError,
    TimeoutError,
    CancelledError,
    MissingDependencyError,
    CyclicDependencyError,
    DependentExistsError,
    DuplicateServiceError,
    /// A middleware invoked its continuation more than once.
    MultipleNextInvocationError,
    /// Catch-all for anything else.
    InternalError,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::NotFoundError => "NotFoundError",
            Self::DuplicateIntentError => "DuplicateIntentError",
            Self::AuthenticationError => "AuthenticationError",
            Self::AuthorizationError => "AuthorizationError",
            Self::RateLimitError => "RateLimitError",
            Self::TimeoutError => "TimeoutError",
            Self::CancelledError => "CancelledError",
            Self::MissingDependencyError => "MissingDependencyError",
            Self::CyclicDependencyError => "CyclicDependencyError",
            Self::DependentExistsError => "DependentExistsError",
            Self::DuplicateServiceError => "DuplicateServiceError",
            Self::MultipleNextInvocationError => "MultipleNextInvocationError",
            Self::InternalError => "InternalError",
        }
    }

    /// Default status hint for transports that speak HTTP-like codes.
    ///
    /// The transport layer is free to ignore this and apply its own mapping.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::AuthenticationError => 401,
            Self::AuthorizationError => 403,
            Self::NotFoundError => 404,
            Self::DuplicateIntentError
            | Self::DuplicateServiceError
            | Self::DependentExistsError => 409,
            Self::RateLimitError => 429,
            Self::CancelledError => 499,
            Self::TimeoutError => 504,
            Self::MissingDependencyError
            | Self::CyclicDependencyError
            | Self::MultipleNextInvocationError
            | Self::InternalError => 500,
        }
    }

    /// Returns `true` for kinds whose message is safe to show to callers
    /// outside debug mode.
    pub fn is_client_facing(&self) -> bool {
        self.status_code() < 500
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Field errors
// =============================================================================

/// One parameter validation failure, addressed by field path.
///
/// Paths are dotted for nested objects (`address.zip`) and bracketed for
/// array items (`tags[1]`).  The root value has the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "$: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

// =============================================================================
// DispatchError
// =============================================================================

/// The error carried through middleware and intent handlers.
///
/// `details` is only surfaced to callers when the dispatcher runs in debug
/// mode, except for validation errors whose field list is always public.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl DispatchError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Builds a `ValidationError` from a non-empty list of field errors.
    pub fn validation(errors: Vec<FieldError>) -> Self {
        let message = match errors.as_slice() {
            [single] => format!("invalid parameter {single}"),
            many => format!("{} invalid parameters", many.len()),
        };
        let details = serde_json::to_value(&errors).unwrap_or(Value::Null);
        Self::new(ErrorKind::ValidationError, message).with_details(details)
    }

    pub fn not_found(intent: &str) -> Self {
        Self::new(ErrorKind::NotFoundError, format!("unknown intent '{intent}'"))
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationError, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthorizationError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimitError, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::TimeoutError,
            format!("request timed out after {after:?}"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::CancelledError, "request was cancelled")
    }

    pub fn multiple_next(middleware: &str) -> Self {
        Self::new(
            ErrorKind::MultipleNextInvocationError,
            format!("middleware '{middleware}' called next() more than once"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Wraps an arbitrary error as `InternalError`.
    pub fn from_error(err: impl std::fmt::Display) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        let kind = match &err {
            RegistryError::DuplicateIntent(_) => ErrorKind::DuplicateIntentError,
            RegistryError::IntentNotFound(_) => ErrorKind::NotFoundError,
            RegistryError::DuplicateService(_) => ErrorKind::DuplicateServiceError,
            RegistryError::InvalidSchema { .. } => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }
}

// =============================================================================
// Registry / schema errors
// =============================================================================

/// Errors raised by the intent and service registries.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("intent '{0}' is already registered")]
    DuplicateIntent(String),

    #[error("intent '{0}' not found")]
    IntentNotFound(String),

    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("intent '{intent}' has an invalid parameter schema: {source}")]
    InvalidSchema {
        intent: String,
        #[source]
        source: SchemaError,
    },
}

impl RegistryError {
    /// Returns the taxonomy kind for this error.
    pub fn kind(&self) -> ErrorKind {
        DispatchError::from(self.clone()).kind
    }
}

/// A malformed schema.  This is a programmer error, never a property of the
/// validated input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid pattern '{pattern}' at '{path}': {reason}")]
    InvalidPattern {
        path: String,
        pattern: String,
        reason: String,
    },

    #[error("invalid bounds at '{path}': {reason}")]
    InvalidBounds { path: String, reason: String },

    #[error("invalid default at '{path}': {reason}")]
    InvalidDefault { path: String, reason: String },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for middleware and handler code.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_value(ErrorKind::ValidationError).unwrap();
        assert_eq!(json, Value::String("ValidationError".into()));
        assert_eq!(ErrorKind::TimeoutError.as_str(), "TimeoutError");
        assert_eq!(ErrorKind::NotFoundError.to_string(), "NotFoundError");
    }

    #[test]
    fn test_status_hints() {
        assert_eq!(ErrorKind::ValidationError.status_code(), 400);
        assert_eq!(ErrorKind::TimeoutError.status_code(), 504);
        assert!(ErrorKind::RateLimitError.is_client_facing());
        assert!(!ErrorKind::InternalError.is_client_facing());
    }

    #[test]
    fn test_validation_error_carries_fields() {
        let err = DispatchError::validation(vec![FieldError::new("location", "is required")]);
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert_eq!(err.message, "invalid parameter location: is required");
        let details = err.details.unwrap();
        assert_eq!(details[0]["path"], "location");
    }

    #[test]
    fn test_registry_error_kind() {
        let err = RegistryError::DuplicateIntent("get_weather".into());
        assert_eq!(err.kind(), ErrorKind::DuplicateIntentError);
        assert_eq!(err.to_string(), "intent 'get_weather' is already registered");
    }
}
