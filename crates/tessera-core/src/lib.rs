//! # Tessera Core
//!
//! Leaf components of the Tessera intent server.
//!
//! - **Parameter validation**: a JSON-Schema-like [`Schema`] model and the
//!   [`ParameterValidator`] that checks and coerces parameter bags against it.
//! - **Intent registry**: [`IntentRegistry`] maps intent names to immutable
//!   [`IntentDefinition`]s; an optional [`IntentMatcher`] can be consulted
//!   before exact lookup.
//! - **Event bus**: [`EventBus`], an in-process, best-effort publish/subscribe
//!   channel with per-owner subscription cleanup.
//! - **Service registry**: [`ServiceRegistry`], a named directory of shared
//!   instances and factories.
//! - **Errors**: the [`ErrorKind`] taxonomy and [`DispatchError`].
//!
//! Everything here is runtime-agnostic; the request pipeline and plugin
//! lifecycle live in `tessera-framework`.

pub mod error;
pub mod event;
pub mod intent;
pub mod schema;
pub mod service;
pub mod validator;

pub use error::{
    DispatchError, DispatchResult, ErrorKind, FieldError, RegistryError, RegistryResult,
    SchemaError,
};
pub use event::{Event, EventBus, EventHandler, SubscribeOptions, SubscriptionId};
pub use intent::{AliasMatcher, IntentDefinition, IntentMatch, IntentMatcher, IntentRegistry};
pub use schema::{Schema, SchemaType, UnknownPolicy};
pub use service::{ServiceArc, ServiceMode, ServiceOptions, ServiceRegistry};
pub use validator::{ParameterValidator, ValidationReport};

/// Re-exported so callers can name handler error types without depending on
/// `tower` directly.
pub use tower::BoxError;
