//! Process-wide and per-request context.
//!
//! - [`AppContext`]: the explicit process-wide object built once at boot.
//!   It owns the intent registry, service registry, event bus and
//!   parameter validator, and is passed by reference to the dispatcher,
//!   the plugin manager and every request.
//!
//! - [`RequestContext`]: created per dispatched request and handed to every
//!   middleware stage and to the intent handler.  It carries the raw and
//!   validated parameters, the resolved intent, the response slot, the
//!   cancellation token and typed per-request state.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tessera_core::{
    DispatchError, DispatchResult, ErrorKind, EventBus, IntentDefinition, IntentRegistry,
    ParameterValidator, ServiceRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::response::{DispatchRequest, DispatchResponse};

// =============================================================================
// AppContext
// =============================================================================

/// Shared registries, constructed once at boot and torn down at shutdown.
#[derive(Debug, Clone)]
pub struct AppContext {
    intents: Arc<IntentRegistry>,
    services: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    validator: Arc<ParameterValidator>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    /// Creates empty registries sharing one event bus.
    pub fn new() -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            intents: Arc::new(IntentRegistry::new()),
            services: Arc::new(ServiceRegistry::new(Arc::clone(&events))),
            events,
            validator: Arc::new(ParameterValidator::new()),
        }
    }

    pub fn intents(&self) -> &Arc<IntentRegistry> {
        &self.intents
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn validator(&self) -> &Arc<ParameterValidator> {
        &self.validator
    }
}

// =============================================================================
// RequestContext
// =============================================================================

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Per-request state shared by the middleware chain and the handler.
pub struct RequestContext {
    id: u64,
    started: Instant,
    debug: bool,
    app: Arc<AppContext>,

    /// Name as sent by the caller.
    requested: String,
    /// Name the request is routed to (differs when a matcher rewrote it).
    intent_name: String,
    parameters: Value,
    metadata: Map<String, Value>,

    intent: OnceLock<Arc<IntentDefinition>>,
    validated: OnceLock<Value>,

    response: Mutex<Option<DispatchResponse>>,
    error: Mutex<Option<DispatchError>>,
    fatal: Mutex<Option<DispatchError>>,

    cancel: CancellationToken,
    cancel_reason: Mutex<Option<ErrorKind>>,

    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl RequestContext {
    /// Creates a context for `request`, routed to its own intent name.
    pub fn new(app: Arc<AppContext>, request: DispatchRequest) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            started: Instant::now(),
            debug: false,
            app,
            requested: request.intent_name.clone(),
            intent_name: request.intent_name,
            parameters: request.parameters,
            metadata: request.metadata,
            intent: OnceLock::new(),
            validated: OnceLock::new(),
            response: Mutex::new(None),
            error: Mutex::new(None),
            fatal: Mutex::new(None),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Routes the request to `intent_name` instead of the requested name.
    pub fn routed_to(mut self, intent_name: impl Into<String>) -> Self {
        self.intent_name = intent_name.into();
        self
    }

    /// Enables debug mode for error responses.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    // ─── Identity ────────────────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Intent name the caller asked for.
    pub fn requested_name(&self) -> &str {
        &self.requested
    }

    /// Intent name this request is routed to.
    pub fn intent_name(&self) -> &str {
        &self.intent_name
    }

    // ─── Shared registries ───────────────────────────────────────────────────

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.app.services()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.app.events()
    }

    // ─── Parameters ──────────────────────────────────────────────────────────

    /// Parameters as received.
    pub fn raw_parameters(&self) -> &Value {
        &self.parameters
    }

    /// Validated parameters, once the intent has been resolved.
    pub fn validated_parameters(&self) -> Option<&Value> {
        self.validated.get()
    }

    /// Validated parameters if available, otherwise the raw ones.
    pub fn parameters(&self) -> &Value {
        self.validated.get().unwrap_or(&self.parameters)
    }

    /// Deserialises [`parameters`](Self::parameters) into `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> DispatchResult<T> {
        T::deserialize(self.parameters()).map_err(|e| {
            DispatchError::internal(format!("parameters do not match handler type: {e}"))
        })
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The resolved intent definition, once resolution has happened.
    pub fn intent(&self) -> Option<&Arc<IntentDefinition>> {
        self.intent.get()
    }

    pub(crate) fn resolve(&self, intent: Arc<IntentDefinition>, validated: Value) {
        let _ = self.intent.set(intent);
        let _ = self.validated.set(validated);
    }

    // ─── Response slot ───────────────────────────────────────────────────────

    pub fn set_response(&self, response: DispatchResponse) {
        *self.response.lock() = Some(response);
    }

    pub fn response(&self) -> Option<DispatchResponse> {
        self.response.lock().clone()
    }

    pub fn has_response(&self) -> bool {
        self.response.lock().is_some()
    }

    pub fn take_response(&self) -> Option<DispatchResponse> {
        self.response.lock().take()
    }

    /// Edits the response in place if one is set.
    pub fn map_response(&self, f: impl FnOnce(&mut DispatchResponse)) {
        if let Some(response) = self.response.lock().as_mut() {
            f(response);
        }
    }

    /// The error being handled, visible to error-phase middleware.
    pub fn error(&self) -> Option<DispatchError> {
        self.error.lock().clone()
    }

    pub(crate) fn set_error(&self, err: DispatchError) {
        *self.error.lock() = Some(err);
    }

    pub(crate) fn mark_fatal(&self, err: DispatchError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    pub(crate) fn fatal_error(&self) -> Option<DispatchError> {
        self.fatal.lock().clone()
    }

    // ─── Cancellation ────────────────────────────────────────────────────────

    /// Cancels the request.  Stages that have not started yet are skipped.
    pub fn cancel(&self) {
        self.cancel_with(ErrorKind::CancelledError);
    }

    pub(crate) fn cancel_with(&self, reason: ErrorKind) {
        {
            let mut current = self.cancel_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token a long-running handler can select on.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The error a cancelled stage resolves with.
    pub fn cancel_error(&self) -> DispatchError {
        match *self.cancel_reason.lock() {
            Some(ErrorKind::TimeoutError) => {
                DispatchError::new(ErrorKind::TimeoutError, "request timed out")
            }
            _ => DispatchError::cancelled(),
        }
    }

    // ─── Typed state ─────────────────────────────────────────────────────────

    /// Stores a value; one value per type, later calls overwrite.
    pub fn set_state<T: Send + Sync + 'static>(&self, value: T) {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get_state<T: Clone + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn has_state<T: 'static>(&self) -> bool {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }

    pub fn take_state<T: 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("intent", &self.intent_name)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
