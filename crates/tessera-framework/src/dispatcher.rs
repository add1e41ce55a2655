//! Request dispatch.
//!
//! [`RequestDispatcher`] turns a [`DispatchRequest`] into a
//! [`DispatchResponse`]:
//!
//! 1. **Route**: an optional [`IntentMatcher`] may rewrite the requested
//!    name; otherwise the name is looked up exactly.
//! 2. **Pipeline**: a [`RequestContext`] is created and run through the
//!    [`MiddlewarePipeline`] under the configured timeout.
//! 3. **Endpoint**: the innermost stage resolves the intent, validates the
//!    parameters against its schema, calls the bound handler and fills the
//!    response slot with the intent's component and the handler's data.
//!
//! The dispatcher is also a `tower::Service<DispatchRequest>`, so transports
//! can stack tower layers in front of it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tessera_core::{DispatchError, DispatchResult, IntentMatcher, UnknownPolicy};
use tower::Service;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::{AppContext, RequestContext};
use crate::error::PipelineError;
use crate::middleware::{Endpoint, MiddlewareDescriptor, MiddlewarePipeline};
use crate::response::{DispatchRequest, DispatchResponse};

/// Type-erased intent handler.  Its `Ok` value becomes the response `data`.
pub type IntentHandler =
    Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, DispatchResult<Value>> + Send + Sync>;

type HandlerTable = Arc<RwLock<HashMap<String, IntentHandler>>>;

/// Dispatch settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    /// Per-request time limit; `None` disables the race.
    pub timeout: Option<Duration>,
    /// Policy for parameters the intent schema does not declare.
    pub unknown_properties: UnknownPolicy,
    /// Expose internal error messages and details.
    pub debug: bool,
    /// Minimum matcher confidence for a rewritten route to be accepted.
    pub match_threshold: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            unknown_properties: UnknownPolicy::default(),
            debug: false,
            match_threshold: 0.75,
        }
    }
}

/// Routes requests through the middleware pipeline to intent handlers.
///
/// Cheap to clone; clones share handlers, matcher and pipeline.
#[derive(Clone)]
pub struct RequestDispatcher {
    app: Arc<AppContext>,
    pipeline: Arc<MiddlewarePipeline>,
    handlers: HandlerTable,
    matcher: Arc<RwLock<Option<Arc<dyn IntentMatcher>>>>,
    config: DispatcherConfig,
}

impl RequestDispatcher {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self {
            app,
            pipeline: Arc::new(MiddlewarePipeline::new()),
            handlers: Arc::default(),
            matcher: Arc::new(RwLock::new(None)),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing pipeline instead of a fresh one.
    pub fn with_pipeline(mut self, pipeline: Arc<MiddlewarePipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn pipeline(&self) -> &Arc<MiddlewarePipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn use_middleware(&self, descriptor: MiddlewareDescriptor) -> Result<(), PipelineError> {
        self.pipeline.register(descriptor)
    }

    // ─── Handlers ────────────────────────────────────────────────────────────

    /// Binds `handler` under `handler_ref`.
    ///
    /// An intent uses the handler bound under its `handler` field, or under
    /// its own name when that field is absent.  Rebinding replaces.
    pub fn bind_handler<F, Fut>(&self, handler_ref: impl Into<String>, handler: F)
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Value>> + Send + 'static,
    {
        let handler_ref = handler_ref.into();
        debug!(handler = %handler_ref, "Intent handler bound");
        let handler: IntentHandler = Arc::new(move |ctx| handler(ctx).boxed());
        self.handlers.write().insert(handler_ref, handler);
    }

    pub fn unbind_handler(&self, handler_ref: &str) -> bool {
        self.handlers.write().remove(handler_ref).is_some()
    }

    pub fn has_handler(&self, handler_ref: &str) -> bool {
        self.handlers.read().contains_key(handler_ref)
    }

    // ─── Matching ────────────────────────────────────────────────────────────

    pub fn set_matcher(&self, matcher: impl IntentMatcher + 'static) {
        *self.matcher.write() = Some(Arc::new(matcher));
    }

    pub fn clear_matcher(&self) {
        *self.matcher.write() = None;
    }

    /// Picks the intent name a request is routed to.
    async fn route(&self, request: &DispatchRequest) -> String {
        let matcher = self.matcher.read().clone();
        let Some(matcher) = matcher else {
            return request.intent_name.clone();
        };

        let candidates = self.app.intents().list();
        let found = matcher
            .match_intent(&request.intent_name, &request.parameters, &candidates)
            .await;
        match found {
            Some(m)
                if m.confidence >= self.config.match_threshold
                    && self.app.intents().contains(&m.name) =>
            {
                debug!(
                    requested = %request.intent_name,
                    matched = %m.name,
                    confidence = m.confidence,
                    "Matcher rewrote route"
                );
                m.name
            }
            Some(m) => {
                debug!(
                    requested = %request.intent_name,
                    candidate = %m.name,
                    confidence = m.confidence,
                    threshold = self.config.match_threshold,
                    "Match rejected, falling back to exact lookup"
                );
                request.intent_name.clone()
            }
            None => request.intent_name.clone(),
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Dispatches one request.  Never fails: every error becomes a
    /// `Failure` response.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchResponse {
        let intent_name = self.route(&request).await;
        let ctx = Arc::new(
            RequestContext::new(Arc::clone(&self.app), request)
                .routed_to(intent_name)
                .with_debug(self.config.debug),
        );
        let span = info_span!("dispatch", request_id = ctx.id(), intent = %ctx.intent_name());

        async {
            debug!(requested = %ctx.requested_name(), "Dispatching request");
            let response = self
                .pipeline
                .execute(Arc::clone(&ctx), self.endpoint(), self.config.timeout)
                .await;

            let elapsed_ms = ctx.elapsed().as_millis() as u64;
            match response.error_kind() {
                None => info!(elapsed_ms, "Request completed"),
                Some(kind) => info!(elapsed_ms, error_kind = %kind, "Request failed"),
            }
            response
        }
        .instrument(span)
        .await
    }

    /// Dispatches a wire-form request body and returns the wire-form result.
    ///
    /// A body that is not a valid request yields a `ValidationError`.
    pub async fn dispatch_json(&self, body: Value) -> Value {
        match serde_json::from_value::<DispatchRequest>(body) {
            Ok(request) => self.dispatch(request).await.to_value(),
            Err(e) => {
                let err = DispatchError::new(
                    tessera_core::ErrorKind::ValidationError,
                    format!("malformed request: {e}"),
                );
                DispatchResponse::failure(&err, self.config.debug).to_value()
            }
        }
    }

    fn endpoint(&self) -> Endpoint {
        let handlers = Arc::clone(&self.handlers);
        let policy = self.config.unknown_properties;
        Arc::new(move |ctx: Arc<RequestContext>| {
            let handlers = Arc::clone(&handlers);
            async move { run_intent(ctx, handlers, policy).await }.boxed()
        })
    }
}

/// Resolve, validate, call the handler, fill the response slot.
async fn run_intent(
    ctx: Arc<RequestContext>,
    handlers: HandlerTable,
    policy: UnknownPolicy,
) -> DispatchResult<()> {
    let app = Arc::clone(ctx.app());
    let intent = app.intents().resolve(ctx.intent_name())?;
    if intent.deprecated {
        warn!(intent = %intent.name, version = %intent.version, "Deprecated intent dispatched");
    }

    let report = app
        .validator()
        .validate(&intent.parameters, ctx.raw_parameters(), policy)
        .map_err(|e| {
            DispatchError::internal(format!("intent '{}' has a malformed schema: {e}", intent.name))
        })?;
    let validated = report.into_result().map_err(DispatchError::validation)?;

    let handler = handlers
        .read()
        .get(intent.handler_ref())
        .cloned()
        .ok_or_else(|| {
            DispatchError::internal(format!("no handler bound for '{}'", intent.handler_ref()))
        })?;

    ctx.resolve(Arc::clone(&intent), validated);
    let data = handler(Arc::clone(&ctx)).await?;
    ctx.set_response(DispatchResponse::success(intent.component.clone(), data));
    Ok(())
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("pipeline", &self.pipeline)
            .field("handlers", &self.handlers.read().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Service<DispatchRequest> for RequestDispatcher {
    type Response = DispatchResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<DispatchResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: DispatchRequest) -> Self::Future {
        let this = self.clone();
        async move { Ok(this.dispatch(request).await) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Next;
    use parking_lot::Mutex;
    use serde_json::json;
    use tessera_core::{AliasMatcher, ErrorKind, IntentDefinition, Schema};
    use tower::ServiceExt;

    fn weather_dispatcher() -> RequestDispatcher {
        let app = Arc::new(AppContext::new());
        app.intents()
            .register(
                IntentDefinition::new("get_weather", "weather-card").with_parameters(
                    Schema::object()
                        .required_property("location", Schema::string())
                        .property(
                            "units",
                            Schema::string()
                                .one_of([json!("metric"), json!("imperial")])
                                .with_default(json!("metric")),
                        ),
                ),
            )
            .unwrap();

        let dispatcher = RequestDispatcher::new(app);
        dispatcher.bind_handler("get_weather", |ctx: Arc<RequestContext>| async move {
            let params = ctx.parameters();
            Ok(json!({
                "location": params["location"],
                "units": params["units"],
                "temperature": 21
            }))
        });
        dispatcher
    }

    #[tokio::test]
    async fn test_weather_end_to_end() {
        let dispatcher = weather_dispatcher();

        let resp = dispatcher
            .dispatch(DispatchRequest::new("get_weather", json!({})))
            .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::ValidationError));
        assert_eq!(resp.to_value()["success"], false);
        assert_eq!(resp.to_value()["errorKind"], "ValidationError");
        assert_eq!(resp.to_value()["details"][0]["path"], "location");

        let resp = dispatcher
            .dispatch(DispatchRequest::new("get_weather", json!({ "location": "NYC" })))
            .await;
        let wire = resp.to_value();
        assert_eq!(wire["success"], true);
        assert_eq!(wire["component"], "weather-card");
        assert_eq!(wire["data"]["location"], "NYC");
        assert_eq!(wire["data"]["units"], "metric");
    }

    #[tokio::test]
    async fn test_auth_short_circuit_skips_log_after() {
        let dispatcher = weather_dispatcher();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let sink = Arc::clone(&log);
        dispatcher
            .use_middleware(MiddlewareDescriptor::request(
                "log",
                1,
                move |_ctx: Arc<RequestContext>, next: Next| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push("log:before");
                        next.run().await?;
                        sink.lock().push("log:after");
                        Ok(())
                    }
                },
            ))
            .unwrap();
        dispatcher
            .use_middleware(MiddlewareDescriptor::request(
                "auth",
                2,
                |ctx: Arc<RequestContext>, next: Next| async move {
                    if ctx.meta("token").is_none() {
                        return Err(DispatchError::authentication("missing token"));
                    }
                    next.run().await
                },
            ))
            .unwrap();

        let resp = dispatcher
            .dispatch(DispatchRequest::new("get_weather", json!({ "location": "NYC" })))
            .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::AuthenticationError));
        assert_eq!(*log.lock(), vec!["log:before"]);

        log.lock().clear();
        let resp = dispatcher
            .dispatch(
                DispatchRequest::new("get_weather", json!({ "location": "NYC" }))
                    .with_metadata("token", "secret"),
            )
            .await;
        assert!(resp.is_success());
        assert_eq!(*log.lock(), vec!["log:before", "log:after"]);
    }

    #[tokio::test]
    async fn test_unknown_intent_is_not_found() {
        let dispatcher = weather_dispatcher();
        let resp = dispatcher
            .dispatch(DispatchRequest::new("get_stock", json!({})))
            .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::NotFoundError));
    }

    #[tokio::test]
    async fn test_matcher_rewrites_route() {
        let dispatcher = weather_dispatcher();
        dispatcher.set_matcher(
            AliasMatcher::new()
                .alias("weather", "get_weather")
                .alias("forecast", "get_forecast"),
        );

        let resp = dispatcher
            .dispatch(DispatchRequest::new("weather", json!({ "location": "Oslo" })))
            .await;
        assert_eq!(resp.component(), Some("weather-card"));

        // Matched name is not registered: exact lookup of the requested name.
        let resp = dispatcher
            .dispatch(DispatchRequest::new("forecast", json!({})))
            .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::NotFoundError));
    }

    #[tokio::test]
    async fn test_missing_handler_is_internal() {
        let dispatcher = weather_dispatcher();
        assert!(dispatcher.unbind_handler("get_weather"));
        let resp = dispatcher
            .dispatch(DispatchRequest::new("get_weather", json!({ "location": "NYC" })))
            .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::InternalError));
        assert_eq!(resp.to_value()["message"], "internal server error");
    }

    #[tokio::test]
    async fn test_tower_service_and_json_surface() {
        let dispatcher = weather_dispatcher();
        let resp = dispatcher
            .clone()
            .oneshot(DispatchRequest::new("get_weather", json!({ "location": "NYC" })))
            .await
            .unwrap();
        assert!(resp.is_success());

        let wire = dispatcher
            .dispatch_json(json!({
                "intentName": "get_weather",
                "parameters": { "location": "Rome" }
            }))
            .await;
        assert_eq!(wire["data"]["location"], "Rome");

        let wire = dispatcher.dispatch_json(json!({ "parameters": 1 })).await;
        assert_eq!(wire["errorKind"], "ValidationError");
    }
}
