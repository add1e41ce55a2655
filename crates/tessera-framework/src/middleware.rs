//! Onion-model middleware pipeline.
//!
//! Each middleware receives the [`RequestContext`] and a [`Next`]
//! continuation.  Code before `next.run().await` is the request half, code
//! after it the response half:
//!
//! ```text
//! global/request  ──►  m1 ──► m2 ──► … ──► endpoint ──► response-phase chain
//!                      ◄──────────────────────────────────┘
//! ```
//!
//! # Ordering
//!
//! `global` and `request` middleware form one chain, sorted by `order`
//! ascending with ties broken by registration sequence.  `response` and
//! `error` middleware are sorted the same way within their phase.
//!
//! # Contract
//!
//! - `next` may be awaited at most once.  A second call returns
//!   `MultipleNextInvocationError` and marks the request as fatally failed;
//!   error middleware never see it.
//! - Not calling `next` short-circuits the chain.  Outer middleware still
//!   resume after their own `next`.
//! - A cancelled request resolves every stage that has not started yet with
//!   the cancellation error instead of running it.
//! - An `Err` (or a panic) from a `global`/`request`/`response` middleware or
//!   from the endpoint is routed through the `error` phase.  The first error
//!   middleware that sets a response wins; otherwise the error is mapped to a
//!   failure response.
//!
//! # Timeout
//!
//! With a timeout configured, the chain runs as a spawned task raced against
//! the timer.  If the timer wins, the context is cancelled and a
//! `TimeoutError` response is returned; the task itself is detached, not
//! aborted, and its eventual result is discarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tessera_core::{DispatchError, DispatchResult, ErrorKind};
use tracing::{Instrument, debug, error, warn};

use crate::context::RequestContext;
use crate::error::PipelineError;
use crate::response::DispatchResponse;

/// Pipeline phase a middleware is registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Global,
    Request,
    Response,
    Error,
}

/// A unit of request processing.
///
/// Implemented for every `Fn(Arc<RequestContext>, Next) -> impl Future`
/// closure, so most middleware are plain async closures.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: Arc<RequestContext>, next: Next) -> DispatchResult<()>;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Arc<RequestContext>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Arc<RequestContext>, next: Next) -> DispatchResult<()> {
        (self)(ctx, next).await
    }
}

/// A registered middleware.
#[derive(Clone)]
pub struct MiddlewareDescriptor {
    pub name: String,
    pub phase: Phase,
    /// Ascending; lower runs earlier.
    pub order: i32,
    pub handler: Arc<dyn Middleware>,
}

impl MiddlewareDescriptor {
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        order: i32,
        handler: impl Middleware,
    ) -> Self {
        Self {
            name: name.into(),
            phase,
            order,
            handler: Arc::new(handler),
        }
    }

    pub fn global(name: impl Into<String>, order: i32, handler: impl Middleware) -> Self {
        Self::new(name, Phase::Global, order, handler)
    }

    pub fn request(name: impl Into<String>, order: i32, handler: impl Middleware) -> Self {
        Self::new(name, Phase::Request, order, handler)
    }

    pub fn response(name: impl Into<String>, order: i32, handler: impl Middleware) -> Self {
        Self::new(name, Phase::Response, order, handler)
    }

    pub fn error(name: impl Into<String>, order: i32, handler: impl Middleware) -> Self {
        Self::new(name, Phase::Error, order, handler)
    }
}

impl std::fmt::Debug for MiddlewareDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareDescriptor")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// The innermost stage: resolves and runs the intent handler.
pub type Endpoint =
    Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, DispatchResult<()>> + Send + Sync>;

type Stages = Arc<[Arc<MiddlewareDescriptor>]>;

// =============================================================================
// Next
// =============================================================================

/// Continuation handed to a middleware.
///
/// Clones share the same guard, so the at-most-once rule holds across them.
#[derive(Clone)]
pub struct Next {
    inner: Arc<NextInner>,
}

struct NextInner {
    ctx: Arc<RequestContext>,
    stages: Stages,
    index: usize,
    terminal: Endpoint,
    owner: String,
    called: AtomicBool,
}

impl Next {
    fn new(
        ctx: Arc<RequestContext>,
        stages: Stages,
        index: usize,
        terminal: Endpoint,
        owner: &str,
    ) -> Self {
        Self {
            inner: Arc::new(NextInner {
                ctx,
                stages,
                index,
                terminal,
                owner: owner.to_string(),
                called: AtomicBool::new(false),
            }),
        }
    }

    /// Runs the rest of the chain.
    pub async fn run(&self) -> DispatchResult<()> {
        let inner = &self.inner;
        if inner.called.swap(true, Ordering::SeqCst) {
            let err = DispatchError::multiple_next(&inner.owner);
            inner.ctx.mark_fatal(err.clone());
            return Err(err);
        }
        run_stage(
            Arc::clone(&inner.ctx),
            Arc::clone(&inner.stages),
            inner.index,
            Arc::clone(&inner.terminal),
        )
        .await
    }

    /// Returns `true` once [`run`](Self::run) has been called.
    pub fn was_called(&self) -> bool {
        self.inner.called.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("owner", &self.inner.owner)
            .field("index", &self.inner.index)
            .field("called", &self.was_called())
            .finish()
    }
}

fn noop() -> Endpoint {
    Arc::new(|_: Arc<RequestContext>| futures::future::ok(()).boxed())
}

fn run_stage(
    ctx: Arc<RequestContext>,
    stages: Stages,
    index: usize,
    terminal: Endpoint,
) -> BoxFuture<'static, DispatchResult<()>> {
    async move {
        if ctx.is_cancelled() {
            return Err(ctx.cancel_error());
        }
        let Some(stage) = stages.get(index).cloned() else {
            return catch(terminal(ctx), "endpoint").await;
        };
        let next = Next::new(
            Arc::clone(&ctx),
            Arc::clone(&stages),
            index + 1,
            terminal,
            &stage.name,
        );
        catch(stage.handler.handle(ctx, next), &stage.name).await
    }
    .boxed()
}

async fn catch<F>(fut: F, stage: &str) -> DispatchResult<()>
where
    F: Future<Output = DispatchResult<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(stage = %stage, "Pipeline stage panicked");
            Err(DispatchError::internal(format!("'{stage}' panicked")))
        }
    }
}

// =============================================================================
// MiddlewarePipeline
// =============================================================================

struct Compiled {
    chain: Stages,
    response: Stages,
    error: Stages,
}

impl Compiled {
    fn build(entries: &[(u64, Arc<MiddlewareDescriptor>)]) -> Self {
        let mut sorted: Vec<&(u64, Arc<MiddlewareDescriptor>)> = entries.iter().collect();
        sorted.sort_by_key(|(seq, d)| (d.order, *seq));

        let select = |phases: &[Phase]| -> Stages {
            sorted
                .iter()
                .filter(|(_, d)| phases.contains(&d.phase))
                .map(|(_, d)| Arc::clone(d))
                .collect()
        };

        Self {
            chain: select(&[Phase::Global, Phase::Request]),
            response: select(&[Phase::Response]),
            error: select(&[Phase::Error]),
        }
    }
}

/// Ordered set of middleware, compiled lazily and cached until changed.
#[derive(Default)]
pub struct MiddlewarePipeline {
    entries: RwLock<Vec<(u64, Arc<MiddlewareDescriptor>)>>,
    next_seq: AtomicU64,
    compiled: RwLock<Option<Arc<Compiled>>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a middleware.  Names are unique across phases.
    pub fn register(&self, descriptor: MiddlewareDescriptor) -> Result<(), PipelineError> {
        {
            let mut entries = self.entries.write();
            if entries.iter().any(|(_, d)| d.name == descriptor.name) {
                return Err(PipelineError::DuplicateMiddleware(descriptor.name));
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            debug!(
                middleware = %descriptor.name,
                phase = ?descriptor.phase,
                order = descriptor.order,
                "Middleware registered"
            );
            entries.push((seq, Arc::new(descriptor)));
        }
        self.invalidate();
        Ok(())
    }

    /// Removes a middleware by name.  Returns `false` if it was unknown.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|(_, d)| d.name != name);
            entries.len() != before
        };
        if removed {
            debug!(middleware = %name, "Middleware unregistered");
            self.invalidate();
        }
        removed
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|(_, d)| d.name.clone())
            .collect()
    }

    /// Names of `phase` in execution order.
    pub fn execution_order(&self, phase: Phase) -> Vec<String> {
        let compiled = self.compiled();
        let stages = match phase {
            Phase::Global | Phase::Request => &compiled.chain,
            Phase::Response => &compiled.response,
            Phase::Error => &compiled.error,
        };
        stages
            .iter()
            .filter(|d| d.phase == phase)
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns `true` while a compiled pipeline is cached.
    pub fn is_compiled(&self) -> bool {
        self.compiled.read().is_some()
    }

    fn invalidate(&self) {
        *self.compiled.write() = None;
    }

    fn compiled(&self) -> Arc<Compiled> {
        if let Some(compiled) = self.compiled.read().as_ref() {
            return Arc::clone(compiled);
        }
        let mut slot = self.compiled.write();
        if let Some(compiled) = slot.as_ref() {
            return Arc::clone(compiled);
        }
        let compiled = Arc::new(Compiled::build(&self.entries.read()));
        *slot = Some(Arc::clone(&compiled));
        compiled
    }

    // ─── Execution ───────────────────────────────────────────────────────────

    /// Runs the pipeline around `endpoint` and returns the outward result.
    pub async fn execute(
        &self,
        ctx: Arc<RequestContext>,
        endpoint: Endpoint,
        timeout: Option<Duration>,
    ) -> DispatchResponse {
        let compiled = self.compiled();

        let response_stages = Arc::clone(&compiled.response);
        let inner: Endpoint = Arc::new(move |ctx: Arc<RequestContext>| {
            let endpoint = Arc::clone(&endpoint);
            let response_stages = Arc::clone(&response_stages);
            async move {
                endpoint(Arc::clone(&ctx)).await?;
                run_stage(ctx, response_stages, 0, noop()).await
            }
            .boxed()
        });
        let chain = run_stage(Arc::clone(&ctx), Arc::clone(&compiled.chain), 0, inner);

        let result = match timeout {
            None => chain.await,
            Some(limit) => {
                let task = tokio::spawn(chain.in_current_span());
                match tokio::time::timeout(limit, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(DispatchError::internal(format!(
                        "request task failed: {join}"
                    ))),
                    Err(_) => {
                        ctx.cancel_with(ErrorKind::TimeoutError);
                        warn!(
                            request_id = ctx.id(),
                            timeout_ms = limit.as_millis() as u64,
                            "Request timed out"
                        );
                        return DispatchResponse::failure(
                            &DispatchError::timeout(limit),
                            ctx.debug(),
                        );
                    }
                }
            }
        };

        if let Some(fatal) = ctx.fatal_error() {
            error!(request_id = ctx.id(), error = %fatal, "Fatal pipeline error");
            ctx.take_response();
            return DispatchResponse::failure(&fatal, ctx.debug());
        }

        match result {
            Ok(()) => ctx.take_response().unwrap_or_else(|| {
                DispatchResponse::failure(
                    &DispatchError::internal("request completed without a response"),
                    ctx.debug(),
                )
            }),
            Err(err) => Self::handle_error(&ctx, &compiled.error, err).await,
        }
    }

    async fn handle_error(
        ctx: &Arc<RequestContext>,
        stages: &Stages,
        err: DispatchError,
    ) -> DispatchResponse {
        debug!(request_id = ctx.id(), error = %err, "Entering error phase");
        ctx.take_response();
        ctx.set_error(err.clone());

        for stage in stages.iter() {
            let next = Next::new(Arc::clone(ctx), Arc::from([]), 0, noop(), &stage.name);
            let outcome = catch(stage.handler.handle(Arc::clone(ctx), next), &stage.name).await;
            if let Err(e) = outcome {
                warn!(middleware = %stage.name, error = %e, "Error middleware failed");
            }
            if let Some(fatal) = ctx.fatal_error() {
                return DispatchResponse::failure(&fatal, ctx.debug());
            }
            if let Some(response) = ctx.take_response() {
                return response;
            }
        }

        DispatchResponse::failure(&err, ctx.debug())
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middleware", &self.names())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}
