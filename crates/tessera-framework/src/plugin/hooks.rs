//! Named extension points.
//!
//! A hook is a name plugins attach prioritised handlers to.  Running a hook
//! calls every handler sequentially, highest priority first (ties in
//! registration order), passing the same JSON arguments to each:
//!
//! - a failing **required** handler aborts the run and the error reaches the
//!   caller;
//! - a failing optional handler is logged and skipped.
//!
//! The run returns the results of every handler that succeeded.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tower::BoxError;
use tracing::{debug, warn};

use crate::error::HookError;

/// Type-erased hook handler.
pub type HookHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// A handler declaration: callback plus `priority` and `required` flags.
#[derive(Clone)]
pub struct HookSpec {
    pub handler: HookHandler,
    /// Higher runs first.
    pub priority: i32,
    /// Failure aborts the hook run.
    pub required: bool,
}

impl HookSpec {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |args| handler(args).boxed()),
            priority: 0,
            required: false,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

impl std::fmt::Debug for HookSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSpec")
            .field("priority", &self.priority)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

struct HookEntry {
    owner: String,
    spec: HookSpec,
}

/// All hook handlers, keyed by hook name.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, Vec<Arc<HookEntry>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `spec` to `hook` on behalf of `owner`.
    pub fn register(&self, hook: impl Into<String>, owner: impl Into<String>, spec: HookSpec) {
        let hook = hook.into();
        let entry = Arc::new(HookEntry {
            owner: owner.into(),
            spec,
        });
        debug!(
            hook = %hook,
            owner = %entry.owner,
            priority = entry.spec.priority,
            required = entry.spec.required,
            "Hook handler registered"
        );

        let mut hooks = self.hooks.write();
        let list = hooks.entry(hook).or_default();
        // After every handler with priority >= ours: ties keep registration order.
        let pos = list.partition_point(|e| e.spec.priority >= entry.spec.priority);
        list.insert(pos, entry);
    }

    /// Removes every handler registered by `owner`.
    pub fn remove_owned(&self, owner: &str) -> usize {
        let mut removed = 0;
        let mut hooks = self.hooks.write();
        hooks.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.owner != owner);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn handler_count(&self, hook: &str) -> usize {
        self.hooks.read().get(hook).map_or(0, Vec::len)
    }

    /// Hook names with at least one handler, sorted.
    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs every handler of `hook` with `args`.
    pub async fn run(&self, hook: &str, args: Value) -> Result<Vec<Value>, HookError> {
        let entries: Vec<Arc<HookEntry>> =
            self.hooks.read().get(hook).cloned().unwrap_or_default();
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let outcome = AssertUnwindSafe((entry.spec.handler)(args.clone()))
                .catch_unwind()
                .await;
            let message = match outcome {
                Ok(Ok(value)) => {
                    results.push(value);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };

            if entry.spec.required {
                return Err(HookError {
                    hook: hook.to_string(),
                    owner: entry.owner.clone(),
                    message,
                });
            }
            warn!(
                hook = %hook,
                owner = %entry.owner,
                error = %message,
                "Optional hook handler failed, skipping"
            );
        }

        Ok(results)
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hook_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: Value) -> HookSpec {
        HookSpec::new(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn failing() -> HookSpec {
        HookSpec::new(|_| async { Err::<Value, BoxError>("nope".into()) })
    }

    #[tokio::test]
    async fn test_priority_order_with_stable_ties() {
        let hooks = HookRegistry::new();
        hooks.register("render", "a", constant(json!("low-1")).priority(1));
        hooks.register("render", "b", constant(json!("high")).priority(9));
        hooks.register("render", "c", constant(json!("low-2")).priority(1));

        let results = hooks.run("render", json!(null)).await.unwrap();
        assert_eq!(results, vec![json!("high"), json!("low-1"), json!("low-2")]);
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped() {
        let hooks = HookRegistry::new();
        hooks.register("h", "a", failing().priority(5));
        hooks.register("h", "b", constant(json!(1)));

        let results = hooks.run("h", json!({})).await.unwrap();
        assert_eq!(results, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_required_failure_aborts() {
        let hooks = HookRegistry::new();
        hooks.register("h", "first", constant(json!(1)).priority(5));
        hooks.register("h", "strict", failing().required(true));
        hooks.register("h", "never", constant(json!(2)).priority(-1));

        let err = hooks.run("h", json!({})).await.unwrap_err();
        assert_eq!(err.owner, "strict");
        assert_eq!(err.hook, "h");
    }

    #[tokio::test]
    async fn test_handlers_receive_arguments() {
        let hooks = HookRegistry::new();
        hooks.register(
            "double",
            "math",
            HookSpec::new(|args: Value| async move {
                let n = args["n"].as_i64().unwrap_or_default();
                Ok(json!(n * 2))
            }),
        );
        let results = hooks.run("double", json!({ "n": 21 })).await.unwrap();
        assert_eq!(results, vec![json!(42)]);
        assert!(hooks.run("missing", json!(null)).await.unwrap().is_empty());
    }

    #[test]
    fn test_remove_owned() {
        let hooks = HookRegistry::new();
        hooks.register("a", "weather", constant(json!(1)));
        hooks.register("b", "weather", constant(json!(2)));
        hooks.register("a", "auth", constant(json!(3)));

        assert_eq!(hooks.remove_owned("weather"), 2);
        assert_eq!(hooks.handler_count("a"), 1);
        assert_eq!(hooks.hook_names(), vec!["a"]);
    }
}
