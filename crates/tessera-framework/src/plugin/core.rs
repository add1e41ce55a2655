//! The [`Plugin`] capability record and its [`PluginBuilder`], plus the
//! health report a plugin's `health` capability returns.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::BoxError;

use super::context::PluginContext;
use super::hooks::HookSpec;

// ─── Capability types ────────────────────────────────────────────────────────

/// Type of the async `install` capability.
pub type InstallFn =
    Arc<dyn Fn(Arc<PluginContext>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Type of the optional `start` / `stop` capabilities.
pub type LifecycleFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Type of the optional `health` capability.
pub type HealthFn = Arc<dyn Fn() -> BoxFuture<'static, HealthReport> + Send + Sync>;

// ─── Health ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a plugin health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded).with_message(message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy).with_message(message)
    }

    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            message: None,
            details: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ─── Plugin ──────────────────────────────────────────────────────────────────

/// An installable unit: a name plus a set of optional capabilities.
///
/// The manager dispatches on which capabilities are present; a plugin with
/// no `start` capability goes straight from `Starting` to `Running`.
///
/// # Example
///
/// ```rust,ignore
/// let plugin = Plugin::builder("weather")
///     .version("1.2.0")
///     .depends_on("http-client")
///     .hook("render:before", HookSpec::new(|args| async move { Ok(args) }).priority(10))
///     .on_install(|ctx| async move {
///         ctx.register_service("weather-api", Arc::new(WeatherApi::default())).await?;
///         Ok(())
///     })
///     .build();
/// ```
pub struct Plugin {
    name: Cow<'static, str>,
    version: String,
    description: String,
    dependencies: Vec<String>,
    hooks: Vec<(String, HookSpec)>,
    install_fn: Option<InstallFn>,
    start_fn: Option<LifecycleFn>,
    stop_fn: Option<LifecycleFn>,
    health_fn: Option<HealthFn>,
}

impl Plugin {
    pub fn builder(name: impl Into<Cow<'static, str>>) -> PluginBuilder {
        PluginBuilder {
            plugin: Plugin {
                name: name.into(),
                version: "0.0.0".to_string(),
                description: String::new(),
                dependencies: Vec::new(),
                hooks: Vec::new(),
                install_fn: None,
                start_fn: None,
                stop_fn: None,
                health_fn: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Names of plugins that must be `Running` before this one installs.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub(crate) fn hooks(&self) -> &[(String, HookSpec)] {
        &self.hooks
    }

    pub fn has_health_check(&self) -> bool {
        self.health_fn.is_some()
    }

    pub(crate) async fn install(&self, ctx: Arc<PluginContext>) -> Result<(), BoxError> {
        match &self.install_fn {
            Some(f) => f(ctx).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), BoxError> {
        match &self.start_fn {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn stop(&self) -> Result<(), BoxError> {
        match &self.stop_fn {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    /// `None` when the plugin has no health capability.
    pub(crate) async fn health(&self) -> Option<HealthReport> {
        match &self.health_fn {
            Some(f) => Some(f().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

// ─── PluginBuilder ───────────────────────────────────────────────────────────

/// Builder returned by [`Plugin::builder`].
pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.plugin.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plugin.description = description.into();
        self
    }

    pub fn depends_on(mut self, plugin: impl Into<String>) -> Self {
        self.plugin.dependencies.push(plugin.into());
        self
    }

    pub fn hook(mut self, hook: impl Into<String>, spec: HookSpec) -> Self {
        self.plugin.hooks.push((hook.into(), spec));
        self
    }

    pub fn on_install<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.install_fn = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.start_fn = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.plugin.stop_fn = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn on_health<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HealthReport> + Send + 'static,
    {
        self.plugin.health_fn = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn build(self) -> Plugin {
        self.plugin
    }
}
