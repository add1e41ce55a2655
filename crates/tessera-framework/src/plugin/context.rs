//! The handle a plugin's `install` capability works through: its config
//! section, its logger span, and owner-tagged access to services and events.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tessera_core::{
    Event, EventBus, RegistryResult, ServiceOptions, ServiceRegistry, SubscribeOptions,
    SubscriptionId,
};
use tower::BoxError;
use tracing::Span;

/// Context passed to a plugin's `install` capability.
///
/// Everything registered through it is tagged with the plugin's name, so the
/// manager can remove it again on rollback or uninstall.  Registering
/// straight on [`services`](Self::services) or [`events`](Self::events)
/// bypasses that tagging.
#[derive(Debug, Clone)]
pub struct PluginContext {
    name: String,
    config: Arc<Value>,
    services: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    span: Span,
}

impl PluginContext {
    pub(crate) fn new(
        name: impl Into<String>,
        config: Arc<Value>,
        services: Arc<ServiceRegistry>,
        events: Arc<EventBus>,
        span: Span,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            services,
            events,
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw config section; an empty object when none was configured.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Deserialises the config section into `T`.
    ///
    /// Use `#[serde(default)]` on `T` to make every field optional.
    pub fn get_config<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.config.as_ref())
    }

    /// The plugin's logger scope.
    ///
    /// ```rust,ignore
    /// let _guard = ctx.span().enter();
    /// info!("connected");   // carries plugin = "weather"
    /// ```
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn tagged(&self, options: ServiceOptions) -> ServiceOptions {
        options.owner(self.name.clone())
    }

    // ─── Owner-tagged registration ───────────────────────────────────────────

    pub async fn register_service<T>(
        &self,
        name: impl Into<String>,
        instance: Arc<T>,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
    {
        self.register_service_with(name, instance, ServiceOptions::default())
            .await
    }

    pub async fn register_singleton<T, F>(
        &self,
        name: impl Into<String>,
        factory: F,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register_singleton_with(name, factory, ServiceOptions::default())
            .await
    }

    pub async fn register_transient<T, F>(
        &self,
        name: impl Into<String>,
        factory: F,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register_transient_with(name, factory, ServiceOptions::default())
            .await
    }

    /// Registers an instance with explicit `options`.
    ///
    /// The owner is always this plugin, whatever `options.owner` says.  With
    /// `override_existing` the previous registration is replaced outright:
    /// when this plugin is rolled back or uninstalled the name is removed,
    /// not restored to the overridden provider.
    pub async fn register_service_with<T>(
        &self,
        name: impl Into<String>,
        instance: Arc<T>,
        options: ServiceOptions,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
    {
        self.services
            .register_instance(name, instance, self.tagged(options))
            .await
    }

    /// Singleton counterpart of [`register_service_with`](Self::register_service_with).
    pub async fn register_singleton_with<T, F>(
        &self,
        name: impl Into<String>,
        factory: F,
        options: ServiceOptions,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.services
            .register_singleton(name, factory, self.tagged(options))
            .await
    }

    /// Transient counterpart of [`register_service_with`](Self::register_service_with).
    pub async fn register_transient_with<T, F>(
        &self,
        name: impl Into<String>,
        factory: F,
        options: ServiceOptions,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.services
            .register_transient(name, factory, self.tagged(options))
            .await
    }

    /// Subscribes to `channel` at `priority`, owned by this plugin.
    pub fn subscribe<F, Fut>(
        &self,
        channel: impl Into<String>,
        priority: i32,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let options = SubscribeOptions::default()
            .priority(priority)
            .owner(self.name.clone());
        self.events.subscribe(channel, options, handler)
    }
}
