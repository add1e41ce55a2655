//! Boot and shutdown orchestration.
//!
//! [`TesseraRuntime`] owns the shared registries, the plugin manager and the
//! dispatcher, and wires them from a [`TesseraConfig`]:
//!
//! 1. **Construct**: logging is initialised, dispatch settings applied and
//!    each plugin's config section handed to the manager.
//! 2. **Start**: configured intents are registered, then enabled plugins are
//!    installed as one batch in dependency order.  A failing plugin rolls
//!    the whole batch back.
//! 3. **Run**: requests are dispatched until Ctrl+C / SIGTERM or a custom
//!    shutdown future resolves.
//! 4. **Stop**: running plugins are uninstalled, dependents first.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tessera_runtime::TesseraRuntime;
//!
//! let runtime = TesseraRuntime::builder()
//!     .config_file("deploy/tessera.toml")
//!     .build()?;
//!
//! runtime.register_plugin(WEATHER)?;
//! runtime.bind_handler("get_weather", get_weather);
//! runtime.run().await?;
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tessera_core::{DispatchResult, IntentDefinition, IntentMatcher};
use tessera_framework::{
    AppContext, DispatchRequest, DispatchResponse, HealthReport, MiddlewareDescriptor,
    PluginDescriptor, PluginManager, RequestContext, RequestDispatcher,
};
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ConfigLoader, ConfigResult, TesseraConfig, validate_config};
use crate::error::RuntimeResult;
use crate::logging;

/// The Tessera intent server runtime.
pub struct TesseraRuntime {
    config: TesseraConfig,
    app: Arc<AppContext>,
    plugins: Arc<PluginManager>,
    dispatcher: RequestDispatcher,
    running: RwLock<bool>,
}

impl TesseraRuntime {
    /// Creates a runtime from `tessera.toml` (or `.yaml`) in the current
    /// directory, falling back to defaults when loading fails.
    pub fn new() -> Self {
        let (config, load_error) = match ConfigLoader::new().with_current_dir().load() {
            Ok(config) => (config, None),
            Err(e) => (TesseraConfig::default(), Some(e)),
        };

        let runtime = Self::from_config(&config);
        if let Some(e) = load_error {
            warn!(error = %e, "Failed to load configuration, using defaults");
        }
        runtime
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration.
    pub fn from_config(config: &TesseraConfig) -> Self {
        logging::init_from_config(&config.logging);

        let app = Arc::new(AppContext::new());
        let plugins = Arc::new(PluginManager::from_app(&app));
        let dispatcher =
            RequestDispatcher::new(Arc::clone(&app)).with_config(config.server.dispatcher_config());

        for (name, section) in &config.plugins.settings {
            plugins.set_config(name.clone(), section.clone());
        }

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            timeout_ms = config.server.request_timeout_ms,
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            app,
            plugins,
            dispatcher,
            running: RwLock::new(false),
        }
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Adds a plugin to the table that `plugins.enabled` is resolved against.
    pub fn register_plugin(&self, descriptor: PluginDescriptor) -> RuntimeResult<()> {
        self.plugins.register_descriptor(descriptor)?;
        Ok(())
    }

    pub fn register_plugins(
        &self,
        descriptors: impl IntoIterator<Item = PluginDescriptor>,
    ) -> RuntimeResult<()> {
        descriptors
            .into_iter()
            .try_for_each(|desc| self.register_plugin(desc))
    }

    pub fn use_middleware(&self, descriptor: MiddlewareDescriptor) -> RuntimeResult<()> {
        self.dispatcher.use_middleware(descriptor)?;
        Ok(())
    }

    pub fn bind_handler<F, Fut>(&self, handler_ref: impl Into<String>, handler: F)
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Value>> + Send + 'static,
    {
        self.dispatcher.bind_handler(handler_ref, handler);
    }

    pub fn set_matcher(&self, matcher: impl IntentMatcher + 'static) {
        self.dispatcher.set_matcher(matcher);
    }

    /// Registers an intent programmatically, alongside the configured ones.
    pub fn register_intent(
        &self,
        definition: IntentDefinition,
    ) -> RuntimeResult<Arc<IntentDefinition>> {
        Ok(self.app.intents().register(definition)?)
    }

    /// Registers the configured intents not yet present, returning the names
    /// it added.  Nothing stays registered when one of them is rejected.
    fn register_configured_intents(&self) -> RuntimeResult<Vec<String>> {
        let intents = self.app.intents();
        let mut added = Vec::new();
        for definition in &self.config.intents {
            if intents.contains(&definition.name) {
                debug!(intent = %definition.name, "Intent already registered, skipping");
                continue;
            }
            if let Err(e) = intents.register(definition.clone()) {
                self.unregister_intents(&added);
                return Err(e.into());
            }
            added.push(definition.name.clone());
        }
        Ok(added)
    }

    fn unregister_intents(&self, names: &[String]) {
        for name in names {
            self.app.intents().unregister(name);
        }
        if !names.is_empty() {
            debug!(intents = ?names, "Configured intents rolled back");
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Registers configured intents and installs enabled plugins.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut running = self.running.write().await;
        if *running {
            warn!("Runtime is already running");
            return Ok(());
        }

        info!("Starting Tessera runtime");

        let added = self.register_configured_intents()?;
        let installed = match self
            .plugins
            .install_batch_named(&self.config.plugins.enabled)
            .await
        {
            Ok(installed) => installed,
            Err(e) => {
                self.unregister_intents(&added);
                return Err(e.into());
            }
        };

        *running = true;
        info!(
            intents = self.app.intents().len(),
            plugins = ?installed,
            "Runtime started"
        );
        Ok(())
    }

    /// Uninstalls every running plugin.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            warn!("Runtime is not running");
            return Ok(());
        }

        info!("Stopping Tessera runtime");
        self.plugins.shutdown().await;
        *running = false;

        info!("Runtime stopped");
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;

        info!("Tessera runtime is now running. Press Ctrl+C to stop.");

        let signal = Self::wait_for_shutdown().await;
        self.stop().await?;
        signal
    }

    /// Runs until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    async fn wait_for_shutdown() -> RuntimeResult<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
        }

        Ok(())
    }

    // =========================================================================
    // Serving
    // =========================================================================

    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchResponse {
        self.dispatcher.dispatch(request).await
    }

    /// Dispatches a JSON request body and returns the wire response.
    pub async fn dispatch_json(&self, body: Value) -> Value {
        self.dispatcher.dispatch_json(body).await
    }

    pub async fn health(&self) -> BTreeMap<String, HealthReport> {
        self.plugins.health_all().await
    }
}

impl Default for TesseraRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TesseraRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesseraRuntime")
            .field("intents", &self.app.intents().len())
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`TesseraRuntime`] with custom configuration sources.
///
/// ```rust,ignore
/// let runtime = TesseraRuntime::builder()
///     .config_file("config/production.toml")
///     .profile("production")
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: TesseraConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads and validates the configuration, then builds the runtime.
    pub fn build(self) -> ConfigResult<TesseraRuntime> {
        let config = self.config_loader.load()?;
        validate_config(&config)?;
        Ok(TesseraRuntime::from_config(&config))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{DispatchError, ErrorKind, Schema};
    use tessera_framework::{Next, Plugin, PluginContext, PluginError, PluginState};

    use crate::error::RuntimeError;

    fn weather() -> Plugin {
        Plugin::builder("weather")
            .version("1.2.0")
            .on_install(|ctx: Arc<PluginContext>| async move {
                let unit = ctx.config()["unit"].as_str().unwrap_or("C").to_string();
                ctx.register_service("weather.unit", Arc::new(unit)).await?;
                Ok(())
            })
            .build()
    }

    fn forecast() -> Plugin {
        Plugin::builder("forecast").depends_on("weather").build()
    }

    static WEATHER: PluginDescriptor = PluginDescriptor::new("weather", weather);
    static FORECAST: PluginDescriptor = PluginDescriptor::new("forecast", forecast);

    fn config() -> TesseraConfig {
        let mut config = TesseraConfig::default();
        config.intents.push(
            IntentDefinition::new("get_weather", "weather-card").with_parameters(
                Schema::object().required_property("location", Schema::string()),
            ),
        );
        config.plugins.enabled = vec!["forecast".into(), "weather".into()];
        config
            .plugins
            .settings
            .insert("weather".into(), json!({ "unit": "F" }));
        config
    }

    fn runtime(config: &TesseraConfig) -> TesseraRuntime {
        let runtime = TesseraRuntime::from_config(config);
        runtime.register_plugins([WEATHER, FORECAST]).unwrap();
        runtime.bind_handler("get_weather", |ctx: Arc<RequestContext>| async move {
            let unit = ctx
                .services()
                .get::<String>("weather.unit")
                .map(|u| u.as_str().to_owned())
                .unwrap_or_default();
            Ok(json!({ "location": ctx.parameters()["location"], "unit": unit }))
        });
        runtime
    }

    #[tokio::test]
    async fn test_boot_dispatch_and_stop() {
        let runtime = runtime(&config());
        runtime.start().await.unwrap();
        assert!(runtime.is_running().await);
        assert_eq!(runtime.plugins().state("weather"), Some(PluginState::Running));
        assert_eq!(runtime.plugins().state("forecast"), Some(PluginState::Running));

        let resp = runtime
            .dispatch(DispatchRequest::new("get_weather", json!({ "location": "Paris" })))
            .await;
        assert_eq!(
            resp,
            DispatchResponse::Success {
                component: "weather-card".into(),
                data: json!({ "location": "Paris", "unit": "F" }),
            }
        );

        let invalid = runtime
            .dispatch(DispatchRequest::new("get_weather", json!({})))
            .await;
        assert_eq!(invalid.error_kind(), Some(ErrorKind::ValidationError));

        let health = runtime.health().await;
        assert_eq!(health.len(), 2);

        runtime.stop().await.unwrap();
        assert!(!runtime.is_running().await);
        assert_eq!(runtime.plugins().state("weather"), Some(PluginState::Stopped));
        assert!(runtime.app().services().get::<String>("weather.unit").is_none());
    }

    #[tokio::test]
    async fn test_unknown_enabled_plugin_fails_start() {
        let mut config = config();
        config.plugins.enabled.push("missing".into());
        let runtime = runtime(&config);

        let result = runtime.start().await;
        assert!(matches!(
            result,
            Err(RuntimeError::Plugin(PluginError::NotFound(name))) if name == "missing"
        ));
        assert!(!runtime.is_running().await);
        assert_eq!(runtime.plugins().state("weather"), None);
        assert!(!runtime.app().intents().contains("get_weather"));
        assert!(runtime.app().intents().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_keeps_programmatic_intents() {
        let runtime = runtime(&config());
        runtime
            .register_intent(IntentDefinition::new("get_weather", "custom-card"))
            .unwrap();

        runtime.start().await.unwrap();
        runtime.start().await.unwrap();

        let intent = runtime.app().intents().resolve("get_weather").unwrap();
        assert_eq!(intent.component, "custom-card");
        runtime.stop().await.unwrap();
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_middleware_and_run_until() {
        let mut config = config();
        config.plugins.enabled.clear();
        let runtime = runtime(&config);
        runtime
            .use_middleware(MiddlewareDescriptor::request(
                "auth",
                0,
                |ctx: Arc<RequestContext>, next: Next| async move {
                    if ctx.meta("token").is_none() {
                        return Err(DispatchError::authentication("missing token"));
                    }
                    next.run().await
                },
            ))
            .unwrap();

        runtime
            .run_until(async {
                let body = json!({
                    "intentName": "get_weather",
                    "parameters": { "location": "Oslo" }
                });
                let denied = runtime.dispatch_json(body).await;
                assert_eq!(denied["errorKind"], "AuthenticationError");

                let allowed = runtime
                    .dispatch(
                        DispatchRequest::new("get_weather", json!({ "location": "Oslo" }))
                            .with_metadata("token", "t"),
                    )
                    .await;
                assert!(allowed.is_success());
            })
            .await
            .unwrap();
        assert!(!runtime.is_running().await);
    }
}
