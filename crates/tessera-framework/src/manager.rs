//! Plugin lifecycle management.
//!
//! [`PluginManager`] owns every plugin record and drives it through the
//! lifecycle:
//!
//! ```text
//! Registered ─► Initializing ─► Initialized ─► Starting ─► Running
//!                                                             │
//!                                  Stopped ◄── Stopping ◄─────┘
//!
//! any state except Failed ──(error or panic)──► Failed
//! ```
//!
//! - **Install** requires every declared dependency to be `Running`; there is
//!   no implicit auto-install.  [`install_batch`](PluginManager::install_batch)
//!   orders a supplied set topologically instead.
//! - **Rollback**: when `install` or `start` fails, the hooks, services and
//!   event subscriptions the plugin registered are removed and the plugin is
//!   left in `Failed`, never half-registered.
//! - **Uninstall** is refused while another active plugin depends on the
//!   target.
//! - Install, uninstall, remove and shutdown are serialised by one
//!   process-wide lock, even for independent plugins.  State reads never
//!   take it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tessera_core::{EventBus, ServiceRegistry};
use tokio::sync::Mutex as AsyncMutex;
use tower::BoxError;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::context::AppContext;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{
    HealthReport, HookRegistry, PLUGIN_FAILED, PLUGIN_INSTALLED, PLUGIN_UNINSTALLED, Plugin,
    PluginContext, PluginDescriptor, TESSERA_PLUGIN_API_VERSION,
};

// =============================================================================
// Topological sort utility
// =============================================================================

/// Computes an install order as **layers** via Kahn's algorithm.
///
/// Each inner `Vec<usize>` holds indices of plugins with no dependency on one
/// another; a layer only depends on earlier layers.  Uninstall order is
/// obtained by reversing the layers.
///
/// Edges are derived from [`Plugin::dependencies`] by name.  Dependencies
/// outside `plugins` are ignored here; install checks them against the live
/// records instead.
///
/// # Errors
///
/// Returns the names involved when a dependency cycle is detected.  A plugin
/// depending on itself counts as a cycle.
fn topological_layers(plugins: &[&Plugin]) -> Result<Vec<Vec<usize>>, Vec<String>> {
    let n = plugins.len();

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, plugin) in plugins.iter().enumerate() {
        if let Some(prev) = index.insert(plugin.name(), i) {
            warn!(
                plugin = %plugin.name(),
                first = prev,
                second = i,
                "Duplicate plugin name in set; ordering uses the last one"
            );
        }
    }

    // Build adjacency / in-degree tables.
    let mut in_degree: Vec<usize> = vec![0; n];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];

    for (i, plugin) in plugins.iter().enumerate() {
        for dep in plugin.dependencies() {
            if let Some(&provider) = index.get(dep.as_str()) {
                dependents[provider].push(i);
                in_degree[i] += 1;
            }
        }
    }

    // Kahn's algorithm, one layer per BFS frontier.
    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;

    while !current.is_empty() {
        processed += current.len();
        let mut next: Vec<usize> = Vec::new();
        for &i in &current {
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    next.push(j);
                }
            }
        }
        layers.push(current);
        current = next;
    }

    if processed != n {
        let cycle_nodes: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| plugins[i].name().to_string())
            .collect();
        return Err(cycle_nodes);
    }

    Ok(layers)
}

// =============================================================================
// PluginState
// =============================================================================

/// Lifecycle state of a plugin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Registered,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl PluginState {
    /// Forward steps only; `Failed` is reachable from every other state.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Registered, Initializing)
                | (Initializing, Initialized)
                | (Initialized, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
        ) || (next == Failed && self != Failed)
    }

    /// Returns `true` for every state except `Stopped` and `Failed`.
    pub fn is_active(self) -> bool {
        !matches!(self, PluginState::Stopped | PluginState::Failed)
    }
}

/// Snapshot of one plugin record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// =============================================================================
// PluginEntry (internal)
// =============================================================================

struct PluginEntry {
    plugin: Arc<Plugin>,
    state: PluginState,
    last_error: Option<String>,
}

/// Runs a plugin callback, turning errors and panics into a message.
async fn guarded<F>(fut: F) -> Result<(), String>
where
    F: Future<Output = Result<(), BoxError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("panicked".to_string()),
    }
}

fn lifecycle(plugin: &str, stage: &'static str, message: String) -> PluginError {
    PluginError::Lifecycle {
        plugin: plugin.to_string(),
        stage,
        message,
    }
}

// =============================================================================
// PluginManager
// =============================================================================

/// Owner of plugin records, their hooks and their lifecycle.
///
/// Services and subscriptions a plugin registers live in the shared
/// [`ServiceRegistry`] and [`EventBus`], tagged with the plugin's name; the
/// manager removes them by that tag on rollback and uninstall.
///
/// # Plugin configuration
///
/// Per-plugin config sections are set with [`set_config`](Self::set_config)
/// and handed to the plugin through [`PluginContext`] at install time.
pub struct PluginManager {
    /// Serialises every lifecycle operation.
    op_lock: AsyncMutex<()>,
    /// Records in first-install order.
    plugins: RwLock<Vec<PluginEntry>>,
    descriptors: RwLock<HashMap<String, PluginDescriptor>>,
    configs: RwLock<HashMap<String, Arc<Value>>>,
    hooks: Arc<HookRegistry>,
    services: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
}

impl PluginManager {
    pub fn new(services: Arc<ServiceRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            op_lock: AsyncMutex::new(()),
            plugins: RwLock::new(Vec::new()),
            descriptors: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            hooks: Arc::new(HookRegistry::new()),
            services,
            events,
        }
    }

    /// Creates a manager over the registries of `app`.
    pub fn from_app(app: &AppContext) -> Self {
        Self::new(Arc::clone(app.services()), Arc::clone(app.events()))
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Sets the config section handed to `plugin` on its next install.
    pub fn set_config(&self, plugin: impl Into<String>, config: Value) {
        self.configs.write().insert(plugin.into(), Arc::new(config));
    }

    fn config_for(&self, plugin: &str) -> Arc<Value> {
        self.configs
            .read()
            .get(plugin)
            .cloned()
            .unwrap_or_else(|| Arc::new(json!({})))
    }

    // ─── Descriptor table ────────────────────────────────────────────────────

    /// Adds a descriptor to the static plugin table.
    ///
    /// Descriptors built against an incompatible API version are rejected.
    pub fn register_descriptor(&self, desc: PluginDescriptor) -> PluginResult<()> {
        if !desc.is_compatible() {
            return Err(PluginError::IncompatibleApi {
                plugin: desc.name.to_string(),
                version: desc.api_version,
                host: TESSERA_PLUGIN_API_VERSION,
            });
        }
        if self
            .descriptors
            .write()
            .insert(desc.name.to_string(), desc)
            .is_some()
        {
            warn!(plugin = %desc.name, "Plugin descriptor replaced");
        } else {
            debug!(plugin = %desc.name, "Plugin descriptor registered");
        }
        Ok(())
    }

    pub fn has_descriptor(&self, name: &str) -> bool {
        self.descriptors.read().contains_key(name)
    }

    fn instantiate(&self, name: &str) -> PluginResult<Plugin> {
        self.descriptors
            .read()
            .get(name)
            .map(PluginDescriptor::instantiate)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Instantiates `name` from the descriptor table and installs it.
    pub async fn install_named(&self, name: &str) -> PluginResult<()> {
        let plugin = self.instantiate(name)?;
        self.install(plugin).await
    }

    /// Instantiates every name from the descriptor table and installs them
    /// as one batch.
    pub async fn install_batch_named(&self, names: &[String]) -> PluginResult<Vec<String>> {
        let plugins = names
            .iter()
            .map(|name| self.instantiate(name))
            .collect::<PluginResult<Vec<_>>>()?;
        self.install_batch(plugins).await
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.plugins
            .read()
            .iter()
            .find(|e| e.plugin.name() == name)
            .map(|e| e.state)
    }

    /// Message of the error that last moved `name` to `Failed`.
    pub fn last_error(&self, name: &str) -> Option<String> {
        self.plugins
            .read()
            .iter()
            .find(|e| e.plugin.name() == name)
            .and_then(|e| e.last_error.clone())
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .iter()
            .map(|e| PluginInfo {
                name: e.plugin.name().to_string(),
                version: e.plugin.version().to_string(),
                state: e.state,
                dependencies: e.plugin.dependencies().to_vec(),
                last_error: e.last_error.clone(),
            })
            .collect()
    }

    /// Active plugins that declare `name` as a dependency.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .filter(|e| e.state.is_active())
            .filter(|e| e.plugin.dependencies().iter().any(|d| d == name))
            .map(|e| e.plugin.name().to_string())
            .collect()
    }

    fn entry(&self, name: &str) -> Option<(Arc<Plugin>, PluginState)> {
        self.plugins
            .read()
            .iter()
            .find(|e| e.plugin.name() == name)
            .map(|e| (Arc::clone(&e.plugin), e.state))
    }

    // ─── Record bookkeeping ──────────────────────────────────────────────────

    /// Inserts a fresh `Registered` record, replacing a previous incarnation.
    fn insert_entry(&self, plugin: Arc<Plugin>) {
        let mut plugins = self.plugins.write();
        let fresh = PluginEntry {
            plugin,
            state: PluginState::Registered,
            last_error: None,
        };
        match plugins
            .iter_mut()
            .find(|e| e.plugin.name() == fresh.plugin.name())
        {
            Some(slot) => *slot = fresh,
            None => plugins.push(fresh),
        }
    }

    fn remove_entry(&self, name: &str) {
        self.plugins.write().retain(|e| e.plugin.name() != name);
    }

    fn transition(&self, name: &str, to: PluginState) -> PluginResult<()> {
        let mut plugins = self.plugins.write();
        let entry = plugins
            .iter_mut()
            .find(|e| e.plugin.name() == name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if !entry.state.can_transition_to(to) {
            return Err(PluginError::InvalidTransition {
                plugin: name.to_string(),
                from: entry.state,
                to,
            });
        }
        trace!(plugin = %name, from = ?entry.state, to = ?to, "Plugin state transition");
        entry.state = to;
        Ok(())
    }

    fn mark_failed(&self, name: &str, message: String) {
        let mut plugins = self.plugins.write();
        if let Some(entry) = plugins.iter_mut().find(|e| e.plugin.name() == name) {
            if entry.state != PluginState::Failed {
                trace!(plugin = %name, from = ?entry.state, "Plugin state transition to Failed");
                entry.state = PluginState::Failed;
            }
            entry.last_error = Some(message);
        }
    }

    /// Removes every hook, service and subscription tagged with `name`.
    async fn cleanup(&self, name: &str) {
        let hooks = self.hooks.remove_owned(name);
        let services = self.services.unregister_owned(name).await;
        let subscriptions = self.events.unsubscribe_all(name);
        debug!(
            plugin = %name,
            hooks,
            services = services.len(),
            subscriptions,
            "Plugin registrations removed"
        );
    }

    async fn fail(&self, name: &str, err: &PluginError) {
        self.cleanup(name).await;
        self.mark_failed(name, err.to_string());
        error!(plugin = %name, error = %err, "Plugin failed and was rolled back");
        self.events
            .publish(
                PLUGIN_FAILED,
                json!({ "name": name, "error": err.to_string() }),
            )
            .await;
    }

    // ─── Install ─────────────────────────────────────────────────────────────

    /// Installs and starts `plugin`.
    ///
    /// Fails with `MissingDependency` if a dependency is not `Running`, and
    /// with `AlreadyInstalled` if a record of the same name is active.  A
    /// plugin whose previous incarnation is `Stopped` or `Failed` starts a
    /// fresh lifecycle.
    pub async fn install(&self, plugin: Plugin) -> PluginResult<()> {
        let _op = self.op_lock.lock().await;
        self.install_locked(plugin).await
    }

    async fn install_locked(&self, plugin: Plugin) -> PluginResult<()> {
        let name = plugin.name().to_string();
        let span = info_span!("plugin", plugin = %name);
        async {
            if let Some(state) = self.state(&name)
                && state.is_active()
            {
                return Err(PluginError::AlreadyInstalled(name.clone()));
            }
            if let Some(missing) = plugin
                .dependencies()
                .iter()
                .find(|dep| self.state(dep) != Some(PluginState::Running))
            {
                return Err(PluginError::MissingDependency {
                    plugin: name.clone(),
                    dependency: missing.clone(),
                });
            }

            let plugin = Arc::new(plugin);
            self.insert_entry(Arc::clone(&plugin));

            if let Err(err) = self.bring_up(&plugin).await {
                self.fail(&name, &err).await;
                return Err(err);
            }

            info!(version = %plugin.version(), "Plugin installed");
            self.events
                .publish(PLUGIN_INSTALLED, json!({ "name": name }))
                .await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn bring_up(&self, plugin: &Arc<Plugin>) -> PluginResult<()> {
        let name = plugin.name();

        self.transition(name, PluginState::Initializing)?;
        for (hook, spec) in plugin.hooks() {
            self.hooks.register(hook.clone(), name, spec.clone());
        }
        let ctx = Arc::new(PluginContext::new(
            name,
            self.config_for(name),
            Arc::clone(&self.services),
            Arc::clone(&self.events),
            Span::current(),
        ));
        guarded(plugin.install(ctx))
            .await
            .map_err(|message| lifecycle(name, "install", message))?;
        self.transition(name, PluginState::Initialized)?;

        self.transition(name, PluginState::Starting)?;
        guarded(plugin.start())
            .await
            .map_err(|message| lifecycle(name, "start", message))?;
        self.transition(name, PluginState::Running)
    }

    /// Installs a set of plugins in dependency order.
    ///
    /// Dependencies between members of the set are ordered topologically;
    /// dependencies outside it must already be `Running`.  The first failure
    /// aborts the batch: every plugin installed earlier in the batch is
    /// stopped and removed, in reverse order, and `BatchFailed` is returned.
    ///
    /// Returns the installed names in install order.
    pub async fn install_batch(&self, plugins: Vec<Plugin>) -> PluginResult<Vec<String>> {
        let _op = self.op_lock.lock().await;

        let layers = {
            let refs: Vec<&Plugin> = plugins.iter().collect();
            topological_layers(&refs)
                .map_err(|plugins| PluginError::CyclicDependency { plugins })?
        };
        debug!(plugins = plugins.len(), layers = layers.len(), "Batch install order computed");

        let mut slots: Vec<Option<Plugin>> = plugins.into_iter().map(Some).collect();
        let mut installed: Vec<String> = Vec::new();

        for i in layers.into_iter().flatten() {
            let Some(plugin) = slots[i].take() else {
                continue;
            };
            let name = plugin.name().to_string();
            if let Err(err) = self.install_locked(plugin).await {
                warn!(
                    plugin = %name,
                    error = %err,
                    rolling_back = installed.len(),
                    "Batch install failed"
                );
                let rolled_back = self.roll_back(&installed).await;
                return Err(PluginError::BatchFailed {
                    plugin: name,
                    source: Box::new(err),
                    rolled_back,
                });
            }
            installed.push(name);
        }

        Ok(installed)
    }

    /// Stops and forgets `names` in reverse order.
    async fn roll_back(&self, names: &[String]) -> Vec<String> {
        let mut rolled_back = Vec::with_capacity(names.len());
        for name in names.iter().rev() {
            let span = info_span!("plugin", plugin = %name);
            async {
                if let Err(err) = self.tear_down(name).await {
                    warn!(error = %err, "Stop failed during batch rollback");
                }
                self.remove_entry(name);
            }
            .instrument(span)
            .await;
            rolled_back.push(name.clone());
        }
        rolled_back
    }

    // ─── Uninstall ───────────────────────────────────────────────────────────

    /// Stops `name` and removes everything it registered.
    ///
    /// Fails with `DependentExists` while an active plugin depends on it.
    pub async fn uninstall(&self, name: &str) -> PluginResult<()> {
        let _op = self.op_lock.lock().await;
        let span = info_span!("plugin", plugin = %name);
        self.uninstall_locked(name).instrument(span).await
    }

    async fn uninstall_locked(&self, name: &str) -> PluginResult<()> {
        if self.state(name).is_none() {
            return Err(PluginError::NotFound(name.to_string()));
        }
        let dependents = self.dependents_of(name);
        if !dependents.is_empty() {
            return Err(PluginError::DependentExists {
                plugin: name.to_string(),
                dependents,
            });
        }
        self.tear_down(name).await
    }

    async fn tear_down(&self, name: &str) -> PluginResult<()> {
        let (plugin, _) = self
            .entry(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        self.transition(name, PluginState::Stopping)?;
        let stopped = guarded(plugin.stop()).await;
        if let Err(message) = stopped {
            let err = lifecycle(name, "stop", message);
            self.fail(name, &err).await;
            return Err(err);
        }
        self.cleanup(name).await;
        self.transition(name, PluginState::Stopped)?;

        info!("Plugin uninstalled");
        self.events
            .publish(PLUGIN_UNINSTALLED, json!({ "name": name }))
            .await;
        Ok(())
    }

    /// Forgets a `Stopped` or `Failed` plugin with no active dependents.
    pub async fn remove(&self, name: &str) -> PluginResult<()> {
        let _op = self.op_lock.lock().await;
        let state = self
            .state(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if state.is_active() {
            return Err(PluginError::StillActive {
                plugin: name.to_string(),
                state,
            });
        }
        let dependents = self.dependents_of(name);
        if !dependents.is_empty() {
            return Err(PluginError::DependentExists {
                plugin: name.to_string(),
                dependents,
            });
        }
        self.remove_entry(name);
        info!(plugin = %name, "Plugin removed");
        Ok(())
    }

    /// Uninstalls every running plugin, dependents first.
    ///
    /// Failures are logged and do not stop the remaining plugins.
    pub async fn shutdown(&self) {
        let _op = self.op_lock.lock().await;

        let running: Vec<Arc<Plugin>> = self
            .plugins
            .read()
            .iter()
            .filter(|e| e.state == PluginState::Running)
            .map(|e| Arc::clone(&e.plugin))
            .collect();

        let order: Vec<usize> = {
            let refs: Vec<&Plugin> = running.iter().map(|p| p.as_ref()).collect();
            match topological_layers(&refs) {
                Ok(layers) => layers.into_iter().rev().flatten().collect(),
                Err(cycle) => {
                    error!(plugins = ?cycle, "Dependency cycle among running plugins");
                    (0..running.len()).rev().collect()
                }
            }
        };

        info!(plugins = order.len(), "Shutting down plugins");
        for i in order {
            let name = running[i].name();
            let span = info_span!("plugin", plugin = %name);
            if let Err(err) = self.uninstall_locked(name).instrument(span).await {
                error!(plugin = %name, error = %err, "Plugin failed to shut down cleanly");
            }
        }
    }

    // ─── Hooks & health ──────────────────────────────────────────────────────

    /// Runs every handler of `hook`; see [`HookRegistry::run`].
    pub async fn run_hook(&self, hook: &str, args: Value) -> PluginResult<Vec<Value>> {
        Ok(self.hooks.run(hook, args).await?)
    }

    /// Probes `name`.
    ///
    /// A running plugin without a health capability reports healthy; a
    /// plugin that is not running reports unhealthy.
    pub async fn health(&self, name: &str) -> PluginResult<HealthReport> {
        let (plugin, state) = self
            .entry(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if state != PluginState::Running {
            return Ok(HealthReport::unhealthy(format!("plugin is {state:?}")));
        }
        let report = match AssertUnwindSafe(plugin.health()).catch_unwind().await {
            Ok(Some(report)) => report,
            Ok(None) => HealthReport::healthy(),
            Err(_) => HealthReport::unhealthy("health check panicked"),
        };
        Ok(report)
    }

    /// Probes every plugin record.
    pub async fn health_all(&self) -> BTreeMap<String, HealthReport> {
        let names: Vec<String> = self
            .plugins
            .read()
            .iter()
            .map(|e| e.plugin.name().to_string())
            .collect();
        let mut reports = BTreeMap::new();
        for name in names {
            if let Ok(report) = self.health(&name).await {
                reports.insert(name, report);
            }
        }
        reports
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugins())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HealthStatus, HookSpec};
    use parking_lot::Mutex;
    use tessera_core::{ErrorKind, Event, ServiceOptions, SubscribeOptions};
    use tokio_test::{assert_err, assert_ok};

    type Log = Arc<Mutex<Vec<String>>>;

    fn manager() -> PluginManager {
        PluginManager::from_app(&AppContext::new())
    }

    fn plugin(name: &'static str, deps: &[&str]) -> Plugin {
        deps.iter()
            .fold(Plugin::builder(name), |b, dep| b.depends_on(*dep))
            .build()
    }

    /// A plugin that records `start:<name>` / `stop:<name>`.
    fn traced(name: &'static str, deps: &[&str], log: &Log) -> Plugin {
        let start_log = Arc::clone(log);
        let stop_log = Arc::clone(log);
        deps.iter()
            .fold(Plugin::builder(name), |b, dep| b.depends_on(*dep))
            .on_start(move || {
                start_log.lock().push(format!("start:{name}"));
                async { Ok(()) }
            })
            .on_stop(move || {
                stop_log.lock().push(format!("stop:{name}"));
                async { Ok(()) }
            })
            .build()
    }

    #[test]
    fn test_state_machine() {
        use PluginState::*;
        assert!(Registered.can_transition_to(Initializing));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Initializing));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Stopped.is_active());
        assert!(Starting.is_active());
    }

    #[tokio::test]
    async fn test_dependency_must_be_running() {
        let mgr = manager();
        let err = assert_err!(mgr.install(plugin("b", &["a"])).await);
        assert_eq!(err.kind(), ErrorKind::MissingDependencyError);
        assert_eq!(mgr.state("b"), None);

        assert_ok!(mgr.install(plugin("a", &[])).await);
        assert_ok!(mgr.install(plugin("b", &["a"])).await);
        assert_eq!(mgr.state("a"), Some(PluginState::Running));
        assert_eq!(mgr.state("b"), Some(PluginState::Running));
    }

    #[tokio::test]
    async fn test_uninstall_refused_while_dependent_runs() {
        let mgr = manager();
        mgr.install(plugin("a", &[])).await.unwrap();
        mgr.install(plugin("b", &["a"])).await.unwrap();

        match mgr.uninstall("a").await {
            Err(PluginError::DependentExists { dependents, .. }) => {
                assert_eq!(dependents, vec!["b"]);
            }
            other => panic!("expected DependentExists, got {other:?}"),
        }
        assert_eq!(mgr.state("a"), Some(PluginState::Running));

        mgr.uninstall("b").await.unwrap();
        mgr.uninstall("a").await.unwrap();
        assert_eq!(mgr.state("a"), Some(PluginState::Stopped));
        assert_eq!(mgr.state("b"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_registrations() {
        let mgr = manager();
        let failures: Log = Arc::default();
        let sink = Arc::clone(&failures);
        mgr.events.subscribe(
            PLUGIN_FAILED,
            SubscribeOptions::default(),
            move |event: Arc<Event>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(event.payload["name"].to_string());
                    Ok(())
                }
            },
        );

        let broken = Plugin::builder("broken")
            .hook("render", HookSpec::new(|v: Value| async move { Ok(v) }))
            .on_install(|ctx: Arc<PluginContext>| async move {
                ctx.register_service("broken.api", Arc::new(1u32)).await?;
                ctx.subscribe("tick", 0, |_: Arc<Event>| async { Ok(()) });
                Ok(())
            })
            .on_start(|| async { Err::<(), BoxError>("port in use".into()) })
            .build();

        match mgr.install(broken).await {
            Err(PluginError::Lifecycle { stage, message, .. }) => {
                assert_eq!(stage, "start");
                assert_eq!(message, "port in use");
            }
            other => panic!("expected Lifecycle, got {other:?}"),
        }
        assert_eq!(mgr.state("broken"), Some(PluginState::Failed));
        assert!(mgr.last_error("broken").unwrap().contains("port in use"));
        assert!(!mgr.services.contains("broken.api"));
        assert_eq!(mgr.hooks().handler_count("render"), 0);
        assert_eq!(mgr.events.subscriber_count("tick"), 0);
        assert_eq!(*failures.lock(), vec!["\"broken\""]);
    }

    #[tokio::test]
    async fn test_failed_override_removes_service_without_restoring() {
        let mgr = manager();
        let base = Plugin::builder("base")
            .on_install(|ctx: Arc<PluginContext>| async move {
                ctx.register_service("cache", Arc::new("memory".to_string())).await?;
                Ok(())
            })
            .build();
        let shadow = Plugin::builder("shadow")
            .depends_on("base")
            .on_install(|ctx: Arc<PluginContext>| async move {
                let options = ServiceOptions::default().override_existing();
                ctx.register_service_with("cache", Arc::new("redis".to_string()), options)
                    .await?;
                Ok(())
            })
            .on_start(|| async { Err::<(), BoxError>("redis unreachable".into()) })
            .build();

        assert_ok!(mgr.install(base).await);
        assert_eq!(mgr.services.owner_of("cache").as_deref(), Some("base"));
        assert_err!(mgr.install(shadow).await);

        // The override is dropped with its owner; base's provider does not come back.
        assert_eq!(mgr.state("shadow"), Some(PluginState::Failed));
        assert_eq!(mgr.state("base"), Some(PluginState::Running));
        assert!(!mgr.services.contains("cache"));
        assert_eq!(mgr.services.owner_of("cache"), None);
    }

    #[tokio::test]
    async fn test_panicking_install_is_contained() {
        let mgr = manager();
        let buggy = Plugin::builder("buggy")
            .on_install(|_ctx: Arc<PluginContext>| async {
                let broken = true;
                if broken {
                    panic!("install bug");
                }
                Ok(())
            })
            .build();

        let err = mgr.install(buggy).await.unwrap_err();
        assert!(matches!(err, PluginError::Lifecycle { stage: "install", .. }));
        assert_eq!(mgr.state("buggy"), Some(PluginState::Failed));
    }

    #[tokio::test]
    async fn test_reinstall_after_stop() {
        let mgr = manager();
        mgr.install(plugin("a", &[])).await.unwrap();
        assert!(matches!(
            mgr.install(plugin("a", &[])).await,
            Err(PluginError::AlreadyInstalled(_))
        ));

        mgr.uninstall("a").await.unwrap();
        mgr.install(plugin("a", &[])).await.unwrap();
        assert_eq!(mgr.state("a"), Some(PluginState::Running));
        assert_eq!(mgr.plugins().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_installs_in_dependency_order() {
        let log: Log = Arc::default();
        let mgr = manager();
        let installed = mgr
            .install_batch(vec![
                traced("c", &["b"], &log),
                traced("b", &["a"], &log),
                traced("a", &[], &log),
            ])
            .await
            .unwrap();

        assert_eq!(installed, vec!["a", "b", "c"]);
        assert_eq!(*log.lock(), vec!["start:a", "start:b", "start:c"]);
    }

    #[tokio::test]
    async fn test_batch_cycle_is_rejected() {
        let mgr = manager();
        let err = mgr
            .install_batch(vec![
                plugin("x", &["y"]),
                plugin("y", &["x"]),
                plugin("z", &[]),
            ])
            .await
            .unwrap_err();

        match err {
            PluginError::CyclicDependency { mut plugins } => {
                plugins.sort();
                assert_eq!(plugins, vec!["x", "y"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
        assert!(mgr.plugins().is_empty());
    }

    #[tokio::test]
    async fn test_batch_failure_rolls_back_earlier_plugins() {
        let log: Log = Arc::default();
        let mgr = manager();
        let failing = Plugin::builder("b")
            .depends_on("a")
            .on_start(|| async { Err::<(), BoxError>("boom".into()) })
            .build();

        let err = mgr
            .install_batch(vec![failing, traced("a", &[], &log)])
            .await
            .unwrap_err();

        match err {
            PluginError::BatchFailed {
                plugin,
                rolled_back,
                ..
            } => {
                assert_eq!(plugin, "b");
                assert_eq!(rolled_back, vec!["a"]);
            }
            other => panic!("expected BatchFailed, got {other:?}"),
        }
        assert_eq!(*log.lock(), vec!["start:a", "stop:a"]);
        assert_eq!(mgr.state("a"), None);
        assert_eq!(mgr.state("b"), Some(PluginState::Failed));
    }

    #[tokio::test]
    async fn test_required_hook_failure_reaches_caller() {
        let mgr = manager();
        let strict = Plugin::builder("strict")
            .hook(
                "save",
                HookSpec::new(|_: Value| async { Err::<Value, BoxError>("disk full".into()) })
                    .required(true),
            )
            .build();
        mgr.install(strict).await.unwrap();

        let err = mgr.run_hook("save", json!({})).await.unwrap_err();
        assert!(matches!(err, PluginError::Hook(_)));

        mgr.uninstall("strict").await.unwrap();
        assert!(mgr.run_hook("save", json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_reports() {
        let mgr = manager();
        mgr.install(plugin("plain", &[])).await.unwrap();
        mgr.install(
            Plugin::builder("slow")
                .on_health(|| async { HealthReport::degraded("upstream latency") })
                .build(),
        )
        .await
        .unwrap();

        assert_eq!(
            mgr.health("plain").await.unwrap().status,
            HealthStatus::Healthy
        );
        assert_eq!(
            mgr.health("slow").await.unwrap().status,
            HealthStatus::Degraded
        );

        mgr.uninstall("plain").await.unwrap();
        let all = mgr.health_all().await;
        assert_eq!(all["plain"].status, HealthStatus::Unhealthy);
        assert!(mgr.health("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_dependents_first() {
        let log: Log = Arc::default();
        let mgr = manager();
        mgr.install(traced("a", &[], &log)).await.unwrap();
        mgr.install(traced("b", &["a"], &log)).await.unwrap();
        log.lock().clear();

        mgr.shutdown().await;
        assert_eq!(*log.lock(), vec!["stop:b", "stop:a"]);
        assert_eq!(mgr.state("a"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn test_remove_requires_inactive_plugin() {
        let mgr = manager();
        mgr.install(plugin("a", &[])).await.unwrap();
        assert!(matches!(
            mgr.remove("a").await,
            Err(PluginError::StillActive { .. })
        ));
        mgr.uninstall("a").await.unwrap();
        mgr.remove("a").await.unwrap();
        assert_eq!(mgr.state("a"), None);
    }

    fn configured() -> Plugin {
        Plugin::builder("configured")
            .on_install(|ctx: Arc<PluginContext>| async move {
                let greeting = ctx.config()["greeting"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                ctx.register_service("greeting", Arc::new(greeting)).await?;
                Ok(())
            })
            .build()
    }

    #[tokio::test]
    async fn test_descriptor_table_and_config() {
        let mgr = manager();
        mgr.register_descriptor(PluginDescriptor::new("configured", configured))
            .unwrap();
        mgr.set_config("configured", json!({ "greeting": "hello" }));

        let stale = PluginDescriptor {
            api_version: 0x0002_0000,
            ..PluginDescriptor::new("stale", configured)
        };
        assert!(matches!(
            mgr.register_descriptor(stale),
            Err(PluginError::IncompatibleApi { .. })
        ));
        assert!(matches!(
            mgr.install_named("unknown").await,
            Err(PluginError::NotFound(_))
        ));

        mgr.install_named("configured").await.unwrap();
        let greeting = mgr.services.get::<String>("greeting").unwrap();
        assert_eq!(greeting.as_str(), "hello");
    }
}
