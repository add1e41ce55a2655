//! Named service directory.
//!
//! Plugins populate the [`ServiceRegistry`] during install; handlers and
//! other plugins look services up by name.  Each name maps to one provider:
//!
//! | Mode | Behaviour of [`get`](ServiceRegistry::get) |
//! |------|------------------------------------------|
//! | [`ServiceMode::Instance`]  | returns the registered instance |
//! | [`ServiceMode::Singleton`] | runs the factory on first `get`, then returns the cached value |
//! | [`ServiceMode::Transient`] | runs the factory on every `get` |
//!
//! Registration and removal are announced on the [`EventBus`] under
//! [`SERVICE_REGISTERED`] and [`SERVICE_REMOVED`] with a `{ "name": … }`
//! payload.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::event::{EventBus, SERVICE_REGISTERED, SERVICE_REMOVED};

/// A type-erased service value.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

/// A type-erased service factory.
pub type ServiceFactory = Arc<dyn Fn() -> ServiceArc + Send + Sync>;

/// How a registration produces its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Instance,
    Singleton,
    Transient,
}

#[derive(Clone)]
enum Provider {
    Instance(ServiceArc),
    Singleton {
        factory: ServiceFactory,
        cell: Arc<OnceLock<ServiceArc>>,
    },
    Transient(ServiceFactory),
}

impl Provider {
    fn mode(&self) -> ServiceMode {
        match self {
            Self::Instance(_) => ServiceMode::Instance,
            Self::Singleton { .. } => ServiceMode::Singleton,
            Self::Transient(_) => ServiceMode::Transient,
        }
    }

    fn resolve(&self) -> ServiceArc {
        match self {
            Self::Instance(value) => Arc::clone(value),
            Self::Singleton { factory, cell } => Arc::clone(cell.get_or_init(|| factory())),
            Self::Transient(factory) => factory(),
        }
    }
}

struct Registration {
    provider: Provider,
    owner: Option<String>,
    type_name: &'static str,
}

/// Options for a registration.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Replace an existing registration instead of failing.
    pub override_existing: bool,
    /// Owner tag used by [`ServiceRegistry::unregister_owned`].
    pub owner: Option<String>,
}

impl ServiceOptions {
    pub fn override_existing(mut self) -> Self {
        self.override_existing = true;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Process-wide service directory.
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    events: Arc<EventBus>,
}

impl ServiceRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// The bus registry notifications are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Registers a ready-made instance.
    pub async fn register_instance<T>(
        &self,
        name: impl Into<String>,
        instance: Arc<T>,
        options: ServiceOptions,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
    {
        let provider = Provider::Instance(instance);
        self.insert(name.into(), provider, std::any::type_name::<T>(), options)
            .await
    }

    /// Registers a factory invoked once, on first lookup.
    pub async fn register_singleton<T, F>(
        &self,
        name: impl Into<String>,
        factory: F,
        options: ServiceOptions,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let provider = Provider::Singleton {
            factory: erase(factory),
            cell: Arc::new(OnceLock::new()),
        };
        self.insert(name.into(), provider, std::any::type_name::<T>(), options)
            .await
    }

    /// Registers a factory invoked on every lookup.
    pub async fn register_transient<T, F>(
        &self,
        name: impl Into<String>,
        factory: F,
        options: ServiceOptions,
    ) -> RegistryResult<()>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let provider = Provider::Transient(erase(factory));
        self.insert(name.into(), provider, std::any::type_name::<T>(), options)
            .await
    }

    async fn insert(
        &self,
        name: String,
        provider: Provider,
        type_name: &'static str,
        options: ServiceOptions,
    ) -> RegistryResult<()> {
        let mode = provider.mode();
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&name) && !options.override_existing {
                return Err(RegistryError::DuplicateService(name));
            }
            entries.insert(
                name.clone(),
                Registration {
                    provider,
                    owner: options.owner.clone(),
                    type_name,
                },
            );
        }

        info!(
            service = %name,
            mode = ?mode,
            owner = options.owner.as_deref().unwrap_or("-"),
            "Service registered"
        );
        self.events
            .publish(SERVICE_REGISTERED, json!({ "name": name }))
            .await;
        Ok(())
    }

    // ─── Lookup ──────────────────────────────────────────────────────────────

    /// Returns the service under `name` as `T`.
    ///
    /// `None` when the name is unknown or the stored value is not a `T`.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.get_any(name)?;
        match value.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                debug!(
                    service = %name,
                    requested = std::any::type_name::<T>(),
                    "Service type mismatch"
                );
                None
            }
        }
    }

    /// Returns the type-erased service under `name`.
    pub fn get_any(&self, name: &str) -> Option<ServiceArc> {
        // Factories run outside the lock.
        let provider = self.entries.read().get(name).map(|r| r.provider.clone())?;
        Some(provider.resolve())
    }

    pub fn mode(&self, name: &str) -> Option<ServiceMode> {
        self.entries.read().get(name).map(|r| r.provider.mode())
    }

    /// Name of the plugin that registered `name`, if any.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.entries.read().get(name).and_then(|r| r.owner.clone())
    }

    /// Rust type name recorded at registration.
    pub fn type_name_of(&self, name: &str) -> Option<&'static str> {
        self.entries.read().get(name).map(|r| r.type_name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ─── Removal ─────────────────────────────────────────────────────────────

    /// Removes `name`.  Returns `false` if it was not registered.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            debug!(service = %name, "Service unregistered");
            self.events
                .publish(SERVICE_REMOVED, json!({ "name": name }))
                .await;
        }
        removed
    }

    /// Removes every service registered by `owner`, returning the removed
    /// names in sorted order.
    ///
    /// A name `owner` took over with `override_existing` is removed as well;
    /// the registration it replaced is gone and is not restored.
    pub async fn unregister_owned(&self, owner: &str) -> Vec<String> {
        let mut removed: Vec<String> = {
            let mut entries = self.entries.write();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, r)| r.owner.as_deref() == Some(owner))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                entries.remove(name);
            }
            names
        };
        removed.sort();

        for name in &removed {
            self.events
                .publish(SERVICE_REMOVED, json!({ "name": name }))
                .await;
        }
        if !removed.is_empty() {
            debug!(owner = %owner, removed = removed.len(), "Removed owned services");
        }
        removed
    }
}

fn erase<T, F>(factory: F) -> ServiceFactory
where
    T: Any + Send + Sync,
    F: Fn() -> T + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(factory()) as ServiceArc)
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::event::SubscribeOptions;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_duplicate_requires_override() {
        let services = registry();
        services
            .register_instance("cache", Arc::new(1u32), ServiceOptions::default())
            .await
            .unwrap();

        let err = services
            .register_instance("cache", Arc::new(2u32), ServiceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateServiceError);
        assert_eq!(*services.get::<u32>("cache").unwrap(), 1);

        services
            .register_instance(
                "cache",
                Arc::new(3u32),
                ServiceOptions::default().override_existing(),
            )
            .await
            .unwrap();
        assert_eq!(*services.get::<u32>("cache").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_singleton_factory_runs_once() {
        let services = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        services
            .register_singleton(
                "db",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    String::from("pool")
                },
                ServiceOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let a = services.get::<String>("db").unwrap();
        let b = services.get::<String>("db").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(services.mode("db"), Some(ServiceMode::Singleton));
    }

    #[tokio::test]
    async fn test_transient_factory_runs_every_time() {
        let services = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        services
            .register_transient(
                "id",
                move || counter.fetch_add(1, Ordering::SeqCst),
                ServiceOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(*services.get::<usize>("id").unwrap(), 0);
        assert_eq!(*services.get::<usize>("id").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_mismatched_lookups() {
        let services = registry();
        assert!(services.get::<u32>("nope").is_none());

        services
            .register_instance("n", Arc::new(5u32), ServiceOptions::default())
            .await
            .unwrap();
        assert!(services.get::<String>("n").is_none());
        assert!(services.get_any("n").is_some());
    }

    #[tokio::test]
    async fn test_unregister_publishes_removed_event() {
        let services = registry();
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&seen);
        services
            .events()
            .subscribe(SERVICE_REMOVED, SubscribeOptions::default(), move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(event.payload.clone());
                    Ok(())
                }
            });

        services
            .register_instance("cache", Arc::new(()), ServiceOptions::default())
            .await
            .unwrap();
        assert!(services.unregister("cache").await);
        assert!(!services.unregister("cache").await);
        assert_eq!(*seen.lock(), vec![json!({ "name": "cache" })]);
    }

    #[tokio::test]
    async fn test_unregister_owned() {
        let services = registry();
        let opts = ServiceOptions::default().owner("weather");
        services
            .register_instance("b", Arc::new(()), opts.clone())
            .await
            .unwrap();
        services
            .register_instance("a", Arc::new(()), opts)
            .await
            .unwrap();
        services
            .register_instance("c", Arc::new(()), ServiceOptions::default().owner("auth"))
            .await
            .unwrap();

        assert_eq!(services.owner_of("a").as_deref(), Some("weather"));
        assert_eq!(services.unregister_owned("weather").await, vec!["a", "b"]);
        assert_eq!(services.names(), vec!["c"]);
    }
}
