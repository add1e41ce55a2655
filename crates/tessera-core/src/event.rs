//! In-process publish/subscribe.
//!
//! Delivery is at-most-once and best-effort.  [`EventBus::publish`] runs every
//! subscriber of a channel sequentially, highest priority first (ties in
//! subscription order).  A failing or panicking subscriber is logged and
//! skipped; it never stops the remaining subscribers and never reaches the
//! publisher.
//!
//! Subscriptions are kept in an arena keyed by owner so a plugin's
//! subscriptions can be dropped in one call to
//! [`unsubscribe_all`](EventBus::unsubscribe_all) when it is uninstalled.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tower::BoxError;
use tracing::{debug, error, trace, warn};

/// Channel published when a service is registered.
pub const SERVICE_REGISTERED: &str = "service:registered";
/// Channel published when a service is unregistered.
pub const SERVICE_REMOVED: &str = "service:removed";

/// A published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub channel: String,
    pub payload: Value,
}

/// Type-erased subscriber callback.
pub type EventHandler =
    Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Identifier returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Options for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Owner tag used by [`EventBus::unsubscribe_all`].
    pub owner: Option<String>,
}

impl SubscribeOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

struct Subscription {
    id: SubscriptionId,
    priority: i32,
    owner: Option<String>,
    handler: EventHandler,
}

#[derive(Default)]
struct Arena {
    /// Per channel, sorted by priority descending then id ascending.
    channels: HashMap<String, Vec<Arc<Subscription>>>,
    /// Subscription id → channel.
    index: HashMap<SubscriptionId, String>,
    /// Owner → subscription ids.
    owners: HashMap<String, Vec<SubscriptionId>>,
}

/// Process-wide event bus.
pub struct EventBus {
    next_id: AtomicU64,
    arena: RwLock<Arena>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Subscribes `handler` to `channel`.
    pub fn subscribe<F, Fut>(
        &self,
        channel: impl Into<String>,
        options: SubscribeOptions,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        self.subscribe_boxed(channel.into(), options, handler)
    }

    /// Subscribes an already type-erased handler.
    pub fn subscribe_boxed(
        &self,
        channel: String,
        options: SubscribeOptions,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscription {
            id,
            priority: options.priority,
            owner: options.owner.clone(),
            handler,
        });

        let mut arena = self.arena.write();
        let list = arena.channels.entry(channel.clone()).or_default();
        // Insert after every subscription with priority >= ours to keep ties in
        // registration order.
        let pos = list.partition_point(|s| s.priority >= sub.priority);
        list.insert(pos, sub);
        arena.index.insert(id, channel.clone());
        if let Some(owner) = options.owner {
            arena.owners.entry(owner).or_default().push(id);
        }

        trace!(channel = %channel, subscription = id.0, "Subscribed");
        id
    }

    /// Removes a single subscription.  Returns `false` if it was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut arena = self.arena.write();
        let Some(channel) = arena.index.remove(&id) else {
            return false;
        };
        let mut owner = None;
        if let Some(list) = arena.channels.get_mut(&channel) {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                owner = list.remove(pos).owner.clone();
            }
            if list.is_empty() {
                arena.channels.remove(&channel);
            }
        }
        if let Some(owner) = owner
            && let Some(ids) = arena.owners.get_mut(&owner)
        {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                arena.owners.remove(&owner);
            }
        }
        true
    }

    /// Removes every subscription owned by `owner` and returns how many were
    /// removed.
    pub fn unsubscribe_all(&self, owner: &str) -> usize {
        let mut arena = self.arena.write();
        let Some(ids) = arena.owners.remove(owner) else {
            return 0;
        };
        for id in &ids {
            let Some(channel) = arena.index.remove(id) else {
                continue;
            };
            if let Some(list) = arena.channels.get_mut(&channel) {
                list.retain(|s| s.id != *id);
                if list.is_empty() {
                    arena.channels.remove(&channel);
                }
            }
        }
        debug!(owner = %owner, removed = ids.len(), "Removed owned subscriptions");
        ids.len()
    }

    /// Number of subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.arena
            .read()
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Publishes `payload` on `channel`.
    ///
    /// Subscribers are snapshotted before the first one runs, so subscribing
    /// or unsubscribing from inside a handler affects the next publish only.
    /// Returns the number of subscribers that completed successfully.
    pub async fn publish(&self, channel: &str, payload: Value) -> usize {
        let subscribers: Vec<Arc<Subscription>> = self
            .arena
            .read()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default();
        if subscribers.is_empty() {
            return 0;
        }

        let event = Arc::new(Event {
            channel: channel.to_string(),
            payload,
        });
        let mut delivered = 0;

        for sub in subscribers {
            let handler = Arc::clone(&sub.handler);
            let ev = Arc::clone(&event);
            let outcome = AssertUnwindSafe(async move { handler(ev).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    channel = %channel,
                    subscription = sub.id.0,
                    owner = sub.owner.as_deref().unwrap_or("-"),
                    error = %e,
                    "Event subscriber failed"
                ),
                Err(_) => error!(
                    channel = %channel,
                    subscription = sub.id.0,
                    owner = sub.owner.as_deref().unwrap_or("-"),
                    "Event subscriber panicked"
                ),
            }
        }

        delivered
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.read();
        f.debug_struct("EventBus")
            .field("channels", &arena.channels.len())
            .field("subscriptions", &arena.index.len())
            .finish()
    }
}
