//! In-process event bus for fire-and-forget notifications between plugins.
//!
//! Handlers are registered per event name. `emit` fans the event out to every
//! handler concurrently; a failing or panicking handler is logged and counted
//! but never affects the emitter or the other handlers. There is no ordering
//! guarantee between handlers of one event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::kernel::recovery::with_recovery_async;
use crate::types::Result;

// =============================================================================
// Event Types
// =============================================================================

/// A single emitted event, shared by reference with every handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Receives events the handler was subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Shared handler reference. Identity (for unsubscribe) is the allocation.
pub type SharedHandler = Arc<dyn EventHandler>;

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Build a [`SharedHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |event: Event| f(event).boxed(),
    })
}

fn same_handler(a: &SharedHandler, b: &SharedHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

// =============================================================================
// EventBus
// =============================================================================

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub handler_failures: u64,
    pub active_subscriptions: usize,
}

/// Publish/subscribe bus keyed by event name.
pub struct EventBus {
    /// event name -> handlers in subscription order
    subscriptions: RwLock<HashMap<String, Vec<SharedHandler>>>,
    stats: RwLock<BusStats>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            stats: RwLock::new(BusStats::default()),
        }
    }

    /// Subscribe `handler` to `event`. Returns `false` if it was already
    /// subscribed to that event.
    pub async fn subscribe(&self, event: impl Into<String>, handler: SharedHandler) -> bool {
        let event = event.into();
        let mut subs = self.subscriptions.write().await;
        let handlers = subs.entry(event.clone()).or_default();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        drop(subs);

        self.stats.write().await.active_subscriptions += 1;
        tracing::debug!("event_subscribed: event={}", event);
        true
    }

    /// Remove `handler` from `event`. Returns `false` if it was not subscribed.
    pub async fn unsubscribe(&self, event: &str, handler: &SharedHandler) -> bool {
        let mut subs = self.subscriptions.write().await;
        let Some(handlers) = subs.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        let removed = handlers.len() < before;
        if handlers.is_empty() {
            subs.remove(event);
        }
        drop(subs);

        if removed {
            let mut stats = self.stats.write().await;
            stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
            tracing::debug!("event_unsubscribed: event={}", event);
        }
        removed
    }

    /// Deliver `data` to every handler of `event` concurrently.
    ///
    /// Returns the number of handlers that completed without error.
    pub async fn emit(&self, event: &str, data: serde_json::Value) -> usize {
        let handlers: Vec<SharedHandler> = {
            let subs = self.subscriptions.read().await;
            subs.get(event).cloned().unwrap_or_default()
        };
        self.stats.write().await.events_emitted += 1;
        if handlers.is_empty() {
            return 0;
        }

        let event = Event {
            name: event.to_string(),
            data,
            emitted_at: Utc::now(),
        };
        let operation = format!("event_handler:{}", event.name);
        let results = join_all(
            handlers
                .iter()
                .map(|h| with_recovery_async(h.handle(&event), &operation)),
        )
        .await;

        let mut ok = 0;
        let mut failed = 0u64;
        for result in results {
            match result {
                Ok(()) => ok += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!("event_handler_failed: event={}, error={}", event.name, e);
                }
            }
        }
        if failed > 0 {
            self.stats.write().await.handler_failures += failed;
        }
        ok
    }

    /// Number of handlers subscribed to `event`.
    pub async fn handler_count(&self, event: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription.
    pub async fn clear(&self) {
        self.subscriptions.write().await.clear();
        self.stats.write().await.active_subscriptions = 0;
        tracing::debug!("event_bus_cleared");
    }

    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
