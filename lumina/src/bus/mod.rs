//! Central event bus: the only in-process communication mechanism between
//! components that are not directly wired at startup.
//!
//! Supports direct and glob-wildcard subscriptions (`plugin.*`), a payload
//! schema registry with major-version gating, and a name-keyed service
//! registry for plugin-to-plugin discovery.
//!
//! Dispatch semantics: within one `emit`, direct subscribers run in
//! subscription order, then wildcard subscribers in subscription order. A
//! handler error is logged with its subscription id and never reaches the
//! emitter; the bus cannot be poisoned.

mod schema;

pub mod events;

pub use schema::EventSchema;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// One delivered event. Immutable after emission.
#[derive(Clone, Debug)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    pub source: String,
    /// Unix timestamp in seconds at emission.
    pub timestamp: f64,
}

/// Opaque handle returned by [`EventBus::subscribe`]; pass to `unsubscribe`.
pub type SubscriptionId = u64;

/// Handler outcome; an `Err` is logged and swallowed by the bus.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Boxed async event handler.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

struct WildcardSubscription {
    id: SubscriptionId,
    pattern: glob::Pattern,
    handler: Handler,
}

/// Central event bus.
///
/// **Interaction**: built once by [`crate::Lifecycle`]; every component holds
/// an `Arc<EventBus>`. Plugins reach it through their context handle.
pub struct EventBus {
    subscriptions: RwLock<std::collections::HashMap<String, Vec<Subscription>>>,
    wildcard_subscriptions: RwLock<Vec<WildcardSubscription>>,
    schemas: RwLock<std::collections::HashMap<String, EventSchema>>,
    services: DashMap<String, Arc<dyn Any + Send + Sync>>,
    next_sub_id: AtomicU64,
    /// id -> event type ("*"-containing types live in the wildcard list).
    sub_index: DashMap<SubscriptionId, String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(std::collections::HashMap::new()),
            wildcard_subscriptions: RwLock::new(Vec::new()),
            schemas: RwLock::new(std::collections::HashMap::new()),
            services: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
            sub_index: DashMap::new(),
        }
    }

    /// Registers a payload schema for an event type. Subsequent emits of that
    /// type validate against it; invalid payloads are dropped (see [`emit`]).
    ///
    /// [`emit`]: EventBus::emit
    pub fn register_schema(&self, event_type: impl Into<String>, schema: EventSchema) {
        let event_type = event_type.into();
        debug!(event_type = %event_type, version = %schema.version, "registered event schema");
        if let Ok(mut schemas) = self.schemas.write() {
            schemas.insert(event_type, schema);
        }
    }

    /// Subscribes a handler to an event type. Types containing `*` are glob
    /// patterns matched against the full event type at dispatch.
    pub fn subscribe(&self, event_type: &str, handler: Handler) -> SubscriptionId {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        if event_type.contains('*') {
            match glob::Pattern::new(event_type) {
                Ok(pattern) => {
                    if let Ok(mut wild) = self.wildcard_subscriptions.write() {
                        wild.push(WildcardSubscription {
                            id,
                            pattern,
                            handler,
                        });
                    }
                }
                Err(e) => {
                    // The id stays valid for unsubscribe but never matches.
                    warn!(pattern = %event_type, error = %e, "invalid wildcard pattern; subscription is inert");
                }
            }
            self.sub_index.insert(id, format!("*{event_type}"));
        } else {
            if let Ok(mut subs) = self.subscriptions.write() {
                subs.entry(event_type.to_string())
                    .or_default()
                    .push(Subscription { id, handler });
            }
            self.sub_index.insert(id, event_type.to_string());
        }
        debug!(event_type = %event_type, sub_id = id, "subscribed");
        id
    }

    /// Convenience wrapper: subscribe with an async closure.
    pub fn subscribe_fn<F, Fut>(&self, event_type: &str, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(move |event| Box::pin(f(event))))
    }

    /// Removes a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, key)) = self.sub_index.remove(&id) else {
            return false;
        };
        if key.starts_with('*') {
            if let Ok(mut wild) = self.wildcard_subscriptions.write() {
                wild.retain(|s| s.id != id);
            }
        } else if let Ok(mut subs) = self.subscriptions.write() {
            if let Some(list) = subs.get_mut(&key) {
                list.retain(|s| s.id != id);
                if list.is_empty() {
                    subs.remove(&key);
                }
            }
        }
        debug!(sub_id = id, "unsubscribed");
        true
    }

    /// Number of live subscriptions (direct + wildcard).
    pub fn subscription_count(&self) -> usize {
        self.sub_index.len()
    }

    fn validate(&self, event_type: &str, data: &Value, emitter_version: Option<&str>) -> bool {
        let schemas = match self.schemas.read() {
            Ok(s) => s,
            Err(_) => return true,
        };
        let Some(schema) = schemas.get(event_type) else {
            return true;
        };
        if let Some(version) = emitter_version {
            if !schema.major_matches(version) {
                error!(
                    event_type = %event_type,
                    registered = %schema.version,
                    emitter = %version,
                    "event rejected: schema major version mismatch"
                );
                return false;
            }
        }
        if let Err(e) = schema.validate(data) {
            error!(event_type = %event_type, error = %e, "event validation failed; dropped");
            return false;
        }
        true
    }

    fn matching_handlers(&self, event_type: &str) -> Vec<(SubscriptionId, Handler)> {
        let mut handlers = Vec::new();
        if let Ok(subs) = self.subscriptions.read() {
            if let Some(list) = subs.get(event_type) {
                for sub in list {
                    handlers.push((sub.id, Arc::clone(&sub.handler)));
                }
            }
        }
        if let Ok(wild) = self.wildcard_subscriptions.read() {
            for sub in wild.iter() {
                if sub.pattern.matches(event_type) {
                    handlers.push((sub.id, Arc::clone(&sub.handler)));
                }
            }
        }
        handlers
    }

    /// Emits an event to all matching subscribers and returns how many
    /// handlers ran. Validation failure returns 0 without raising; individual
    /// handler errors are logged and do not prevent later handlers.
    pub async fn emit(&self, event_type: &str, data: Value, source: &str) -> u32 {
        self.emit_versioned(event_type, data, source, None).await
    }

    /// [`emit`](EventBus::emit) with the schema version the emitter was built
    /// against; rejected when the major component differs from the registered
    /// schema.
    pub async fn emit_versioned(
        &self,
        event_type: &str,
        data: Value,
        source: &str,
        emitter_version: Option<&str>,
    ) -> u32 {
        if !self.validate(event_type, &data, emitter_version) {
            return 0;
        }

        let event = Event {
            event_type: event_type.to_string(),
            data,
            source: source.to_string(),
            timestamp: unix_now(),
        };

        let handlers = self.matching_handlers(event_type);
        let mut called = 0u32;
        for (sub_id, handler) in handlers {
            match handler(event.clone()).await {
                Ok(()) => called += 1,
                Err(e) => {
                    error!(event_type = %event_type, sub_id, error = %e, "event handler error");
                }
            }
        }
        if called > 0 {
            debug!(event_type = %event_type, handlers = called, "emitted");
        }
        called
    }

    /// Fire-and-forget emit for non-async call sites: the dispatch is spawned
    /// on the runtime.
    pub fn emit_sync(self: &Arc<Self>, event_type: &str, data: Value, source: &str) {
        let bus = Arc::clone(self);
        let event_type = event_type.to_string();
        let source = source.to_string();
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(async move {
                bus.emit(&event_type, data, &source).await;
            });
        } else {
            warn!(event_type = %event_type, "emit_sync outside a runtime; event dropped");
        }
    }

    // --- Service registry ---

    /// Registers a named service for plugin-to-plugin discovery. Emits
    /// `service.registered` (fire-and-forget).
    pub fn register_service(self: &Arc<Self>, name: &str, instance: Arc<dyn Any + Send + Sync>) {
        self.services.insert(name.to_string(), instance);
        info!(service = %name, "service registered");
        self.emit_sync(
            event_packet::event_type::SERVICE_REGISTERED,
            serde_json::json!({ "name": name }),
            "bus",
        );
    }

    pub fn unregister_service(self: &Arc<Self>, name: &str) -> bool {
        let removed = self.services.remove(name).is_some();
        if removed {
            info!(service = %name, "service unregistered");
            self.emit_sync(
                event_packet::event_type::SERVICE_UNREGISTERED,
                serde_json::json!({ "name": name }),
                "bus",
            );
        }
        removed
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Typed lookup: downcasts the registered service to `T`.
    pub fn service_of<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.get_service(name).and_then(|s| s.downcast::<T>().ok())
    }

    pub fn list_services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn direct_then_wildcard_order() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        bus.subscribe_fn("plugin.loaded", move |_| {
            let o = Arc::clone(&o);
            async move {
                o.lock().unwrap().push("direct");
                Ok(())
            }
        });
        let o = Arc::clone(&order);
        bus.subscribe_fn("plugin.*", move |_| {
            let o = Arc::clone(&o);
            async move {
                o.lock().unwrap().push("wildcard");
                Ok(())
            }
        });

        let called = bus
            .emit("plugin.loaded", serde_json::json!({}), "test")
            .await;
        assert_eq!(called, 2);
        assert_eq!(*order.lock().unwrap(), vec!["direct", "wildcard"]);
    }

    #[tokio::test]
    async fn unsubscribe_is_noop_on_future_emits() {
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("t", counting_handler(Arc::clone(&counter)));

        assert_eq!(bus.emit("t", Value::Null, "test").await, 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.emit("t", Value::Null, "test").await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_later_handlers() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe_fn("t", |_| async { Err("boom".into()) });
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("t", counting_handler(Arc::clone(&counter)));

        let called = bus.emit("t", Value::Null, "test").await;
        assert_eq!(called, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[derive(Deserialize)]
    struct Ping {
        #[allow(dead_code)]
        seq: u64,
    }

    #[tokio::test]
    async fn schema_validation_drops_bad_payloads() {
        let bus = Arc::new(EventBus::new());
        bus.register_schema("net.ping", EventSchema::of::<Ping>("1.0"));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("net.ping", counting_handler(Arc::clone(&counter)));

        let ok = bus
            .emit("net.ping", serde_json::json!({"seq": 3}), "test")
            .await;
        assert_eq!(ok, 1);

        let bad = bus
            .emit("net.ping", serde_json::json!({"seq": "three"}), "test")
            .await;
        assert_eq!(bad, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn major_version_mismatch_is_rejected() {
        let bus = Arc::new(EventBus::new());
        bus.register_schema("net.ping", EventSchema::of::<Ping>("2.0"));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("net.ping", counting_handler(Arc::clone(&counter)));

        let rejected = bus
            .emit_versioned("net.ping", serde_json::json!({"seq": 1}), "test", Some("1.4"))
            .await;
        assert_eq!(rejected, 0);

        let accepted = bus
            .emit_versioned("net.ping", serde_json::json!({"seq": 1}), "test", Some("2.9"))
            .await;
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn service_registry_roundtrip() {
        let bus = Arc::new(EventBus::new());
        bus.register_service("answer", Arc::new(42u32));
        assert_eq!(bus.service_of::<u32>("answer").as_deref(), Some(&42));
        assert!(bus.list_services().contains(&"answer".to_string()));
        assert!(bus.unregister_service("answer"));
        assert!(bus.get_service("answer").is_none());
    }
}
