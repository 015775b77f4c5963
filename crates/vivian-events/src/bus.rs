//! Event Bus: in-process publish/subscribe registry.
//!
//! ## Dispatch
//! ```text
//! publish("memory_updated", data)
//!   → record (ring buffer + optional JSONL file)
//!   → snapshot handlers under the lock, release it
//!   → exact → once (claimed, removed) → global → pattern
//!        sync:  inline, in the publisher's thread
//!        async: one OS thread per handler
//! ```
//! Handler errors and panics are logged and never stop delivery to the
//! remaining handlers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use vivian_core::config::EventBusConfig;
use vivian_core::{Result, VivianError};

use crate::event::{Event, PublishOptions};
use crate::log::{EventLog, HistoryQuery};

/// Callback invoked with every matching event.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// How long the async loop waits on an empty queue before re-checking
/// whether it should stop.
const ASYNC_LOOP_POLL: Duration = Duration::from_millis(500);

/// Event types that additionally go through the compliance audit log.
const COMPLIANCE_EVENTS: [&str; 2] = ["gdpr_export", "gdpr_delete"];

/// Handle returned by every `subscribe*` call, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Exact,
    Once,
    Global,
    Pattern,
}

/// Introspection record for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub kind: SubscriptionKind,
    /// Event type, pattern source, or `*` for global handlers.
    pub key: String,
}

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

struct PatternSubscriber {
    id: SubscriptionId,
    source: String,
    /// `source` anchored at the start of the event type.
    regex: Regex,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Subscriber>>,
    once: HashMap<String, Vec<Subscriber>>,
    global: Vec<Subscriber>,
    patterns: Vec<PatternSubscriber>,
}

fn remove_from(
    map: &mut HashMap<String, Vec<Subscriber>>,
    event_type: &str,
    id: SubscriptionId,
) -> bool {
    let Some(subs) = map.get_mut(event_type) else {
        return false;
    };
    let before = subs.len();
    subs.retain(|s| s.id != id);
    let removed = subs.len() < before;
    if subs.is_empty() {
        map.remove(event_type);
    }
    removed
}

/// The event bus.
pub struct EventBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    log: EventLog,
    queue: Mutex<VecDeque<Event>>,
    queue_notify: Notify,
    running: AtomicBool,
    loop_epoch: AtomicU64,
    async_loop: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Bus with the default in-memory log and no persistent file.
    pub fn new() -> Self {
        Self::with_config(&EventBusConfig::default())
    }

    /// Bus configured from the `[event_bus]` section. The async loop is not
    /// started here; see [`EventBus::from_config`].
    pub fn with_config(config: &EventBusConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            log: EventLog::new(config.log_capacity, config.persistent_log_path()),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            running: AtomicBool::new(false),
            loop_epoch: AtomicU64::new(0),
            async_loop: Mutex::new(None),
        }
    }

    /// Shared bus, starting the async loop when `enable_async_loop` is set.
    pub fn from_config(config: &EventBusConfig) -> Arc<Self> {
        let bus = Arc::new(Self::with_config(config));
        if config.enable_async_loop {
            bus.start_async_loop();
        }
        bus
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ─── Subscription ─────────────────────────────────────────

    /// Subscribe a handler to an exact event type. Subscribing the same
    /// handler twice makes it fire twice.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry()
            .exact
            .entry(event_type.to_string())
            .or_default()
            .push(Subscriber { id, handler: Arc::new(handler) });
        tracing::debug!("Handler {id} subscribed to event: {event_type}");
        id
    }

    /// Subscribe to every event type the regex matches at its start.
    pub fn subscribe_pattern<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|e| VivianError::Pattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let id = self.next_id();
        self.registry().patterns.push(PatternSubscriber {
            id,
            source: pattern.to_string(),
            regex,
            handler: Arc::new(handler),
        });
        tracing::debug!("Handler {id} subscribed to pattern: {pattern}");
        Ok(id)
    }

    /// Subscribe a handler that fires on the next matching event only.
    pub fn subscribe_once<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry()
            .once
            .entry(event_type.to_string())
            .or_default()
            .push(Subscriber { id, handler: Arc::new(handler) });
        tracing::debug!("One-shot handler {id} subscribed to event: {event_type}");
        id
    }

    /// Subscribe a handler to all events.
    pub fn subscribe_global<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry().global.push(Subscriber { id, handler: Arc::new(handler) });
        tracing::debug!("Global handler {id} subscribed");
        id
    }

    /// Remove a handler from an event type (exact and one-shot lists).
    /// Returns false when nothing was registered under `id`.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut reg = self.registry();
        let exact = remove_from(&mut reg.exact, event_type, id);
        let once = remove_from(&mut reg.once, event_type, id);
        if exact || once {
            tracing::debug!("Handler {id} unsubscribed from event: {event_type}");
        }
        exact || once
    }

    pub fn unsubscribe_pattern(&self, id: SubscriptionId) -> bool {
        let mut reg = self.registry();
        let before = reg.patterns.len();
        reg.patterns.retain(|p| p.id != id);
        reg.patterns.len() < before
    }

    pub fn unsubscribe_global(&self, id: SubscriptionId) -> bool {
        let mut reg = self.registry();
        let before = reg.global.len();
        reg.global.retain(|s| s.id != id);
        reg.global.len() < before
    }

    /// Remove all subscribers.
    pub fn clear(&self) {
        let mut reg = self.registry();
        *reg = Registry::default();
        tracing::debug!("All subscribers cleared");
    }

    // ─── Publishing ───────────────────────────────────────────

    /// Publish an event to every matching handler. Returns how many handlers
    /// were dispatched (for async publishes, how many threads were started).
    pub fn publish(&self, event_type: &str, data: Value, options: PublishOptions) -> usize {
        let asynchronous = options.asynchronous;
        self.publish_event(options.into_event(event_type, data), asynchronous)
    }

    /// Publish with default options.
    pub fn emit(&self, event_type: &str, data: Value) -> usize {
        self.publish(event_type, data, PublishOptions::default())
    }

    /// Record and dispatch an already constructed event.
    pub fn publish_event(&self, event: Event, asynchronous: bool) -> usize {
        self.log.record(&event);

        let (exact, once, global, pattern) = {
            let mut reg = self.registry();
            let exact: Vec<Handler> = reg
                .exact
                .get(&event.event_type)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default();
            // Claimed here so a concurrent publish cannot fire them again.
            let once: Vec<Handler> = reg
                .once
                .remove(&event.event_type)
                .map(|subs| subs.into_iter().map(|s| s.handler).collect())
                .unwrap_or_default();
            let global: Vec<Handler> = reg.global.iter().map(|s| s.handler.clone()).collect();
            let pattern: Vec<Handler> = reg
                .patterns
                .iter()
                .filter(|p| p.regex.is_match(&event.event_type))
                .map(|p| p.handler.clone())
                .collect();
            (exact, once, global, pattern)
        };

        let event = Arc::new(event);
        let mut dispatched = 0;
        for handler in exact.iter().chain(&once).chain(&global).chain(&pattern) {
            dispatch(handler, &event, asynchronous);
            dispatched += 1;
        }

        if COMPLIANCE_EVENTS.contains(&event.event_type.as_str()) {
            tracing::info!(
                target: "vivian::compliance",
                "Compliance event: {} {}",
                event.event_type,
                event.data
            );
        }

        dispatched
    }

    /// Deliver an event to every registered handler regardless of type.
    /// Broadcasts are not recorded in the event log.
    pub fn broadcast(&self, event_type: &str, data: Value, context: Map<String, Value>) -> usize {
        let event = Arc::new(Event::new(event_type, data).with_context(context));
        let handlers: Vec<Handler> = {
            let mut reg = self.registry();
            let mut handlers: Vec<Handler> = reg.global.iter().map(|s| s.handler.clone()).collect();
            handlers.extend(reg.exact.values().flatten().map(|s| s.handler.clone()));
            handlers.extend(reg.once.drain().flat_map(|(_, subs)| subs).map(|s| s.handler));
            handlers.extend(reg.patterns.iter().map(|p| p.handler.clone()));
            handlers
        };
        for handler in &handlers {
            dispatch(handler, &event, false);
        }
        handlers.len()
    }

    // ─── Deferred queue ───────────────────────────────────────

    /// Queue an event for a later [`EventBus::drain`] or for the async loop.
    pub fn queue_event(&self, event_type: &str, data: Value, options: PublishOptions) {
        let event = options.into_event(event_type, data);
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(event);
        self.queue_notify.notify_one();
    }

    fn pop_queued(&self) -> Option<Event> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Publish every queued event in enqueue order. Returns how many events
    /// were drained.
    pub fn drain(&self, asynchronous: bool) -> usize {
        let mut drained = 0;
        while let Some(event) = self.pop_queued() {
            self.publish_event(event, asynchronous);
            drained += 1;
        }
        drained
    }

    // ─── Async loop ───────────────────────────────────────────

    /// Start the background task that publishes queued events with async
    /// dispatch. Needs a tokio runtime; returns false if none is available
    /// or the loop is already running.
    pub fn start_async_loop(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::warn!("⚠️ Event bus async loop not started: {e}");
                return false;
            }
        };
        let epoch = self.loop_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = runtime.spawn(run_async_loop(Arc::downgrade(self), epoch));
        *self.async_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!("📡 Event bus async loop started");
        true
    }

    /// Signal the async loop to stop. Events still queued stay queued. The
    /// returned handle resolves once the loop has exited.
    pub fn stop_async_loop(&self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.loop_epoch.fetch_add(1, Ordering::SeqCst);
        self.queue_notify.notify_waiters();
        tracing::info!("📡 Event bus async loop stopped");
        self.async_loop.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_async_loop_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the loop spawned at `epoch` is still the live one.
    fn is_current_loop(&self, epoch: u64) -> bool {
        self.is_async_loop_running() && self.loop_epoch.load(Ordering::SeqCst) == epoch
    }

    pub fn shutdown(&self) {
        self.stop_async_loop();
    }

    // ─── History ──────────────────────────────────────────────

    /// Recorded events matching `query`, oldest first.
    pub fn get_history(&self, query: &HistoryQuery) -> Vec<Event> {
        self.log.history(query)
    }

    pub fn get_history_where<P>(&self, query: &HistoryQuery, predicate: P) -> Vec<Event>
    where
        P: Fn(&Event) -> bool,
    {
        self.log.history_where(query, predicate)
    }

    /// Feed recorded events matching `query` to `handler`, oldest first.
    /// Replayed events are neither re-recorded nor sent to subscribers;
    /// handler errors and panics are logged and skipped. Returns how many
    /// events were replayed.
    pub fn replay<F>(&self, query: &HistoryQuery, handler: F) -> usize
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let events = self.log.history(query);
        for event in &events {
            invoke(&handler, event);
        }
        tracing::debug!("Replayed {} event(s)", events.len());
        events.len()
    }

    /// Empty the in-memory event log.
    pub fn clear_log(&self) {
        self.log.clear();
        tracing::debug!("Event log cleared");
    }

    // ─── Introspection ────────────────────────────────────────

    /// Event types with exact or one-shot subscribers, sorted.
    pub fn list_event_types(&self) -> Vec<String> {
        let reg = self.registry();
        let types: BTreeSet<&String> = reg.exact.keys().chain(reg.once.keys()).collect();
        types.into_iter().cloned().collect()
    }

    /// Subscriptions for one event type (exact and one-shot), or every
    /// subscription when `event_type` is `None`.
    pub fn list_subscribers(&self, event_type: Option<&str>) -> Vec<SubscriptionInfo> {
        let reg = self.registry();
        let info = |kind, key: &str, s: &Subscriber| SubscriptionInfo {
            id: s.id,
            kind,
            key: key.to_string(),
        };

        match event_type {
            Some(et) => {
                let exact = reg.exact.get(et).into_iter().flatten();
                let once = reg.once.get(et).into_iter().flatten();
                exact
                    .map(|s| info(SubscriptionKind::Exact, et, s))
                    .chain(once.map(|s| info(SubscriptionKind::Once, et, s)))
                    .collect()
            }
            None => {
                let mut all: Vec<SubscriptionInfo> = Vec::new();
                for (et, subs) in &reg.exact {
                    all.extend(subs.iter().map(|s| info(SubscriptionKind::Exact, et, s)));
                }
                for (et, subs) in &reg.once {
                    all.extend(subs.iter().map(|s| info(SubscriptionKind::Once, et, s)));
                }
                all.extend(reg.global.iter().map(|s| info(SubscriptionKind::Global, "*", s)));
                all.extend(reg.patterns.iter().map(|p| SubscriptionInfo {
                    id: p.id,
                    kind: SubscriptionKind::Pattern,
                    key: p.source.clone(),
                }));
                all.sort_by_key(|i| i.id);
                all
            }
        }
    }

    /// The most recent `limit` recorded events, oldest first.
    pub fn list_event_log(&self, limit: usize) -> Vec<Event> {
        self.log.recent(limit)
    }

    pub fn list_pattern_subscriptions(&self) -> Vec<String> {
        self.registry().patterns.iter().map(|p| p.source.clone()).collect()
    }

    /// Handler ids per exact event type, plus `global` (ids) and `pattern`
    /// (pattern sources).
    pub fn list_all_handlers(&self) -> BTreeMap<String, Vec<String>> {
        let reg = self.registry();
        let mut result: BTreeMap<String, Vec<String>> = reg
            .exact
            .iter()
            .map(|(et, subs)| (et.clone(), subs.iter().map(|s| s.id.to_string()).collect()))
            .collect();
        result.insert("global".into(), reg.global.iter().map(|s| s.id.to_string()).collect());
        result.insert("pattern".into(), reg.patterns.iter().map(|p| p.source.clone()).collect());
        result
    }

    /// Markdown listing of registered event types, patterns and handlers.
    pub fn document_events(&self) -> String {
        let reg = self.registry();
        let mut lines = vec!["# EventBus Registered Events & Handlers\n".to_string()];
        if !reg.exact.is_empty() {
            lines.push("## Exact Event Types:".into());
            let sorted: BTreeMap<_, _> = reg.exact.iter().collect();
            for (et, subs) in sorted {
                lines.push(format!("- `{et}`: {} handler(s)", subs.len()));
            }
        }
        if !reg.patterns.is_empty() {
            lines.push("## Pattern Subscriptions:".into());
            for p in &reg.patterns {
                lines.push(format!("- `{}`: {}", p.source, p.id));
            }
        }
        if !reg.global.is_empty() {
            lines.push("## Global Subscribers:".into());
            for s in &reg.global {
                lines.push(format!("- {}", s.id));
            }
        }
        lines.join("\n")
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// The queue consumer of one `start_async_loop`. Exits once the loop is
/// stopped, restarted or the bus is dropped.
async fn run_async_loop(bus: Weak<EventBus>, epoch: u64) {
    loop {
        let Some(bus) = bus.upgrade() else { break };
        if !bus.is_current_loop(epoch) {
            break;
        }
        match bus.pop_queued() {
            Some(event) => {
                let worker = Arc::clone(&bus);
                let published = tokio::task::spawn_blocking(move || {
                    worker.publish_event(event, true);
                })
                .await;
                if let Err(e) = published {
                    tracing::error!("Event bus async publish failed: {e}");
                }
            }
            None => {
                let _ = tokio::time::timeout(ASYNC_LOOP_POLL, bus.queue_notify.notified()).await;
            }
        }
    }
}

fn dispatch(handler: &Handler, event: &Arc<Event>, asynchronous: bool) {
    if !asynchronous {
        invoke(handler, event);
        return;
    }
    let handler = Arc::clone(handler);
    let event_for_thread = Arc::clone(event);
    let spawned = std::thread::Builder::new()
        .name(format!("vivian-event-{}", event.event_type))
        .spawn(move || invoke(&handler, &event_for_thread));
    if let Err(e) = spawned {
        tracing::error!("Failed to spawn handler thread for '{}': {e}", event.event_type);
    }
}

fn invoke(handler: &Handler, event: &Event) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Error in handler for '{}': {e:#}", event.event_type);
        }
        Err(payload) => {
            tracing::error!(
                "Handler for '{}' panicked: {}",
                event.event_type,
                vivian_core::util::panic_message(payload.as_ref())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_for_make = calls.clone();
        let make = move |label: &str| -> Handler {
            let calls = calls_for_make.clone();
            let label = label.to_string();
            Arc::new(move |e: &Event| {
                calls.lock().unwrap().push(format!("{label}:{}", e.event_type));
                Ok(())
            })
        };
        (calls, make)
    }

    fn with(handler: Handler) -> impl Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static {
        move |e| handler(e)
    }

    #[test]
    fn test_exact_then_global() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        bus.subscribe("x", move |e| {
            s1.lock().unwrap().push(("h1", e.data.clone()));
            Ok(())
        });
        let s2 = seen.clone();
        bus.subscribe_global(move |e| {
            s2.lock().unwrap().push(("h2", e.data.clone()));
            Ok(())
        });

        assert_eq!(bus.emit("x", json!(1)), 2);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("h1", json!(1)), ("h2", json!(1))]);
    }

    #[test]
    fn test_dispatch_order() {
        let bus = EventBus::new();
        let (calls, make) = recorder();
        bus.subscribe_pattern("demo_", with(make("pattern"))).unwrap();
        bus.subscribe_global(with(make("global")));
        bus.subscribe_once("demo_event", with(make("once")));
        bus.subscribe("demo_event", with(make("exact")));

        bus.emit("demo_event", json!({"foo": "bar"}));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "exact:demo_event",
                "once:demo_event",
                "global:demo_event",
                "pattern:demo_event"
            ]
        );
    }

    #[test]
    fn test_subscribe_once_fires_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_once("ready", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("ready", Value::Null);
        bus.emit("ready", Value::Null);
        bus.emit("ready", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.list_event_types().is_empty());
    }

    #[test]
    fn test_subscribe_once_concurrent_publishers() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_once("race", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    bus.emit("race", Value::Null);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pattern_uses_prefix_match() {
        let bus = EventBus::new();
        let (calls, make) = recorder();
        bus.subscribe_pattern("memory_", with(make("prefix"))).unwrap();
        bus.subscribe_pattern("updated", with(make("suffix"))).unwrap();
        bus.subscribe_pattern("user_(login|logout)", with(make("alt"))).unwrap();

        bus.emit("memory_updated", Value::Null);
        bus.emit("user_logout", Value::Null);
        bus.emit("plugin_memory_x", Value::Null);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["prefix:memory_updated", "alt:user_logout"]
        );
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let bus = EventBus::new();
        let err = bus.subscribe_pattern("user_(", |_| Ok(())).unwrap_err();
        assert!(matches!(err, VivianError::Pattern { .. }));
        assert!(bus.list_pattern_subscriptions().is_empty());
    }

    #[test]
    fn test_failing_handler_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe("job", |_| anyhow::bail!("handler failed"));
        bus.subscribe("job", |_| panic!("handler panicked"));
        let c = count.clone();
        bus.subscribe("job", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c = count.clone();
        bus.subscribe_global(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.emit("job", Value::Null), 4);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_subscription_fires_twice() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler: Handler = {
            let c = count.clone();
            Arc::new(move |_: &Event| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        bus.subscribe("dup", with(handler.clone()));
        bus.subscribe("dup", with(handler));
        bus.emit("dup", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let global = bus.subscribe_global(|_| Ok(()));
        let pattern = bus.subscribe_pattern("x", |_| Ok(())).unwrap();

        assert!(bus.unsubscribe("x", id));
        assert!(!bus.unsubscribe("x", id));
        assert!(!bus.unsubscribe("never", id));
        assert!(bus.unsubscribe_global(global));
        assert!(!bus.unsubscribe_global(global));
        assert!(bus.unsubscribe_pattern(pattern));
        assert!(!bus.unsubscribe_pattern(pattern));

        assert_eq!(bus.emit("x", Value::Null), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_once_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe_once("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(bus.unsubscribe("x", id));
        bus.emit("x", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_can_reenter_bus() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        let c = count.clone();
        bus.subscribe("outer", move |_| {
            let c = c.clone();
            inner_bus.subscribe("inner", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            inner_bus.emit("inner", Value::Null);
            Ok(())
        });

        bus.emit("outer", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_async_dispatch_runs_on_other_threads() {
        let bus = EventBus::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let caller = std::thread::current().id();
        let tx = Mutex::new(tx);
        bus.subscribe("bg", move |e| {
            let same = std::thread::current().id() == caller;
            tx.lock().unwrap().send((same, e.data.clone()))?;
            Ok(())
        });

        let dispatched = bus.publish("bg", json!("hi"), PublishOptions::new().asynchronous(true));
        assert_eq!(dispatched, 1);
        let (same_thread, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!same_thread);
        assert_eq!(data, json!("hi"));
    }

    #[test]
    fn test_publish_options_reach_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bus.subscribe("command_executed", move |e| {
            *s.lock().unwrap() = Some(e.clone());
            Ok(())
        });
        bus.publish(
            "command_executed",
            json!({"command": "hello"}),
            PublishOptions::new()
                .context_entry("user", json!("ana"))
                .source("commands")
                .tag("audit"),
        );
        let event = seen.lock().unwrap().clone().unwrap();
        assert_eq!(event.context["user"], "ana");
        assert_eq!(event.source.as_deref(), Some("commands"));
        assert!(event.has_tag("audit"));
    }

    #[test]
    fn test_queue_and_drain_fifo() {
        let bus = EventBus::new();
        let (calls, make) = recorder();
        bus.subscribe_global(with(make("g")));

        bus.queue_event("first", json!(1), PublishOptions::default());
        bus.queue_event("second", json!(2), PublishOptions::default());
        bus.queue_event("third", json!(3), PublishOptions::default());
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(bus.queued_len(), 3);

        assert_eq!(bus.drain(false), 3);
        assert_eq!(bus.queued_len(), 0);
        assert_eq!(*calls.lock().unwrap(), vec!["g:first", "g:second", "g:third"]);
        assert_eq!(bus.drain(false), 0);
    }

    #[test]
    fn test_event_log_records_publishes() {
        let bus = EventBus::new();
        bus.emit("a", json!(1));
        bus.queue_event("b", json!(2), PublishOptions::default());
        assert_eq!(bus.list_event_log(50).len(), 1);
        bus.drain(false);
        bus.broadcast("c", json!(3), Map::new());

        let types: Vec<_> = bus.list_event_log(50).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["a", "b"]);
        assert_eq!(bus.list_event_log(1)[0].event_type, "b");
    }

    #[test]
    fn test_persistent_log_file() {
        let dir = std::env::temp_dir().join(format!("vivian-test-buslog-{}", std::process::id()));
        let config = EventBusConfig {
            persistent_log: Some(dir.join("event_log.jsonl").to_string_lossy().into_owned()),
            ..EventBusConfig::default()
        };
        let bus = EventBus::with_config(&config);
        bus.publish("user_login", json!({"username": "ana"}), PublishOptions::new().tag("auth"));

        let events = crate::log::read_log(&dir.join("event_log.jsonl")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "user_login");
        assert_eq!(events[0].tags.iter().collect::<Vec<_>>(), vec!["auth"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_broadcast_reaches_every_handler() {
        let bus = EventBus::new();
        let (calls, make) = recorder();
        bus.subscribe("a", with(make("exact")));
        bus.subscribe_once("b", with(make("once")));
        bus.subscribe_global(with(make("global")));
        bus.subscribe_pattern("zzz", with(make("pattern"))).unwrap();

        assert_eq!(bus.broadcast("announce", json!("hi"), Map::new()), 4);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["global:announce", "exact:announce", "once:announce", "pattern:announce"]
        );
        // the one-shot handler was consumed
        assert_eq!(bus.broadcast("announce", json!("hi"), Map::new()), 3);
    }

    #[test]
    fn test_introspection() {
        let bus = EventBus::new();
        let a = bus.subscribe("user_login", |_| Ok(()));
        let b = bus.subscribe_once("user_registered", |_| Ok(()));
        let g = bus.subscribe_global(|_| Ok(()));
        bus.subscribe_pattern("^memory_", |_| Ok(())).unwrap();

        assert_eq!(bus.list_event_types(), vec!["user_login", "user_registered"]);
        assert_eq!(
            bus.list_subscribers(Some("user_registered")),
            vec![SubscriptionInfo {
                id: b,
                kind: SubscriptionKind::Once,
                key: "user_registered".into()
            }]
        );
        let all = bus.list_subscribers(None);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].id, a);
        assert_eq!(all[2].kind, SubscriptionKind::Global);

        let handlers = bus.list_all_handlers();
        assert_eq!(handlers["user_login"], vec![a.to_string()]);
        assert_eq!(handlers["global"], vec![g.to_string()]);
        assert_eq!(handlers["pattern"], vec!["^memory_".to_string()]);

        let doc = bus.document_events();
        assert!(doc.starts_with("# EventBus Registered Events & Handlers"));
        assert!(doc.contains("- `user_login`: 1 handler(s)"));
        assert!(doc.contains("## Pattern Subscriptions:"));
        assert!(doc.contains("## Global Subscribers:"));

        bus.clear();
        assert!(bus.list_subscribers(None).is_empty());
    }

    #[test]
    fn test_async_loop_requires_runtime() {
        let bus = Arc::new(EventBus::new());
        assert!(!bus.start_async_loop());
        assert!(!bus.is_async_loop_running());
    }

    #[tokio::test]
    async fn test_async_loop_publishes_queued_events() {
        let bus = Arc::new(EventBus::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe("queued", move |e| {
            tx.send(e.data.clone())?;
            Ok(())
        });

        assert!(bus.start_async_loop());
        assert!(!bus.start_async_loop());
        bus.queue_event("queued", json!("deferred hello"), PublishOptions::default());

        let data = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, json!("deferred hello"));

        bus.shutdown();
        assert!(!bus.is_async_loop_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restarted_async_loop_keeps_fifo() {
        let bus = Arc::new(EventBus::new());
        assert!(bus.start_async_loop());
        let first = bus.stop_async_loop().unwrap();
        assert!(bus.start_async_loop());

        // Only the second loop may consume the queue.
        tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .unwrap()
            .unwrap();
        assert!(bus.is_async_loop_running());

        for i in 0..100 {
            bus.queue_event("tick", json!(i), PublishOptions::default());
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bus.event_log().len() < 100 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let order: Vec<Value> = bus.list_event_log(100).into_iter().map(|e| e.data).collect();
        assert_eq!(order, (0..100).map(|i| json!(i)).collect::<Vec<_>>());

        let second = bus.stop_async_loop().unwrap();
        tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .unwrap()
            .unwrap();
        assert!(bus.stop_async_loop().is_none());
    }

    #[test]
    fn test_history_by_type_and_time() {
        let bus = EventBus::new();
        for (i, event_type) in ["login", "logout", "login"].into_iter().enumerate() {
            let event = Event::new(event_type, json!(i)).with_timestamp(10.0 + i as f64);
            bus.publish_event(event, false);
        }

        let logins = bus.get_history(&HistoryQuery::new().event_type("login"));
        let data: Vec<Value> = logins.into_iter().map(|e| e.data).collect();
        assert_eq!(data, vec![json!(0), json!(2)]);

        let recent = bus.get_history(&HistoryQuery::new().since(10.5));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "logout");

        let filtered = bus.get_history_where(&HistoryQuery::new(), |e| e.data == json!(1));
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_replay_absorbs_handler_failures() {
        let bus = EventBus::new();
        let live = Arc::new(AtomicUsize::new(0));
        let l = live.clone();
        bus.subscribe("order", move |_| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        for i in 0..4 {
            bus.emit("order", json!(i));
        }
        bus.emit("other", Value::Null);

        let replayed = Arc::new(Mutex::new(Vec::new()));
        let sink = replayed.clone();
        let count = bus.replay(&HistoryQuery::new().event_type("order"), move |e| {
            sink.lock().unwrap().push(e.data.clone());
            match e.data.as_u64() {
                Some(1) => anyhow::bail!("bad order"),
                Some(2) => panic!("worse order"),
                _ => Ok(()),
            }
        });

        assert_eq!(count, 4);
        assert_eq!(*replayed.lock().unwrap(), vec![json!(0), json!(1), json!(2), json!(3)]);
        assert_eq!(live.load(Ordering::SeqCst), 4);
        assert_eq!(bus.event_log().len(), 5);
        assert_eq!(bus.replay(&HistoryQuery::new().event_type("none"), |_| Ok(())), 0);
    }

    #[test]
    fn test_clear_log() {
        let bus = EventBus::new();
        bus.emit("a", json!(1));
        bus.emit("b", json!(2));
        bus.clear_log();
        assert!(bus.list_event_log(10).is_empty());
        assert!(bus.get_history(&HistoryQuery::new()).is_empty());
        bus.emit("c", json!(3));
        assert_eq!(bus.list_event_log(10)[0].event_type, "c");
    }
}
