//! Application event bus: named-event publish/subscribe for editor-wide
//! communication.
//!
//! Components broadcast occurrences ("file saved", "model loaded") without
//! knowing their subscribers. Listeners carry an integer priority: higher
//! priorities are dispatched first, equal priorities in subscription order.
//! A bounded trailing history of dispatched events is kept for diagnostics.
//!
//! `emit` runs entirely on the calling thread. Dispatch iterates a snapshot
//! of the listener list taken under the bus lock, so a listener subscribed
//! mid-dispatch is not invoked for the in-flight emit and callbacks may call
//! back into the bus freely.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

/// Default bound on the diagnostic event history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

type ListenerFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A dispatched event, as retained in the diagnostic history.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event_type: String,
    pub args: Vec<Value>,
    /// Dispatch time, milliseconds since the unix epoch.
    pub ts: u64,
}

/// Opaque handle returned by [`EventBus::subscribe`], used only to
/// unsubscribe.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    id: u64,
    event_type: String,
}

struct ListenerEntry {
    id: u64,
    priority: i32,
    callback: ListenerFn,
}

struct BusInner {
    listeners: HashMap<String, Vec<ListenerEntry>>,
    history: VecDeque<EventRecord>,
    capacity: usize,
}

/// Named-event publish/subscribe bus. Thread-safe; all methods take `&self`.
pub struct EventBus {
    inner: Mutex<BusInner>,
    next_listener_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus whose diagnostic history keeps at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                listeners: HashMap::new(),
                history: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `callback` to `event_type` with the given priority.
    ///
    /// Higher priorities are invoked first; listeners with equal priority are
    /// invoked in subscription order.
    ///
    /// # Panics
    /// Panics if `event_type` is empty (programmer error).
    pub fn subscribe(
        &self,
        event_type: &str,
        callback: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
        priority: i32,
    ) -> ListenerHandle {
        assert!(!event_type.is_empty(), "event_type must be non-empty");
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.listeners.entry(event_type.to_string()).or_default();
        entries.push(ListenerEntry {
            id,
            priority,
            callback: Arc::new(callback),
        });
        // Stable sort keeps subscription order within a priority level.
        entries.sort_by_key(|e| std::cmp::Reverse(e.priority));
        ListenerHandle {
            id,
            event_type: event_type.to_string(),
        }
    }

    /// Remove the listener behind `handle`. Returns `false` if it was already
    /// removed; unsubscription is idempotent, not an error.
    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entries) = inner.listeners.get_mut(&handle.event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != handle.id);
        before != entries.len()
    }

    /// Emit an event: record it in history, then invoke every listener for
    /// `event_type` in priority order with `args`.
    ///
    /// A listener that returns `Err` or panics is logged and contributes no
    /// result entry; dispatch always continues to the remaining listeners.
    /// Returns the successful listeners' return values in call order.
    pub fn emit(&self, event_type: &str, args: &[Value]) -> Vec<Value> {
        let snapshot: Vec<ListenerFn> = {
            let mut inner = self.inner.lock().unwrap();
            let record = EventRecord {
                event_type: event_type.to_string(),
                args: args.to_vec(),
                ts: now_millis(),
            };
            if inner.capacity > 0 {
                if inner.history.len() == inner.capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(record);
            }
            inner
                .listeners
                .get(event_type)
                .map(|entries| entries.iter().map(|e| e.callback.clone()).collect())
                .unwrap_or_default()
        };

        let mut results = Vec::with_capacity(snapshot.len());
        for callback in snapshot {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(args))) {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) => {
                    warn!(event = event_type, error = %err, "event listener failed");
                }
                Err(_) => {
                    warn!(event = event_type, "event listener panicked");
                }
            }
        }
        results
    }

    /// Snapshot of the retained history, oldest first, optionally filtered by
    /// event type.
    pub fn get_history(&self, event_type: Option<&str>) -> Vec<EventRecord> {
        let inner = self.inner.lock().unwrap();
        match event_type {
            None => inner.history.iter().cloned().collect(),
            Some(t) => inner
                .history
                .iter()
                .filter(|r| r.event_type == t)
                .cloned()
                .collect(),
        }
    }

    /// Drop all retained history.
    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }

    /// Number of live listeners, optionally for a single event type.
    pub fn listener_count(&self, event_type: Option<&str>) -> usize {
        let inner = self.inner.lock().unwrap();
        match event_type {
            None => inner.listeners.values().map(Vec::len).sum(),
            Some(t) => inner.listeners.get(t).map_or(0, Vec::len),
        }
    }

    /// Remove all listeners, or all listeners for one event type.
    pub fn clear_listeners(&self, event_type: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        match event_type {
            None => inner.listeners.clear(),
            Some(t) => {
                inner.listeners.remove(t);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_orders_by_descending_priority() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let log = order.clone();
            bus.subscribe(
                "build",
                move |_| {
                    log.lock().unwrap().push(name);
                    Ok(json!(name))
                },
                priority,
            );
        }

        let results = bus.emit("build", &[]);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
        assert_eq!(results, vec![json!("high"), json!("mid"), json!("low")]);
    }

    #[test]
    fn equal_priority_preserves_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let log = order.clone();
            bus.subscribe(
                "tick",
                move |_| {
                    log.lock().unwrap().push(name);
                    Ok(Value::Null)
                },
                0,
            );
        }

        bus.emit("tick", &[]);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_listener_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("save", |_| anyhow::bail!("listener exploded"), 10);
        {
            let log = reached.clone();
            bus.subscribe(
                "save",
                move |_| {
                    log.lock().unwrap().push("survivor");
                    Ok(json!("ok"))
                },
                0,
            );
        }

        let results = bus.emit("save", &[]);
        assert_eq!(*reached.lock().unwrap(), vec!["survivor"]);
        // The failed listener contributes no result slot.
        assert_eq!(results, vec![json!("ok")]);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        bus.subscribe("boom", |_| panic!("listener panic"), 10);
        {
            let c = count.clone();
            bus.subscribe(
                "boom",
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                },
                0,
            );
        }

        let results = bus.emit("boom", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn listeners_receive_emit_args() {
        let bus = EventBus::new();
        bus.subscribe(
            "file_saved",
            |args| Ok(json!(args[0].as_str().unwrap().to_uppercase())),
            0,
        );
        let results = bus.emit("file_saved", &[json!("main.rs")]);
        assert_eq!(results, vec![json!("MAIN.RS")]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let handle = bus.subscribe("x", |_| Ok(Value::Null), 0);
        assert!(bus.unsubscribe(&handle));
        assert!(!bus.unsubscribe(&handle));
        assert!(bus.emit("x", &[]).is_empty());
    }

    #[test]
    fn history_is_bounded_and_oldest_first() {
        let bus = EventBus::with_capacity(3);
        for i in 0..5 {
            bus.emit("n", &[json!(i)]);
        }
        let history = bus.get_history(None);
        assert_eq!(history.len(), 3);
        let seen: Vec<i64> = history
            .iter()
            .map(|r| r.args[0].as_i64().unwrap())
            .collect();
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn history_filter_by_type() {
        let bus = EventBus::new();
        bus.emit("a", &[]);
        bus.emit("b", &[]);
        bus.emit("a", &[]);
        assert_eq!(bus.get_history(Some("a")).len(), 2);
        assert_eq!(bus.get_history(Some("b")).len(), 1);
        assert_eq!(bus.get_history(None).len(), 3);

        bus.clear_history();
        assert!(bus.get_history(None).is_empty());
    }

    #[test]
    fn events_are_recorded_even_without_listeners() {
        let bus = EventBus::new();
        assert!(bus.emit("nobody_home", &[]).is_empty());
        assert_eq!(bus.get_history(Some("nobody_home")).len(), 1);
    }

    #[test]
    fn listener_subscribed_mid_dispatch_is_not_invoked_for_inflight_emit() {
        let bus = Arc::new(EventBus::new());
        let late_calls = Arc::new(AtomicU64::new(0));

        {
            let bus2 = bus.clone();
            let late = late_calls.clone();
            bus.subscribe(
                "burst",
                move |_| {
                    let late = late.clone();
                    bus2.subscribe(
                        "burst",
                        move |_| {
                            late.fetch_add(1, Ordering::SeqCst);
                            Ok(Value::Null)
                        },
                        100,
                    );
                    Ok(Value::Null)
                },
                0,
            );
        }

        bus.emit("burst", &[]);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        bus.emit("burst", &[]);
        // First re-emit sees one late listener; the re-subscribing listener
        // adds another for the next round.
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_count_and_clear() {
        let bus = EventBus::new();
        bus.subscribe("a", |_| Ok(Value::Null), 0);
        bus.subscribe("a", |_| Ok(Value::Null), 0);
        bus.subscribe("b", |_| Ok(Value::Null), 0);
        assert_eq!(bus.listener_count(None), 3);
        assert_eq!(bus.listener_count(Some("a")), 2);

        bus.clear_listeners(Some("a"));
        assert_eq!(bus.listener_count(Some("a")), 0);
        assert_eq!(bus.listener_count(None), 1);

        bus.clear_listeners(None);
        assert_eq!(bus.listener_count(None), 0);
    }

    #[test]
    fn history_records_carry_timestamps() {
        let bus = EventBus::new();
        bus.emit("stamped", &[]);
        assert!(bus.get_history(None)[0].ts > 0);
    }
}
