//! Event bus with wildcard subscriptions
//!
//! Dispatch is synchronous with respect to the emitting call site, so
//! handlers observe events of a given source in order. A broadcast-channel
//! view is available for async consumers that prefer to poll.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use super::{Event, EventPayload};
use crate::command::AdapterKind;

/// Handle returned by [`EventBus::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Field-level filter applied after the name pattern matches.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub adapter: Option<AdapterKind>,
    pub host: Option<String>,
    /// Exact event name, e.g. `ssh:execute`.
    pub name: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(adapter) = self.adapter {
            if event.adapter != adapter {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if event.payload.host() != Some(host.as_str()) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if event.name() != name {
                return false;
            }
        }
        true
    }
}

/// Whether `pattern` matches the event name `name`.
///
/// Patterns are `*`, `group:*`, or an exact `group:action`.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(group) = pattern.strip_suffix(":*") {
        return name.split(':').next() == Some(group);
    }
    pattern == name
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    filter: EventFilter,
    handler: Handler,
}

/// Typed publish/subscribe hub shared by the engine and all adapters.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    sender: broadcast::Sender<Event>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<Event>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    /// Create a bus with default broadcast capacity (4096 events).
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            sender,
            _receiver,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe a handler to every event whose name matches `pattern`.
    pub fn subscribe<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_filtered(pattern, EventFilter::default(), handler)
    }

    /// Subscribe with an additional field filter.
    pub fn subscribe_filtered<F>(
        &self,
        pattern: impl Into<String>,
        filter: EventFilter,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.into(),
            filter,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().retain(|s| s.id != id);
    }

    /// Async view of the full stream. Subscribers that fall behind lose
    /// events (lagged), as with any broadcast channel.
    pub fn watch_all(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish one event.
    ///
    /// No-ops after [`EventBus::close`]. Handler panics are captured and
    /// resurface as a `handler:error` event.
    pub fn emit(&self, adapter: AdapterKind, payload: EventPayload) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let event = Event::new(adapter, payload);
        self.dispatch(&event);
        let _ = self.sender.send(event);
    }

    fn dispatch(&self, event: &Event) {
        // Snapshot the matching handlers so a handler can (un)subscribe
        // without deadlocking the dispatch path.
        let handlers: Vec<Handler> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| pattern_matches(&s.pattern, event.name()) && s.filter.matches(event))
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in handlers {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));

            let elapsed = started.elapsed();
            if elapsed.as_millis() > 100 {
                warn!(
                    event = event.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow event handler blocked the emitter"
                );
            }

            if let Err(panic) = outcome {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());

                // Do not re-enter dispatch for failures of handler_error
                // handlers themselves.
                if event.name() != "handler:error" {
                    let error_event = Event::new(
                        event.adapter,
                        EventPayload::HandlerError {
                            event: event.name().to_string(),
                            error: message,
                        },
                    );
                    self.dispatch(&error_event);
                    let _ = self.sender.send(error_event);
                }
            }
        }
    }

    /// Number of registered handler subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Stop all future emission. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn start_payload(command: &str) -> EventPayload {
        EventPayload::CommandStart {
            command: command.to_string(),
            args: None,
            cwd: None,
            shell: None,
            env: None,
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "command:start"));
        assert!(pattern_matches("command:*", "command:start"));
        assert!(pattern_matches("command:start", "command:start"));
        assert!(!pattern_matches("command:complete", "command:start"));
        assert!(!pattern_matches("ssh:*", "command:start"));
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        bus.subscribe("command:*", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AdapterKind::Local, start_payload("ls"));
        bus.emit(
            AdapterKind::Local,
            EventPayload::CacheMiss { key: "k".into() },
        );

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_on_host() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        bus.subscribe_filtered(
            "ssh:*",
            EventFilter {
                host: Some("db1".into()),
                ..Default::default()
            },
            move |_| {
                seen2.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshExecute {
                host: "db1".into(),
                command: "date".into(),
            },
        );
        bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshExecute {
                host: "db2".into(),
                command: "date".into(),
            },
        );

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_becomes_handler_error() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));

        bus.subscribe("command:*", |_| panic!("boom"));
        let errors2 = errors.clone();
        bus.subscribe("handler:error", move |event| {
            assert!(matches!(
                event.payload,
                EventPayload::HandlerError { .. }
            ));
            errors2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AdapterKind::Local, start_payload("ls"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        let id = bus.subscribe("*", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AdapterKind::Local, start_payload("a"));
        bus.unsubscribe(id);
        bus.emit(AdapterKind::Local, start_payload("b"));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_bus_drops_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        bus.subscribe("*", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.close();
        bus.emit(AdapterKind::Local, start_payload("ls"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        // Idempotent
        bus.close();
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_view() {
        let bus = EventBus::new();
        let mut rx = bus.watch_all();

        bus.emit(AdapterKind::Local, start_payload("ls"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "command:start");
    }

    #[test]
    fn test_event_ordering_per_source() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let order2 = order.clone();
        bus.subscribe("command:*", move |event| {
            order2.lock().push(event.name().to_string());
        });

        bus.emit(AdapterKind::Local, start_payload("ls"));
        bus.emit(
            AdapterKind::Local,
            EventPayload::CommandComplete {
                command: "ls".into(),
                exit_code: 0,
                stdout: None,
                stderr: None,
                duration: std::time::Duration::from_millis(5),
            },
        );

        assert_eq!(
            order.lock().as_slice(),
            &["command:start".to_string(), "command:complete".to_string()]
        );
    }
}
