use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Reason carried by an `error` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    /// Inactivity watchdog fired
    Timeout,
    /// Reported by the execution runtime, unmodified
    Backend(String),
    /// Policy handshake failed
    Authorization(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Backend(reason) => f.write_str(reason),
            Self::Authorization(reason) => write!(f, "authorization: {}", reason),
        }
    }
}

/// Lifecycle events published by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Progress(f64),
    Load,
    Error(ErrorReason),
    Destroy,
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Progress(_) => EventKind::Progress,
            Self::Load => EventKind::Load,
            Self::Error(_) => EventKind::Error,
            Self::Destroy => EventKind::Destroy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Load,
    Error,
    Destroy,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Load => "load",
            Self::Error => "error",
            Self::Destroy => "destroy",
        }
    }
}

/// Listener signature. Called synchronously from the emitting call.
pub type EventListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: EventListener,
    once: bool,
}

/// Subscriber list for one transport.
///
/// Emission snapshots the matching listeners and calls them with the lock
/// released, so a listener may subscribe, unsubscribe or drive the
/// transport from inside its callback.
#[derive(Default)]
pub struct EventHub {
    listeners: Mutex<Vec<ListenerEntry>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.push(Some(kind), Arc::new(listener), false)
    }

    /// Subscribe to every event
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.push(None, Arc::new(listener), false)
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.push(Some(kind), Arc::new(listener), true)
    }

    fn push(&self, kind: Option<EventKind>, listener: EventListener, once: bool) -> ListenerId {
        let id = next_listener_id();
        self.listeners.lock().push(ListenerEntry {
            id,
            kind,
            listener,
            once,
        });
        id
    }

    /// removeListener/off
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|e| e.id != id);
        before != listeners.len()
    }

    /// Drop every subscriber, returning how many were removed
    pub fn off_all(&self) -> usize {
        let mut listeners = self.listeners.lock();
        let count = listeners.len();
        listeners.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Deliver an event to every matching listener
    pub fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        let to_call: Vec<EventListener> = {
            let mut listeners = self.listeners.lock();
            let matched: Vec<ListenerEntry> = listeners
                .iter()
                .filter(|e| e.kind.map_or(true, |k| k == kind))
                .cloned()
                .collect();
            // once-listeners go before delivery so re-entrant emits skip them
            listeners.retain(|e| !(e.once && e.kind.map_or(true, |k| k == kind)));
            matched.into_iter().map(|e| e.listener).collect()
        };

        for listener in &to_call {
            listener(event);
        }
    }
}
