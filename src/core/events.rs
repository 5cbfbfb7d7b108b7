//! Typed multi-subscriber event dispatch.
//!
//! Four categories exist: inbound messages, connection state changes, errors
//! and captured audio frames. Every handler registered for a category sees
//! every event of that category, in registration order.
//!
//! Registration returns a [`Subscription`]. Removing it is idempotent and
//! takes effect immediately, including for a dispatch already in progress
//! (a handler removed by an earlier handler of the same event is skipped).
//!
//! A handler that panics is isolated: the panic is reported to the error
//! handlers as [`VocalsError::Handler`] and dispatch continues with the
//! remaining handlers.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::connection::ServerMessage;
use crate::core::state::ConnectionState;
use crate::errors::VocalsError;

/// Handler for inbound service messages.
pub type MessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Handler for connection state transitions.
pub type ConnectionHandler = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// Handler for runtime errors.
pub type ErrorHandler = Arc<dyn Fn(&VocalsError) + Send + Sync>;

/// Handler for captured audio frames (interleaved f32 samples).
pub type AudioDataHandler = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Event categories a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Message,
    ConnectionChange,
    Error,
    AudioData,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::Message => write!(f, "message"),
            EventCategory::ConnectionChange => write!(f, "connection_change"),
            EventCategory::Error => write!(f, "error"),
            EventCategory::AudioData => write!(f, "audio_data"),
        }
    }
}

struct Entry<E: ?Sized> {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Arc<dyn Fn(&E) + Send + Sync>,
}

struct HandlerList<E: ?Sized> {
    entries: Mutex<Vec<Entry<E>>>,
}

impl<E: ?Sized> HandlerList<E> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, id: u64, handler: Arc<dyn Fn(&E) + Send + Sync>) {
        self.entries.lock().push(Entry {
            id,
            active: Arc::new(AtomicBool::new(true)),
            handler,
        });
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let entry = entries.remove(pos);
                entry.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.entries.lock().iter().any(|e| e.id == id)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn clear(&self) {
        for entry in self.entries.lock().drain(..) {
            entry.active.store(false, Ordering::Release);
        }
    }

    // Handlers run outside the lock so they can register or remove handlers.
    fn snapshot(&self) -> Vec<(Arc<AtomicBool>, Arc<dyn Fn(&E) + Send + Sync>)> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.active.clone(), e.handler.clone()))
            .collect()
    }
}

struct BusInner {
    next_id: AtomicU64,
    message: HandlerList<ServerMessage>,
    connection: HandlerList<ConnectionState>,
    error: HandlerList<VocalsError>,
    audio: HandlerList<[f32]>,
}

impl BusInner {
    fn remove(&self, category: EventCategory, id: u64) -> bool {
        match category {
            EventCategory::Message => self.message.remove(id),
            EventCategory::ConnectionChange => self.connection.remove(id),
            EventCategory::Error => self.error.remove(id),
            EventCategory::AudioData => self.audio.remove(id),
        }
    }

    fn contains(&self, category: EventCategory, id: u64) -> bool {
        match category {
            EventCategory::Message => self.message.contains(id),
            EventCategory::ConnectionChange => self.connection.contains(id),
            EventCategory::Error => self.error.contains(id),
            EventCategory::AudioData => self.audio.contains(id),
        }
    }
}

/// Event bus shared by every client component.
///
/// Cloning is cheap; clones dispatch to the same handlers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("message_handlers", &self.inner.message.len())
            .field("connection_handlers", &self.inner.connection.len())
            .field("error_handlers", &self.inner.error.len())
            .field("audio_data_handlers", &self.inner.audio.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                message: HandlerList::new(),
                connection: HandlerList::new(),
                error: HandlerList::new(),
                audio: HandlerList::new(),
            }),
        }
    }

    fn subscription(&self, category: EventCategory, id: u64) -> Subscription {
        Subscription {
            id,
            category,
            bus: Arc::downgrade(&self.inner),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.message.insert(id, Arc::new(handler));
        self.subscription(EventCategory::Message, id)
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.connection.insert(id, Arc::new(handler));
        self.subscription(EventCategory::ConnectionChange, id)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&VocalsError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.error.insert(id, Arc::new(handler));
        self.subscription(EventCategory::Error, id)
    }

    pub fn on_audio_data<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[f32]) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.audio.insert(id, Arc::new(handler));
        self.subscription(EventCategory::AudioData, id)
    }

    /// Number of handlers registered for `category`.
    pub fn handler_count(&self, category: EventCategory) -> usize {
        match category {
            EventCategory::Message => self.inner.message.len(),
            EventCategory::ConnectionChange => self.inner.connection.len(),
            EventCategory::Error => self.inner.error.len(),
            EventCategory::AudioData => self.inner.audio.len(),
        }
    }

    /// Remove every handler in every category.
    pub fn clear(&self) {
        self.inner.message.clear();
        self.inner.connection.clear();
        self.inner.error.clear();
        self.inner.audio.clear();
    }

    pub fn emit_message(&self, message: &ServerMessage) {
        self.dispatch(&self.inner.message, EventCategory::Message, message);
    }

    pub fn emit_connection_state(&self, state: ConnectionState) {
        self.dispatch(
            &self.inner.connection,
            EventCategory::ConnectionChange,
            &state,
        );
    }

    pub fn emit_error(&self, error: &VocalsError) {
        self.dispatch(&self.inner.error, EventCategory::Error, error);
    }

    pub fn emit_audio_data(&self, samples: &[f32]) {
        self.dispatch(&self.inner.audio, EventCategory::AudioData, samples);
    }

    fn dispatch<E: ?Sized>(&self, list: &HandlerList<E>, category: EventCategory, event: &E) {
        for (active, handler) in list.snapshot() {
            if !active.load(Ordering::Acquire) {
                continue;
            }

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let reason = panic_message(panic.as_ref());
                tracing::warn!(category = %category, "Event handler panicked: {}", reason);

                // Error handlers are not told about their own failures.
                if category != EventCategory::Error {
                    let err = VocalsError::Handler(format!("{category} handler panicked: {reason}"));
                    self.emit_error(&err);
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// De-registration capability returned by every `on_*` call.
///
/// Holds only a weak reference to the bus: it never keeps the client alive,
/// and removing after the bus is gone is a no-op.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    category: EventCategory,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler. Returns `true` only for the call that removed it.
    pub fn remove(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => {
                let removed = bus.remove(self.category, self.id);
                if removed {
                    tracing::trace!(category = %self.category, id = self.id, "Handler removed");
                }
                removed
            }
            None => false,
        }
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.contains(self.category, self.id))
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        (store.clone(), store)
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let bus = EventBus::new();
        let (log, seen) = recorder::<&'static str>();

        let first = log.clone();
        bus.on_connection_change(move |_| first.lock().push("first"));
        let second = log.clone();
        bus.on_connection_change(move |_| second.lock().push("second"));
        let third = log.clone();
        bus.on_connection_change(move |_| third.lock().push("third"));

        bus.emit_connection_state(ConnectionState::Connecting);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_categories_are_independent() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        bus.on_audio_data(move |samples| {
            assert_eq!(samples.len(), 3);
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_connection_state(ConnectionState::Connected);
        bus.emit_error(&VocalsError::NotConnected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.emit_audio_data(&[0.1, 0.2, 0.3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = bus.on_error(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        assert!(sub.remove());
        assert!(!sub.remove());
        assert!(!sub.is_active());

        bus.emit_error(&VocalsError::NotConnected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.handler_count(EventCategory::Error), 0);
    }

    #[test]
    fn test_remove_only_targets_its_own_handler() {
        let bus = EventBus::new();
        let (log, seen) = recorder::<u32>();

        let a = log.clone();
        let sub_a = bus.on_connection_change(move |_| a.lock().push(1));
        let b = log.clone();
        bus.on_connection_change(move |_| b.lock().push(2));

        sub_a.remove();
        bus.emit_connection_state(ConnectionState::Connected);
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_remove_from_inside_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let c = calls.clone();
        let s = slot.clone();
        let sub = bus.on_connection_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().as_ref() {
                sub.remove();
            }
        });
        *slot.lock() = Some(sub);

        bus.emit_connection_state(ConnectionState::Connecting);
        bus.emit_connection_state(ConnectionState::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_removed_by_earlier_handler_is_skipped() {
        let bus = EventBus::new();
        let late_calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let s = slot.clone();
        bus.on_connection_change(move |_| {
            if let Some(sub) = s.lock().as_ref() {
                sub.remove();
            }
        });
        let c = late_calls.clone();
        let late = bus.on_connection_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        *slot.lock() = Some(late);

        bus.emit_connection_state(ConnectionState::Connected);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let (errors, seen_errors) = recorder::<VocalsError>();
        let after = Arc::new(AtomicUsize::new(0));

        bus.on_error(move |e| errors.lock().push(e.clone()));
        bus.on_connection_change(|_| panic!("handler exploded"));
        let a = after.clone();
        bus.on_connection_change(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_connection_state(ConnectionState::Connected);

        assert_eq!(after.load(Ordering::SeqCst), 1);
        let seen = seen_errors.lock();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            VocalsError::Handler(msg) => {
                assert!(msg.contains("connection_change"));
                assert!(msg.contains("handler exploded"));
            }
            other => panic!("Expected Handler error, got {other:?}"),
        }
    }

    #[test]
    fn test_panicking_error_handler_does_not_recurse() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        bus.on_error(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            panic!("error handler exploded");
        });

        bus.emit_error(&VocalsError::NotConnected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = EventBus::new();
        let sub = bus.on_message(|_| {});
        drop(bus);

        assert!(!sub.is_active());
        assert!(!sub.remove());
    }

    #[test]
    fn test_clear_removes_everything() {
        let bus = EventBus::new();
        let sub = bus.on_message(|_| {});
        bus.on_error(|_| {});
        bus.on_audio_data(|_| {});

        bus.clear();
        assert!(!sub.is_active());
        for category in [
            EventCategory::Message,
            EventCategory::ConnectionChange,
            EventCategory::Error,
            EventCategory::AudioData,
        ] {
            assert_eq!(bus.handler_count(category), 0);
        }
    }
}
