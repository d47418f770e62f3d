//! Observer-based event dispatch.
//!
//! A session has zero or more observers, each registered through
//! [`observe`] and removed through the returned [`ObserverHandle`]. This replaces the single-delegate callback object
//! of classic MQTT wrappers: observers are independent, and lifetime is
//! explicit instead of being inferred from reference reachability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;

use mqtt311_protocol::{MqttError, QoS};

/// Connection lifecycle state, exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A PUBLISH delivered by the broker. Constructed per packet and not
/// retained by the engine after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Hooks for session events. Every method has an empty default body, so
/// implementors override only what they care about.
pub trait ClientObserver: Send + Sync {
    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        let _ = (old, new);
    }

    fn on_message(&self, message: &InboundMessage) {
        let _ = message;
    }

    /// A `QoS` > 0 PUBLISH left the client with this identifier.
    fn on_publish_sent(&self, packet_id: u16) {
        let _ = packet_id;
    }

    /// The broker completed the publish flow for this identifier.
    fn on_publish_acked(&self, packet_id: u16) {
        let _ = packet_id;
    }

    fn on_error(&self, error: &MqttError) {
        let _ = error;
    }
}

/// Fan-out of session events to registered observers, in registration
/// order.
#[derive(Default)]
pub struct EventDispatcher {
    observers: RwLock<Vec<(u64, Arc<dyn ClientObserver>)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer and return its id; prefer [`observe`] when an
    /// [`ObserverHandle`] is wanted.
    pub fn add_observer(&self, observer: Arc<dyn ClientObserver>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers.write().push((id, observer));
        id
    }

    /// Remove an observer by id; returns whether it was registered.
    pub fn cancel(&self, id: u64) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() < before
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    // Snapshot under the lock, invoke outside it, so an observer may
    // register or cancel observers from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn ClientObserver>> {
        self.observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn state_changed(&self, old: ConnectionState, new: ConnectionState) {
        for observer in self.snapshot() {
            observer.on_state_changed(old, new);
        }
    }

    pub(crate) fn message(&self, message: &InboundMessage) {
        for observer in self.snapshot() {
            observer.on_message(message);
        }
    }

    pub(crate) fn publish_sent(&self, packet_id: u16) {
        for observer in self.snapshot() {
            observer.on_publish_sent(packet_id);
        }
    }

    pub(crate) fn publish_acked(&self, packet_id: u16) {
        for observer in self.snapshot() {
            observer.on_publish_acked(packet_id);
        }
    }

    pub(crate) fn error(&self, error: &MqttError) {
        for observer in self.snapshot() {
            observer.on_error(error);
        }
    }
}

/// Register an observer on a shared dispatcher; cancel it via the
/// returned handle.
pub fn observe(
    dispatcher: &Arc<EventDispatcher>,
    observer: Arc<dyn ClientObserver>,
) -> ObserverHandle {
    let id = dispatcher.add_observer(observer);
    ObserverHandle {
        id,
        dispatcher: Arc::downgrade(dispatcher),
    }
}

/// Registration token for one observer. Cancelling is explicit; dropping
/// the handle leaves the observer registered.
#[derive(Debug)]
pub struct ObserverHandle {
    id: u64,
    dispatcher: Weak<EventDispatcher>,
}

impl ObserverHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unregister the observer. Returns `false` when the session is gone
    /// or the observer was already cancelled.
    pub fn cancel(self) -> bool {
        self.dispatcher
            .upgrade()
            .is_some_and(|dispatcher| dispatcher.cancel(self.id))
    }
}
