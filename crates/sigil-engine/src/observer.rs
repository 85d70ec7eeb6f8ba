//! Callbacks from the session to whatever renders it.
//!
//! The session holds its observer in an [`ObserverSlot`] and reads it fresh
//! for every callback, so a replacement installed with
//! `SessionHandle::set_observer` takes effect on the next event.

use std::sync::{Arc, PoisonError, RwLock};

use sigil_shared::{Address, ConnectionState, DialogId, Message, MessageId};
use tracing::info;

use crate::reconcile::Admission;

/// All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// A message was added to or changed in a timeline.
    fn on_message(&self, _message: &Message, _admission: Admission) {}

    /// A new inbound message deserves a toast, sound or badge.
    fn on_notify(&self, _message: &Message) {}

    fn on_typing(&self, _key: &DialogId, _who: &Address, _typing: bool) {}

    fn on_connection(&self, _state: ConnectionState) {}

    /// A message left a timeline: deleted, cleared or expired.
    fn on_removed(&self, _dialog_id: &DialogId, _id: &MessageId) {}
}

pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Logs every callback; used by the headless binary.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_message(&self, message: &Message, admission: Admission) {
        info!(
            dialog = %message.dialog_id,
            id = %message.id,
            from = %message.sender.short(),
            status = message.status.as_str(),
            admission = ?admission,
            text = message.plaintext.as_deref().unwrap_or_default(),
            "message"
        );
    }

    fn on_notify(&self, message: &Message) {
        info!(from = %message.sender, preview = %message.preview(), "new message");
    }

    fn on_typing(&self, key: &DialogId, who: &Address, typing: bool) {
        info!(dialog = %key, who = %who.short(), typing, "typing");
    }

    fn on_connection(&self, state: ConnectionState) {
        info!(state = ?state, "relay connection");
    }

    fn on_removed(&self, dialog_id: &DialogId, id: &MessageId) {
        info!(dialog = %dialog_id, id = %id, "message removed");
    }
}

/// Atomically swappable observer.
pub struct ObserverSlot {
    current: RwLock<Arc<dyn SessionObserver>>,
}

impl ObserverSlot {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            current: RwLock::new(observer),
        }
    }

    pub fn get(&self) -> Arc<dyn SessionObserver> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, observer: Arc<dyn SessionObserver>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }
}

impl Default for ObserverSlot {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SessionObserver for Counter {
        fn on_connection(&self, _state: ConnectionState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_swap_takes_effect_on_next_read() {
        let slot = ObserverSlot::default();
        slot.get().on_connection(ConnectionState::Open);

        let counter = Arc::new(Counter::default());
        slot.set(counter.clone());
        slot.get().on_connection(ConnectionState::Closed);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
