//! Session boundary notifications.
//!
//! Observers learn that the refresh credential is no longer valid and the
//! user has to authenticate again. The registry is owned by the
//! [`Coordinator`](super::Coordinator).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// The session ended; the user must log in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnded;

pub trait SessionObserver: Send + Sync {
    fn on_session_ended(&self, event: SessionEnded);
}

impl<F> SessionObserver for F
where
    F: Fn(SessionEnded) + Send + Sync,
{
    fn on_session_ended(&self, event: SessionEnded) {
        self(event)
    }
}

/// Handle returned by [`SessionEvents::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct SessionEvents {
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn SessionObserver>)>>,
    next_id: AtomicU64,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Notify every observer. Observers run outside the registry lock so
    /// they may subscribe or unsubscribe from the callback.
    pub(crate) fn emit(&self) {
        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        debug!(observers = observers.len(), "Emitting session ended");
        for observer in observers {
            observer.on_session_ended(SessionEnded);
        }
    }
}
