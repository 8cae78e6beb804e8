use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

use crate::device::types::SessionSnapshot;

pub type ObserverId = u64;

enum Observer {
    Callback(Box<dyn Fn(&SessionSnapshot) + Send + Sync>),
    Channel(UnboundedSender<SessionSnapshot>),
}

impl Observer {
    // returns false once the observer can no longer receive snapshots
    fn notify(&self, snapshot: &SessionSnapshot) -> bool {
        match self {
            Observer::Callback(callback) => {
                callback(snapshot);
                true
            },
            Observer::Channel(sender) => sender.unbounded_send(snapshot.clone()).is_ok(),
        }
    }
}

struct StoreInner {
    snapshot: SessionSnapshot,
    observers: Vec<(ObserverId, Observer)>,
    next_id: ObserverId,
}

/// Holds the latest published session snapshot.
///
/// Only the session task publishes. Observers are invoked synchronously while the store is locked,
/// so every observer sees every snapshot exactly once and in publish order. An observer must not
/// call back into the store.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl SessionStore {
    pub(crate) fn new() -> Self {
        SessionStore {
            inner: Arc::new(Mutex::new(StoreInner {
                snapshot: SessionSnapshot::default(),
                observers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot.clone()
    }

    fn add_observer(inner: &mut StoreInner, observer: Observer) -> ObserverId {
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push((id, observer));
        id
    }

    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        Self::add_observer(&mut inner, Observer::Callback(Box::new(callback)))
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(observer_id, _)| *observer_id != id);
        inner.observers.len() != before
    }

    /// Yields the current snapshot, then every published snapshot in order. The channel is
    /// unregistered once the receiver is dropped.
    pub fn updates(&self) -> UnboundedReceiver<SessionSnapshot> {
        let (sender, receiver) = unbounded();
        let mut inner = self.lock();

        // cannot fail, the receiver is still held here
        let _ = sender.unbounded_send(inner.snapshot.clone());
        Self::add_observer(&mut inner, Observer::Channel(sender));
        receiver
    }

    pub(crate) fn publish(&self, snapshot: SessionSnapshot) {
        let mut inner = self.lock();
        inner.observers.retain(|(_, observer)| observer.notify(&snapshot));
        inner.snapshot = snapshot;
    }
}
