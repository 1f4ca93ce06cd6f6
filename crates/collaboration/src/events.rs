/// Typed publish/subscribe for client-side consumers. Handlers are kept
/// in a registry keyed by subscription id and can be removed at any time.
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mindmap::{Document, DocumentChange};

use crate::{
    CollaborationError, HistoryEntry, Operation, OperationId, Participant, RoomSnapshot,
    SessionId, UndoAvailability,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E> {
    handlers: RwLock<BTreeMap<SubscriptionId, Handler<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, Arc::new(handler));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    /// Calls every handler in subscription order. Handlers may subscribe
    /// or unsubscribe while being called; changes apply to the next event.
    pub fn publish(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// What a [`crate::TransportClient`] reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Joined (or re-joined after a reconnect) with a fresh snapshot.
    Connected(RoomSnapshot),
    Reconnecting {
        attempt: u32,
    },
    Disconnected,
    /// Retry budget spent; the client stays offline.
    ReconnectFailed(CollaborationError),
    JoinFailed(CollaborationError),
    /// Local document changed, by a local edit or by an operation from the
    /// room.
    DocumentChanged {
        document: Document,
        operation: Operation,
    },
    /// A local operation was refused; `corrections` were applied locally.
    OperationRejected {
        operation_id: OperationId,
        error: CollaborationError,
        corrections: Vec<DocumentChange>,
    },
    PresenceJoined(Participant),
    PresenceUpdated(Participant),
    PresenceLeft(SessionId),
    HistoryAppended(HistoryEntry),
    UndoAvailabilityChanged(UndoAvailability),
    AccessRevoked(String),
}
