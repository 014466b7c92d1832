use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use super::PreferenceEvent;

/// Stable handle for removing a registered listener.
pub type ListenerId = u64;

type Subscriber = Arc<dyn Fn(&PreferenceEvent) + Send + Sync + 'static>;

/// Per-node subscriber lists.
///
/// Listeners must not block: they run inline on the mutating task (local
/// changes) or on the node's refresh task (remote changes). The lists are
/// snapshotted before invocation, so a listener may unsubscribe itself or
/// register new listeners without deadlocking.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    node_listeners: RwLock<Vec<(ListenerId, Subscriber)>>,
    property_listeners: RwLock<Vec<(ListenerId, Subscriber)>>,
}

impl ListenerRegistry {
    pub(crate) fn subscribe_nodes<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PreferenceEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.node_listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn subscribe_properties<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PreferenceEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.property_listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener from either list. Returns false for unknown ids.
    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut removed = false;
        {
            let mut listeners = self.node_listeners.write();
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
        }
        {
            let mut listeners = self.property_listeners.write();
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    pub(crate) fn fire_node_event(&self, event: &PreferenceEvent) {
        let snapshot: Vec<Subscriber> = self
            .node_listeners
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in snapshot {
            subscriber(event);
        }
    }

    pub(crate) fn fire_property_event(&self, event: &PreferenceEvent) {
        let snapshot: Vec<Subscriber> = self
            .property_listeners
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in snapshot {
            subscriber(event);
        }
    }
}
