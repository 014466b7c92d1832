//! Listener contract for tree mutations.
//!
//! Two listener kinds exist per node: node listeners (child added/removed),
//! registered on the parent, and property listeners (key changed/removed),
//! registered on the node whose properties change. Local mutations deliver
//! synchronously on the mutating task; remotely observed changes deliver
//! from the node's refresh task. Per-node delivery order equals mutation
//! order; no ordering is guaranteed across nodes.

mod dispatcher;
pub use dispatcher::ListenerId;
pub(crate) use dispatcher::ListenerRegistry;


use crate::PreferenceNode;

/// A single observable tree mutation. Events fire exactly once per
/// backend-visible change and never for no-ops; a remote removal produces
/// the same event shape a local `remove_node()` does.
#[derive(Debug, Clone)]
pub enum PreferenceEvent {
    ChildAdded {
        parent: PreferenceNode,
        child: PreferenceNode,
    },
    ChildRemoved {
        parent: PreferenceNode,
        child: PreferenceNode,
    },
    PropertyChanged {
        node: PreferenceNode,
        key: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
}
