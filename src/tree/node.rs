//! The mirrored tree node.
//!
//! A `PreferenceNode` is a cheap-clone handle onto one node of a mirrored
//! subtree. Mutations are applied to the local mirror immediately (firing
//! local listeners synchronously) and only become visible to other replicas
//! on `flush()`; remote changes arrive through the sync engine's watch
//! pipeline. Each node's mutations are serialized by a per-node lock;
//! operations on different nodes never contend.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::debug;

use super::activation::ActivationGate;
use super::state::decode_properties;
use super::state::VersionedNodeState;
use crate::events::ListenerRegistry;
use crate::service::RootGuard;
use crate::sync::SyncEngine;
use crate::utils;
use crate::utils::retry_with_backoff;
use crate::ListenerId;
use crate::PreferenceEvent;
use crate::Result;
use crate::TreeError;

/// Handle to one node of a mirrored preference tree.
///
/// Handles are cheap to clone and share; all clones address the same
/// underlying node. A node's lifetime is bounded by its parent's lifetime
/// (children hold only a weak back-reference), except for the scope root,
/// whose lifetime is bounded by the owning service.
#[derive(Clone)]
pub struct PreferenceNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for PreferenceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceNode")
            .field("path", &self.inner.path)
            .field("removed", &self.inner.removed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Local dirty bookkeeping and the lazily materialized child map, serialized
/// by the node's mutex. Held across backend round trips during flush/sync so
/// those, too, serialize with local mutations.
#[derive(Default)]
pub(crate) struct NodeCore {
    /// Whether the backend currently has an entry for this path
    pub(crate) exists_on_backend: bool,
    /// Node was created locally; its entry is created on first flush
    pub(crate) pending_create: bool,
    /// Own property map has unpushed local changes
    pub(crate) props_dirty: bool,
    /// Children created locally but not yet pushed
    pub(crate) added_children: BTreeSet<String>,
    /// Children removed locally but not yet pushed
    pub(crate) removed_children: BTreeSet<String>,
    /// Materialized children (not necessarily all backend children)
    pub(crate) children: HashMap<String, Arc<NodeInner>>,
}

pub(crate) struct NodeInner {
    pub(crate) name: String,
    /// Logical path from the scope root (`/` for the root itself)
    pub(crate) path: String,
    /// Corresponding path in the coordination-service namespace
    pub(crate) backend_path: String,
    pub(crate) parent: Weak<NodeInner>,
    pub(crate) engine: Arc<SyncEngine>,
    pub(crate) state: ArcSwap<VersionedNodeState>,
    pub(crate) core: Mutex<NodeCore>,
    /// One-way flag; checked lock-free on hot paths, flipped under `core`
    pub(crate) removed: AtomicBool,
    pub(crate) gate: ActivationGate,
    pub(crate) listeners: ListenerRegistry,
    /// Present only on scope roots; releases the singleton registration
    #[allow(dead_code)]
    root_guard: Option<RootGuard>,
}

impl NodeInner {
    pub(crate) fn new_root(name: &str, engine: Arc<SyncEngine>, guard: RootGuard) -> Arc<Self> {
        let backend_path = utils::join_backend(engine.namespace(), name);
        Arc::new(Self {
            name: name.to_string(),
            path: "/".to_string(),
            backend_path,
            parent: Weak::new(),
            engine,
            state: ArcSwap::from_pointee(VersionedNodeState::default()),
            core: Mutex::new(NodeCore::default()),
            removed: AtomicBool::new(false),
            gate: ActivationGate::default(),
            listeners: ListenerRegistry::default(),
            root_guard: Some(guard),
        })
    }

    fn new_child(parent: &Arc<Self>, name: &str, pending_create: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            path: utils::join_logical(&parent.path, name),
            backend_path: utils::join_backend(&parent.backend_path, name),
            parent: Arc::downgrade(parent),
            engine: Arc::clone(&parent.engine),
            state: ArcSwap::from_pointee(VersionedNodeState::default()),
            core: Mutex::new(NodeCore {
                pending_create,
                ..NodeCore::default()
            }),
            removed: AtomicBool::new(false),
            gate: ActivationGate::default(),
            listeners: ListenerRegistry::default(),
            root_guard: None,
        })
    }

    /// Inserts a new child into the parent's materialized map. Caller holds
    /// the parent's core lock.
    pub(crate) fn materialize(
        parent: &Arc<Self>,
        core: &mut NodeCore,
        name: &str,
        pending_create: bool,
    ) -> Arc<Self> {
        let child = Self::new_child(parent, name, pending_create);
        core.children.insert(name.to_string(), Arc::clone(&child));
        child
    }

    /// Builds a handle for a child that was never materialized, used when a
    /// removal event must still carry a child reference. Not inserted into
    /// the parent's child map.
    pub(crate) fn detached_child(parent: &Arc<Self>, name: &str) -> Arc<Self> {
        Self::new_child(parent, name, false)
    }

    pub(crate) fn handle(self: &Arc<Self>) -> PreferenceNode {
        PreferenceNode {
            inner: Arc::clone(self),
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root_guard.is_some()
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.removed.load(Ordering::SeqCst) {
            Err(TreeError::AlreadyRemoved {
                path: self.path.clone(),
            }
            .into())
        } else {
            Ok(())
        }
    }

    /// Lazily binds the node to the backend: exactly one caller primes,
    /// concurrent first-touchers wait, failures are retried on next touch.
    pub(crate) async fn activate(self: &Arc<Self>) -> Result<()> {
        self.ensure_live()?;
        let this = Arc::clone(self);
        self.gate.ensure(move || async move { this.prime().await }).await
    }

    async fn prime(self: Arc<Self>) -> Result<()> {
        let backend = self.engine.backend();
        let policy = self.engine.retry().activation;
        let snapshot =
            retry_with_backoff(&policy, || backend.read_with_watch(&self.backend_path)).await?;
        let mut state = VersionedNodeState::default();
        if snapshot.exists {
            let properties = decode_properties(&snapshot.data)?;
            state.replace_properties(properties, snapshot.version);
            let children = retry_with_backoff(&policy, || {
                backend.read_children_with_watch(&self.backend_path)
            })
            .await?;
            state.replace_child_names(children.names.into_iter().collect(), children.version);
        }
        {
            let mut core = self.core.lock().await;
            core.exists_on_backend = snapshot.exists;
            self.state.store(Arc::new(state));
            drop(core);
        }
        self.engine.register(&self);
        debug!(
            "activated {} (exists={})",
            self.backend_path, snapshot.exists
        );
        Ok(())
    }

    /// Eagerly marks this node and every materialized descendant removed,
    /// discarding their dirty state and unbinding them from the engine.
    /// Removed nodes are permanently inert and never resurrected.
    pub(crate) async fn mark_removed_subtree(self: &Arc<Self>) {
        let mut stack = vec![Arc::clone(self)];
        while let Some(node) = stack.pop() {
            node.removed.store(true, Ordering::SeqCst);
            node.engine.unregister(&node.backend_path);
            let mut core = node.core.lock().await;
            core.props_dirty = false;
            core.pending_create = false;
            core.added_children.clear();
            core.removed_children.clear();
            stack.extend(core.children.drain().map(|(_, child)| child));
        }
    }
}

impl PreferenceNode {
    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Last path segment (the scope-root name for a root).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Logical path from the scope root; `/` for the root itself.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    pub fn parent(&self) -> Option<PreferenceNode> {
        self.inner.parent.upgrade().map(PreferenceNode::from_inner)
    }

    /// True when both handles address the same underlying node.
    pub fn same_node(&self, other: &PreferenceNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves (or locally creates) the node at `relative_path`, segment by
    /// segment. Creating a node is a local mutation: it marks the parent's
    /// child membership dirty and fires a child-added event synchronously,
    /// but touches the backend only on `flush()`.
    pub async fn node(&self, relative_path: &str) -> Result<PreferenceNode> {
        let segments = utils::split_relative(relative_path)?;
        let mut current = Arc::clone(&self.inner);
        for segment in segments {
            current.activate().await?;
            let next = {
                let mut core = current.core.lock().await;
                current.ensure_live()?;
                if let Some(child) = core.children.get(&segment) {
                    Arc::clone(child)
                } else if !core.removed_children.contains(&segment)
                    && current.state.load().child_names().contains(&segment)
                {
                    // Known from the backend; materialize without dirtying.
                    NodeInner::materialize(&current, &mut core, &segment, false)
                } else {
                    let child = NodeInner::materialize(&current, &mut core, &segment, true);
                    core.added_children.insert(segment.clone());
                    let event = PreferenceEvent::ChildAdded {
                        parent: current.handle(),
                        child: child.handle(),
                    };
                    current.listeners.fire_node_event(&event);
                    child
                }
            };
            current = next;
        }
        current.ensure_live()?;
        Ok(PreferenceNode { inner: current })
    }

    /// Whether a non-removed node currently exists at `relative_path` in the
    /// local mirror. Never creates nodes; names known from the backend count
    /// even when not yet materialized.
    pub async fn node_exists(&self, relative_path: &str) -> Result<bool> {
        let segments = utils::split_relative(relative_path)?;
        let mut current = Arc::clone(&self.inner);
        for segment in segments {
            if current.removed.load(Ordering::SeqCst) {
                return Ok(false);
            }
            current.activate().await?;
            let next = {
                let mut core = current.core.lock().await;
                if core.removed_children.contains(&segment) {
                    return Ok(false);
                }
                if let Some(child) = core.children.get(&segment) {
                    Arc::clone(child)
                } else if current.state.load().child_names().contains(&segment) {
                    NodeInner::materialize(&current, &mut core, &segment, false)
                } else {
                    return Ok(false);
                }
            };
            current = next;
        }
        Ok(!current.removed.load(Ordering::SeqCst))
    }

    /// Reads a property from the local mirror.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        utils::validate_key(key)?;
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        Ok(self.inner.state.load().property(key).map(String::from))
    }

    /// Writes a property locally, marking the node dirty and firing a
    /// property-changed event synchronously. Writing the current value is a
    /// no-op and fires nothing.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        utils::validate_key(key)?;
        self.inner.activate().await?;
        let mut core = self.inner.core.lock().await;
        self.inner.ensure_live()?;
        let old_value = self.inner.state.load().property(key).map(String::from);
        if old_value.as_deref() == Some(value) {
            return Ok(());
        }
        let mut state = (*self.inner.state.load_full()).clone();
        state.put_property(key, value);
        self.inner.state.store(Arc::new(state));
        core.props_dirty = true;
        let event = PreferenceEvent::PropertyChanged {
            node: self.clone(),
            key: key.to_string(),
            old_value,
            new_value: Some(value.to_string()),
        };
        self.inner.listeners.fire_property_event(&event);
        Ok(())
    }

    /// Removes a property locally. Removing an absent key is a no-op.
    pub async fn remove(&self, key: &str) -> Result<()> {
        utils::validate_key(key)?;
        self.inner.activate().await?;
        let mut core = self.inner.core.lock().await;
        self.inner.ensure_live()?;
        let Some(old_value) = self.inner.state.load().property(key).map(String::from) else {
            return Ok(());
        };
        let mut state = (*self.inner.state.load_full()).clone();
        state.remove_property(key);
        self.inner.state.store(Arc::new(state));
        core.props_dirty = true;
        let event = PreferenceEvent::PropertyChanged {
            node: self.clone(),
            key: key.to_string(),
            old_value: Some(old_value),
            new_value: None,
        };
        self.inner.listeners.fire_property_event(&event);
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        Ok(self.inner.state.load().keys().map(String::from).collect())
    }

    /// Child names visible in the local mirror: backend-known names plus
    /// locally created children, minus pending local removals.
    pub async fn child_names(&self) -> Result<Vec<String>> {
        self.inner.activate().await?;
        let core = self.inner.core.lock().await;
        self.inner.ensure_live()?;
        let state = self.inner.state.load_full();
        let mut names: BTreeSet<String> = state
            .child_names()
            .iter()
            .filter(|name| !core.removed_children.contains(*name))
            .cloned()
            .collect();
        for (name, child) in &core.children {
            if !child.removed.load(Ordering::SeqCst) {
                names.insert(name.clone());
            }
        }
        Ok(names.into_iter().collect())
    }

    pub async fn properties_version(&self) -> Result<u64> {
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        Ok(self.inner.state.load().properties_version())
    }

    pub async fn children_version(&self) -> Result<u64> {
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        Ok(self.inner.state.load().children_version())
    }

    /// Marks this node and all materialized descendants removed, detaches it
    /// from the parent, records the pending backend deletion in the parent's
    /// dirty child set, and fires a node-removed event synchronously to the
    /// parent's node listeners. The backend entry is deleted on the parent's
    /// next `flush()`.
    pub async fn remove_node(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_root() {
            return Err(TreeError::ScopeRootRemoval.into());
        }
        inner.ensure_live()?;
        inner.activate().await?;
        let Some(parent) = inner.parent.upgrade() else {
            return Err(TreeError::Detached {
                path: inner.path.clone(),
            }
            .into());
        };
        let mut pcore = parent.core.lock().await;
        inner.ensure_live()?;
        let name = inner.name.clone();
        pcore.children.remove(&name);
        // A child that was never flushed has no backend entry to delete.
        if !pcore.added_children.remove(&name) {
            pcore.removed_children.insert(name.clone());
        }
        if parent.state.load().child_names().contains(&name) {
            let mut state = (*parent.state.load_full()).clone();
            state.remove_child_name(&name);
            parent.state.store(Arc::new(state));
        }
        inner.mark_removed_subtree().await;
        let event = PreferenceEvent::ChildRemoved {
            parent: parent.handle(),
            child: self.clone(),
        };
        parent.listeners.fire_node_event(&event);
        Ok(())
    }

    /// Pushes all locally dirty state reachable from this node to the
    /// backend. Fires no listener events (mutations already fired them);
    /// failure preserves dirty state so a later retry can succeed.
    pub async fn flush(&self) -> Result<()> {
        self.inner.engine.flush_tree(&self.inner).await
    }

    /// Forces a fresh read of this node's state from the backend, re-arming
    /// its watches. Locally dirty facets win: a facet with pending unflushed
    /// changes is not refreshed. Remote differences fire the same events a
    /// watch-driven refresh would, synchronously to this caller.
    pub async fn sync(&self) -> Result<()> {
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        self.inner.engine.sync_node(&self.inner).await
    }

    /// Repeatedly syncs until `cond` observes the expected state or the
    /// configured convergence window elapses. Returns whether the condition
    /// was met. Watch delivery lags a sibling replica's flush by a short,
    /// bounded interval; this is the supported way to wait it out.
    pub async fn await_convergence<F>(&self, cond: F) -> Result<bool>
    where
        F: Fn(&VersionedNodeState) -> bool,
    {
        let (window, poll) = self.inner.engine.convergence_window();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            self.sync().await?;
            if cond(&self.inner.state.load_full()) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Registers a node listener (child added/removed under this node).
    /// Registration activates the node.
    pub async fn subscribe_nodes<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&PreferenceEvent) + Send + Sync + 'static,
    {
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        Ok(self.inner.listeners.subscribe_nodes(listener))
    }

    /// Registers a property listener (key changed/removed on this node).
    /// Registration activates the node.
    pub async fn subscribe_properties<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&PreferenceEvent) + Send + Sync + 'static,
    {
        self.inner.activate().await?;
        self.inner.ensure_live()?;
        Ok(self.inner.listeners.subscribe_properties(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }
}
