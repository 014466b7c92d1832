//! Watch-driven synchronization between the local mirror and the backend.
//!
//! One engine instance serves all trees of a service. A single dispatcher
//! task consumes the backend's notification stream and routes each event to
//! the bound node's refresh queue; a per-node task drains that queue
//! sequentially, so refreshes for one node are ordered while the delivery
//! path never blocks on refresh work. Flush pushes dirty local state out;
//! refresh and sync pull backend state in, with local dirty facets winning.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::tree::decode_properties;
use crate::tree::property_diff;
use crate::tree::NodeInner;
use crate::tree::VersionedNodeState;
use crate::utils;
use crate::utils::retry_with_backoff;
use crate::BackendError;
use crate::BackendEvent;
use crate::ConnectionState;
use crate::CoordinationBackend;
use crate::CreateMode;
use crate::Error;
use crate::PreferenceEvent;
use crate::PreferenceNode;
use crate::Result;
use crate::RetryPolicies;
use crate::Settings;
use crate::FRESH_ENTRY_DATA_VERSION;

/// What a queued refresh should re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshKind {
    Data,
    Children,
    Deleted,
    /// Both facets; used when re-arming watches after a reconnect
    Full,
}

struct NodeHandle {
    node: Weak<NodeInner>,
    tx: mpsc::UnboundedSender<RefreshKind>,
}

pub(crate) struct SyncEngine {
    backend: Arc<dyn CoordinationBackend>,
    settings: Settings,
    /// Bound nodes by backend path
    registry: DashMap<String, NodeHandle>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub(crate) fn new(backend: Arc<dyn CoordinationBackend>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            backend,
            settings,
            registry: DashMap::new(),
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn backend(&self) -> Arc<dyn CoordinationBackend> {
        Arc::clone(&self.backend)
    }

    pub(crate) fn retry(&self) -> &RetryPolicies {
        &self.settings.retry
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.settings.backend.namespace
    }

    pub(crate) fn convergence_window(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.settings.backend.convergence_timeout_ms),
            Duration::from_millis(self.settings.backend.convergence_poll_ms),
        )
    }

    /// Spawns the dispatcher task consuming the backend notification stream.
    pub(crate) fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut events = self.backend.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => engine.route(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("backend event stream lagged by {}; re-arming all watches", missed);
                            engine.rearm_all();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("sync engine dispatcher stopped");
        });
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn route(&self, event: BackendEvent) {
        match event {
            BackendEvent::Connection(ConnectionState::Disconnected) => {
                warn!("coordination service connection lost; watches are stale");
                self.connected.store(false, Ordering::SeqCst);
            }
            BackendEvent::Connection(ConnectionState::Connected) => {
                let was_connected = self.connected.swap(true, Ordering::SeqCst);
                if !was_connected {
                    info!(
                        "coordination service reconnected; re-arming watches for {} bound nodes",
                        self.registry.len()
                    );
                    self.rearm_all();
                }
            }
            BackendEvent::DataChanged { path } => self.enqueue(&path, RefreshKind::Data),
            BackendEvent::ChildrenChanged { path } => self.enqueue(&path, RefreshKind::Children),
            BackendEvent::Deleted { path } => self.enqueue(&path, RefreshKind::Deleted),
        }
    }

    /// Hands a notification to the bound node's refresh queue. The refresh
    /// itself runs on the node's own task; the delivery path never blocks.
    fn enqueue(&self, path: &str, kind: RefreshKind) {
        let mut dead = false;
        if let Some(handle) = self.registry.get(path) {
            if handle.node.strong_count() == 0 {
                dead = true;
            } else {
                let _ = handle.tx.send(kind);
            }
        }
        if dead {
            self.registry.remove(path);
        }
    }

    fn rearm_all(&self) {
        self.registry.retain(|_, handle| {
            if handle.node.strong_count() == 0 {
                return false;
            }
            let _ = handle.tx.send(RefreshKind::Full);
            true
        });
    }

    /// Binds an activated node: records it in the registry and spawns its
    /// refresh-queue drain task. The task holds only a weak reference and
    /// exits when the node is dropped, removed, or the engine shuts down.
    pub(crate) fn register(self: &Arc<Self>, node: &Arc<NodeInner>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // A write can land between the priming read and this registration;
        // the dispatcher drops notifications for unbound paths. Seed the
        // queue with a full refresh so nothing raced into that window stays
        // unobserved.
        let _ = tx.send(RefreshKind::Full);
        self.registry.insert(
            node.backend_path.clone(),
            NodeHandle {
                node: Arc::downgrade(node),
                tx,
            },
        );
        let engine = Arc::clone(self);
        let weak = Arc::downgrade(node);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    kind = rx.recv() => {
                        let Some(kind) = kind else { break };
                        let Some(node) = weak.upgrade() else { break };
                        if node.removed.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = engine.refresh(&node, kind).await {
                            // Queue stays alive; the next watch event retries.
                            warn!("refresh of {} failed: {:?}", node.backend_path, e);
                        }
                    }
                }
            }
        });
    }

    pub(crate) fn unregister(&self, backend_path: &str) {
        self.registry.remove(backend_path);
    }

    async fn refresh(&self, node: &Arc<NodeInner>, kind: RefreshKind) -> Result<()> {
        match kind {
            RefreshKind::Deleted => self.handle_remote_delete(node).await,
            RefreshKind::Data => self.refresh_data(node).await,
            RefreshKind::Children => self.refresh_children(node).await,
            RefreshKind::Full => {
                self.refresh_data(node).await?;
                if node.removed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.refresh_children(node).await
            }
        }
    }

    /// Explicit `sync()`: pull both facets fresh, re-arming watches.
    pub(crate) async fn sync_node(&self, node: &Arc<NodeInner>) -> Result<()> {
        self.refresh_data(node).await?;
        if node.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.refresh_children(node).await
    }

    /// Pushes all dirty state reachable from `node` down to the backend.
    pub(crate) async fn flush_tree(&self, node: &Arc<NodeInner>) -> Result<()> {
        node.activate().await?;
        self.flush_recursive(node).await?;
        Ok(())
    }

    /// Flushes one node, then its materialized children. Returns the
    /// parent's child-membership version observed when this node's backend
    /// entry was created during this flush, if it was.
    fn flush_recursive<'a>(
        &'a self,
        node: &'a Arc<NodeInner>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + 'a>> {
        Box::pin(async move {
            node.ensure_live()?;
            let created_cv = self.flush_own(node).await?;
            let children: Vec<Arc<NodeInner>> = {
                let core = node.core.lock().await;
                core.children.values().cloned().collect()
            };
            for child in children {
                if child.removed.load(Ordering::SeqCst) {
                    continue;
                }
                child.activate().await?;
                let child_created = self.flush_recursive(&child).await?;
                let mut core = node.core.lock().await;
                let was_added = core.added_children.remove(&child.name);
                if was_added || child_created.is_some() {
                    let mut state = (*node.state.load_full()).clone();
                    state.add_child_name(&child.name);
                    if let Some(cv) = child_created {
                        state.observe_children_version(cv);
                    }
                    node.state.store(Arc::new(state));
                }
            }
            Ok(created_cv)
        })
    }

    /// Pushes this node's own dirty facets: property blob (creating the
    /// entry lazily when it does not exist yet) and pending child deletions.
    /// Dirty flags are cleared only after the corresponding write succeeds.
    async fn flush_own(&self, node: &Arc<NodeInner>) -> Result<Option<u64>> {
        let mut core = node.core.lock().await;
        node.ensure_live()?;
        let mut created_cv = None;
        let state = node.state.load_full();

        if !core.exists_on_backend {
            // Created parent-first: a dirty node or one with children to push
            // needs its entry before any child flush references it.
            let should_create =
                core.pending_create || core.props_dirty || !core.added_children.is_empty();
            if should_create {
                let blob = state.encode_properties()?;
                match retry_with_backoff(&self.settings.retry.flush, || {
                    self.create_recursive(&node.backend_path, &blob)
                })
                .await
                {
                    Ok(cv) => {
                        core.exists_on_backend = true;
                        core.pending_create = false;
                        core.props_dirty = false;
                        let mut fresh = (*node.state.load_full()).clone();
                        fresh.set_properties_version(FRESH_ENTRY_DATA_VERSION);
                        node.state.store(Arc::new(fresh));
                        created_cv = Some(cv);
                        debug!("created backend entry {}", node.backend_path);
                    }
                    // A node that was not locally created can legitimately
                    // find its entry already present (another replica, or an
                    // auto-created ancestor); adopt it and push properties.
                    Err(Error::Backend(BackendError::NodeExists(_))) if !core.pending_create => {
                        core.exists_on_backend = true;
                        if core.props_dirty {
                            let version = retry_with_backoff(&self.settings.retry.flush, || {
                                self.backend.write_data(&node.backend_path, &blob)
                            })
                            .await?;
                            core.props_dirty = false;
                            let mut fresh = (*node.state.load_full()).clone();
                            fresh.set_properties_version(version);
                            node.state.store(Arc::new(fresh));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        } else if core.props_dirty {
            let blob = state.encode_properties()?;
            let version = retry_with_backoff(&self.settings.retry.flush, || {
                self.backend.write_data(&node.backend_path, &blob)
            })
            .await?;
            core.props_dirty = false;
            let mut fresh = (*node.state.load_full()).clone();
            fresh.set_properties_version(version);
            node.state.store(Arc::new(fresh));
            debug!("flushed properties of {} (v{})", node.backend_path, version);
        }

        let doomed: Vec<String> = core.removed_children.iter().cloned().collect();
        for name in doomed {
            let child_path = utils::join_backend(&node.backend_path, &name);
            match retry_with_backoff(&self.settings.retry.flush, || {
                self.backend.delete_node(&child_path)
            })
            .await
            {
                Ok(cv) => {
                    core.removed_children.remove(&name);
                    let mut fresh = (*node.state.load_full()).clone();
                    fresh.observe_children_version(cv);
                    node.state.store(Arc::new(fresh));
                    debug!("deleted backend entry {}", child_path);
                }
                // Another replica got there first; the removal is done.
                Err(Error::Backend(BackendError::NoNode(_))) => {
                    core.removed_children.remove(&name);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(created_cv)
    }

    /// Creates an entry, building missing ancestors with empty property
    /// blobs. Returns the direct parent's new child-membership version.
    async fn create_recursive(&self, path: &str, blob: &[u8]) -> Result<u64> {
        match self
            .backend
            .create_node(path, blob, CreateMode::Persistent)
            .await
        {
            Ok(cv) => Ok(cv),
            Err(Error::Backend(BackendError::NoNode(_))) => {
                let empty = VersionedNodeState::default().encode_properties()?;
                for ancestor in utils::ancestors(path) {
                    match self
                        .backend
                        .create_node(&ancestor, &empty, CreateMode::Persistent)
                        .await
                    {
                        Ok(_) => {}
                        Err(Error::Backend(BackendError::NodeExists(_))) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.backend
                    .create_node(path, blob, CreateMode::Persistent)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Re-reads the node's property blob. Skipped entirely while local
    /// property changes are pending (local dirty wins). Differences fire
    /// property-changed events on the node's listeners.
    async fn refresh_data(&self, node: &Arc<NodeInner>) -> Result<()> {
        let snapshot = retry_with_backoff(&self.settings.retry.sync, || {
            self.backend.read_with_watch(&node.backend_path)
        })
        .await?;

        let mut core = node.core.lock().await;
        if node.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !snapshot.exists {
            // Only a deletion if the entry was seen before; a locally created
            // node legitimately has none until its first flush.
            if core.pending_create || !core.exists_on_backend {
                return Ok(());
            }
            drop(core);
            return self.handle_remote_delete(node).await;
        }

        let properties = decode_properties(&snapshot.data)?;
        core.exists_on_backend = true;
        if core.props_dirty {
            debug!(
                "skipping data refresh of {}: local changes pending",
                node.backend_path
            );
            return Ok(());
        }
        let old = node.state.load_full();
        if snapshot.version == old.properties_version() && *old.properties() == properties {
            return Ok(());
        }
        let diff = property_diff(old.properties(), &properties);
        let mut state = (*old).clone();
        state.replace_properties(properties, snapshot.version);
        node.state.store(Arc::new(state));
        for (key, old_value, new_value) in diff {
            let event = PreferenceEvent::PropertyChanged {
                node: PreferenceNode::from_inner(Arc::clone(node)),
                key,
                old_value,
                new_value,
            };
            node.listeners.fire_property_event(&event);
        }
        Ok(())
    }

    /// Re-reads the node's child list. Skipped entirely while local
    /// membership changes are pending (local dirty wins). New remote
    /// children are materialized and announced; vanished ones are removed
    /// with the same cascade and event a local removal produces.
    async fn refresh_children(&self, node: &Arc<NodeInner>) -> Result<()> {
        let snapshot = match retry_with_backoff(&self.settings.retry.sync, || {
            self.backend.read_children_with_watch(&node.backend_path)
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(Error::Backend(BackendError::NoNode(_))) => {
                let seen_before = {
                    let core = node.core.lock().await;
                    core.exists_on_backend && !core.pending_create
                };
                if seen_before {
                    return self.handle_remote_delete(node).await;
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut core = node.core.lock().await;
        if node.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        core.exists_on_backend = true;
        if !core.added_children.is_empty() || !core.removed_children.is_empty() {
            debug!(
                "skipping children refresh of {}: local membership changes pending",
                node.backend_path
            );
            return Ok(());
        }

        let remote: BTreeSet<String> = snapshot.names.into_iter().collect();
        let old = node.state.load_full();
        if remote == *old.child_names() && snapshot.version == old.children_version() {
            return Ok(());
        }
        let added: Vec<String> = remote.difference(old.child_names()).cloned().collect();
        let dropped: Vec<String> = old.child_names().difference(&remote).cloned().collect();
        let mut state = (*old).clone();
        state.replace_child_names(remote, snapshot.version);
        node.state.store(Arc::new(state));

        let mut events = Vec::new();
        for name in added {
            let child = match core.children.get(&name) {
                Some(existing) => Arc::clone(existing),
                None => NodeInner::materialize(node, &mut core, &name, false),
            };
            events.push(PreferenceEvent::ChildAdded {
                parent: node.handle(),
                child: child.handle(),
            });
        }
        for name in dropped {
            let child = match core.children.remove(&name) {
                Some(child) => child,
                // Never materialized; synthesize an inert handle for the event.
                None => NodeInner::detached_child(node, &name),
            };
            child.mark_removed_subtree().await;
            events.push(PreferenceEvent::ChildRemoved {
                parent: node.handle(),
                child: child.handle(),
            });
        }
        for event in &events {
            node.listeners.fire_node_event(event);
        }
        Ok(())
    }

    /// The backend no longer has this node's entry: mirror what a local
    /// `remove_node()` does, so remote and local removal are observationally
    /// identical to listeners. Fires at most once per node.
    async fn handle_remote_delete(&self, node: &Arc<NodeInner>) -> Result<()> {
        if node.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(parent) = node.parent.upgrade() else {
            warn!(
                "backend entry for scope root {} deleted remotely; marking tree removed",
                node.backend_path
            );
            node.mark_removed_subtree().await;
            return Ok(());
        };

        let mut pcore = parent.core.lock().await;
        if node.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let name = node.name.clone();
        // The parent may already hold a fresh node under this name; this one
        // is then a stale predecessor and only needs to die quietly.
        let stale = pcore
            .children
            .get(&name)
            .map(|current| !Arc::ptr_eq(current, node))
            .unwrap_or(false);
        if stale {
            drop(pcore);
            node.mark_removed_subtree().await;
            return Ok(());
        }
        let was_materialized = pcore.children.remove(&name).is_some();
        let was_known = was_materialized || parent.state.load().child_names().contains(&name);
        if parent.state.load().child_names().contains(&name) {
            let mut state = (*parent.state.load_full()).clone();
            state.remove_child_name(&name);
            parent.state.store(Arc::new(state));
        }
        node.mark_removed_subtree().await;
        if was_known {
            let event = PreferenceEvent::ChildRemoved {
                parent: parent.handle(),
                child: PreferenceNode::from_inner(Arc::clone(node)),
            };
            parent.listeners.fire_node_event(&event);
        }
        Ok(())
    }
}
