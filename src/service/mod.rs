//! Process-scoped preference service.
//!
//! Owns the backend handle, the sync engine, and the registry of active
//! scope roots. Everything that would otherwise be hidden static state is
//! held by this explicit context object with explicit construction and
//! teardown, which also makes the duplicate-scope-root invariant testable
//! in isolation.


use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nanoid::nanoid;
use tracing::debug;

use crate::sync::SyncEngine;
use crate::tree::NodeInner;
use crate::utils;
use crate::CoordinationBackend;
use crate::PreferenceNode;
use crate::Result;
use crate::Settings;
use crate::TreeError;

/// One synchronization context per cluster member. All scope roots obtained
/// from a service share its backend session and sync engine.
///
/// Must be constructed inside a Tokio runtime: the engine spawns its
/// dispatcher task immediately.
pub struct PreferenceService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    instance_id: String,
    engine: Arc<SyncEngine>,
    /// Names of currently live scope roots on this instance
    roots: Arc<DashMap<String, ()>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

impl PreferenceService {
    pub fn new(backend: Arc<dyn CoordinationBackend>, settings: Settings) -> Self {
        let engine = SyncEngine::new(backend, settings);
        engine.start();
        let instance_id = nanoid!(10);
        debug!("preference service {} started", instance_id);
        Self {
            inner: Arc::new(ServiceInner {
                instance_id,
                engine,
                roots: Arc::new(DashMap::new()),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Returns the root of the mirrored tree named `name`.
    ///
    /// At most one live root may exist per (service, name) pair: two
    /// independent mirrors of the same backend subtree inside one process
    /// would race on local state. A second construction attempt fails fast
    /// and never returns the existing instance; the registration is released
    /// when the root (and its tree) is dropped.
    pub fn scope_root(&self, name: &str) -> Result<PreferenceNode> {
        utils::validate_segment(name)?;
        match self.inner.roots.entry(name.to_string()) {
            Entry::Occupied(_) => Err(TreeError::DuplicateScopeRoot {
                instance_id: self.inner.instance_id.clone(),
                root: name.to_string(),
            }
            .into()),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                let guard = RootGuard {
                    roots: Arc::downgrade(&self.inner.roots),
                    name: name.to_string(),
                };
                let root = NodeInner::new_root(name, Arc::clone(&self.inner.engine), guard);
                Ok(PreferenceNode::from_inner(root))
            }
        }
    }

    /// Stops the dispatcher and every per-node refresh task. Idempotent;
    /// also performed when the service is dropped.
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }
}

/// Releases a scope root's singleton registration when the root node is
/// dropped. Holds the registry weakly so a leaked root cannot keep a
/// shut-down service alive.
pub(crate) struct RootGuard {
    roots: Weak<DashMap<String, ()>>,
    name: String,
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if let Some(roots) = self.roots.upgrade() {
            roots.remove(&self.name);
        }
    }
}
