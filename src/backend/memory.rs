//! In-process coordination backend.
//!
//! Implements the full [`CoordinationBackend`] contract against a mutex-held
//! tree: versioned entries, recursive deletes, and change notifications on a
//! broadcast stream. Two engine instances sharing one `MemoryBackend` behave
//! as two replicas of the same ensemble, which makes this the embedded
//! deployment mode as well as the integration-test substrate.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::BackendEvent;
use super::ChildrenSnapshot;
use super::ConnectionState;
use super::CoordinationBackend;
use super::CreateMode;
use super::NodeSnapshot;
use super::FRESH_ENTRY_DATA_VERSION;
use crate::utils::split_backend;
use crate::BackendError;
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Entry {
    data: Vec<u8>,
    data_version: u64,
    child_version: u64,
    children: BTreeSet<String>,
    /// Dies with the session (expired on `set_connected(false)`)
    ephemeral: bool,
}

pub struct MemoryBackend {
    tree: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<BackendEvent>,
    connected: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tree: Mutex::new(HashMap::new()),
            events,
            connected: AtomicBool::new(true),
        }
    }

    /// Failure injection: while down, every operation fails with
    /// [`BackendError::ConnectionLost`]. Losing the connection ends the
    /// session, so ephemeral entries expire. Transitions are announced on
    /// the event stream so engines can re-arm watches on recovery.
    pub fn set_connected(&self, up: bool) {
        let was = self.connected.swap(up, Ordering::SeqCst);
        if was == up {
            return;
        }
        if !up {
            self.expire_ephemeral();
        }
        let state = if up {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let _ = self.events.send(BackendEvent::Connection(state));
    }

    /// Removes every ephemeral entry (with its subtree), bumping parent
    /// child versions, as a real ensemble does when the owning session ends.
    fn expire_ephemeral(&self) {
        let mut deleted = Vec::new();
        let mut touched_parents = Vec::new();
        {
            let mut tree = self.tree.lock();
            let expiring: Vec<String> = tree
                .iter()
                .filter(|(_, entry)| entry.ephemeral)
                .map(|(path, _)| path.clone())
                .collect();
            for path in expiring {
                // May already be gone as part of another expiring subtree.
                if !tree.contains_key(&path) {
                    continue;
                }
                let subtree_prefix = format!("{}/", path);
                let mut doomed: Vec<String> = tree
                    .keys()
                    .filter(|p| p.as_str() == path || p.starts_with(&subtree_prefix))
                    .cloned()
                    .collect();
                doomed.sort_by_key(|p| std::cmp::Reverse(p.len()));
                for p in doomed {
                    tree.remove(&p);
                    deleted.push(p);
                }
                if let Some((parent, name)) = split_backend(&path) {
                    if let Some(entry) = tree.get_mut(parent) {
                        entry.children.remove(name);
                        entry.child_version += 1;
                        touched_parents.push(parent.to_string());
                    }
                }
            }
        }
        for p in deleted {
            self.emit(BackendEvent::Deleted { path: p });
        }
        for p in touched_parents {
            self.emit(BackendEvent::ChildrenChanged { path: p });
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::ConnectionLost.into())
        }
    }

    fn emit(&self, event: BackendEvent) {
        // No subscribers is fine; broadcast::send only fails on zero receivers.
        let _ = self.events.send(event);
    }

    fn validate_path(path: &str) -> Result<(&str, &str)> {
        split_backend(path).ok_or_else(|| BackendError::NoNode(path.to_string()).into())
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    async fn read_with_watch(&self, path: &str) -> Result<NodeSnapshot> {
        self.ensure_connected()?;
        let tree = self.tree.lock();
        Ok(match tree.get(path) {
            Some(entry) => NodeSnapshot {
                exists: true,
                data: entry.data.clone(),
                version: entry.data_version,
            },
            None => NodeSnapshot::default(),
        })
    }

    async fn read_children_with_watch(&self, path: &str) -> Result<ChildrenSnapshot> {
        self.ensure_connected()?;
        let tree = self.tree.lock();
        let entry = tree
            .get(path)
            .ok_or_else(|| BackendError::NoNode(path.to_string()))?;
        Ok(ChildrenSnapshot {
            names: entry.children.iter().cloned().collect(),
            version: entry.child_version,
        })
    }

    async fn create_node(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<u64> {
        self.ensure_connected()?;
        let (parent, name) = Self::validate_path(path)?;
        let parent_version;
        {
            let mut tree = self.tree.lock();
            if tree.contains_key(path) {
                return Err(BackendError::NodeExists(path.to_string()).into());
            }
            if parent != "/" && !tree.contains_key(parent) {
                return Err(BackendError::NoNode(parent.to_string()).into());
            }
            tree.insert(
                path.to_string(),
                Entry {
                    data: data.to_vec(),
                    data_version: FRESH_ENTRY_DATA_VERSION,
                    child_version: 0,
                    children: BTreeSet::new(),
                    ephemeral: mode == CreateMode::Ephemeral,
                },
            );
            parent_version = match tree.get_mut(parent) {
                Some(p) => {
                    p.children.insert(name.to_string());
                    p.child_version += 1;
                    p.child_version
                }
                // Direct child of the virtual root; nothing to version there.
                None => 0,
            };
        }
        self.emit(BackendEvent::DataChanged {
            path: path.to_string(),
        });
        self.emit(BackendEvent::ChildrenChanged {
            path: parent.to_string(),
        });
        Ok(parent_version)
    }

    async fn delete_node(&self, path: &str) -> Result<u64> {
        self.ensure_connected()?;
        let (parent, name) = Self::validate_path(path)?;
        let mut deleted = Vec::new();
        let parent_version;
        {
            let mut tree = self.tree.lock();
            if !tree.contains_key(path) {
                return Err(BackendError::NoNode(path.to_string()).into());
            }
            let subtree_prefix = format!("{}/", path);
            let mut doomed: Vec<String> = tree
                .keys()
                .filter(|p| p.as_str() == path || p.starts_with(&subtree_prefix))
                .cloned()
                .collect();
            // Deepest first, mirroring the order a real ensemble would apply.
            doomed.sort_by_key(|p| std::cmp::Reverse(p.len()));
            for p in doomed {
                tree.remove(&p);
                deleted.push(p);
            }
            parent_version = match tree.get_mut(parent) {
                Some(p) => {
                    p.children.remove(name);
                    p.child_version += 1;
                    p.child_version
                }
                None => 0,
            };
        }
        for p in deleted {
            self.emit(BackendEvent::Deleted { path: p });
        }
        self.emit(BackendEvent::ChildrenChanged {
            path: parent.to_string(),
        });
        Ok(parent_version)
    }

    async fn write_data(&self, path: &str, data: &[u8]) -> Result<u64> {
        self.ensure_connected()?;
        let version;
        {
            let mut tree = self.tree.lock();
            let entry = tree
                .get_mut(path)
                .ok_or_else(|| BackendError::NoNode(path.to_string()))?;
            entry.data = data.to_vec();
            entry.data_version += 1;
            version = entry.data_version;
        }
        self.emit(BackendEvent::DataChanged {
            path: path.to_string(),
        });
        Ok(version)
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
