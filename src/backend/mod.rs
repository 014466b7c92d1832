//! Coordination-service contract.
//!
//! The engine consumes a ZooKeeper-like backend through this trait: reads
//! arm watches as a side effect, mutations return backend-assigned versions,
//! and a broadcast stream delivers watch and connection notifications. The
//! wire protocol behind an implementation is not this crate's concern.

mod memory;
pub use memory::*;

#[cfg(test)]
mod memory_test;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::broadcast;

use crate::Result;

/// Data version carried by a freshly created entry. Part of the backend
/// contract: the creator can adopt this without a read-back round trip.
pub const FRESH_ENTRY_DATA_VERSION: u64 = 1;

/// Result of a data read: whether the entry exists, its opaque payload, and
/// its data version. A missing entry reads as `exists == false`, version 0.
/// A freshly created entry carries data version 1.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub exists: bool,
    pub data: Vec<u8>,
    pub version: u64,
}

/// Result of a child-list read: the entry's direct child names and its
/// child-membership version.
#[derive(Debug, Clone, Default)]
pub struct ChildrenSnapshot {
    pub names: Vec<String>,
    pub version: u64,
}

/// Entry lifetime relative to the creating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
}

/// Notifications delivered on the backend's event stream. Watch events name
/// the affected backend path; connection events report session transitions.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    DataChanged { path: String },
    ChildrenChanged { path: String },
    Deleted { path: String },
    Connection(ConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// The external coordination service (e.g. a ZooKeeper ensemble).
///
/// Reads arm a watch on the target path; the corresponding notification
/// arrives on the stream returned by [`subscribe`](Self::subscribe). After a
/// `Disconnected`/`Connected` cycle all previously armed watches must be
/// considered stale and re-armed by re-reading.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Reads the entry's payload and arms a data watch.
    async fn read_with_watch(&self, path: &str) -> Result<NodeSnapshot>;

    /// Reads the entry's direct child names and arms a child watch.
    /// Fails with [`crate::BackendError::NoNode`] when the entry is missing.
    async fn read_children_with_watch(&self, path: &str) -> Result<ChildrenSnapshot>;

    /// Creates an entry. Fails with [`crate::BackendError::NodeExists`] on
    /// conflict and [`crate::BackendError::NoNode`] when the parent is
    /// missing. Returns the parent's new child-membership version.
    async fn create_node(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<u64>;

    /// Deletes an entry and its descendants. Fails with
    /// [`crate::BackendError::NoNode`] when the entry is missing. Returns the
    /// parent's new child-membership version.
    async fn delete_node(&self, path: &str) -> Result<u64>;

    /// Overwrites the entry's payload atomically. Returns the entry's new
    /// data version.
    async fn write_data(&self, path: &str, data: &[u8]) -> Result<u64>;

    /// Watch and connection notifications, shared process-wide.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}
