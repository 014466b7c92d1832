//! Preference Synchronization Error Hierarchy
//!
//! Defines error types for the tree mirror and its coordination-service
//! backend, categorized by layer and operational concerns.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local tree contract violations (removed nodes, duplicate roots, bad paths)
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Coordination-service failures (unreachable, conflicts, timeouts)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration loading/validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Property blob encoding failures
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl Error {
    /// True when a later retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend(e) if e.is_retryable())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// Mutation attempted on a node (or a descendant of a node) already
    /// marked removed. Removed nodes are permanently inert.
    #[error("Node {path} has already been removed")]
    AlreadyRemoved { path: String },

    /// Second scope-root construction for an already-active (service, name) pair
    #[error("Scope root {root:?} is already active on service instance {instance_id}")]
    DuplicateScopeRoot { instance_id: String, root: String },

    /// A scope root's lifetime belongs to the owning service
    #[error("A scope root cannot be removed; drop the owning service instead")]
    ScopeRootRemoval,

    /// The node's scope root (or an ancestor) has been dropped
    #[error("Node {path} is detached from its tree")]
    Detached { path: String },

    /// Malformed relative path or path segment
    #[error("Invalid path segment: {0:?}")]
    InvalidPath(String),

    /// Malformed property key
    #[error("Invalid property key: {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Target entry (or a required ancestor) does not exist
    #[error("No such backend node: {0}")]
    NoNode(String),

    /// Entry creation conflicted with an existing entry
    #[error("Backend node already exists: {0}")]
    NodeExists(String),

    /// Session/connection to the ensemble dropped mid-operation
    #[error("Connection to the coordination service lost")]
    ConnectionLost,

    /// Ensemble reachable but refusing service
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Single backend round trip exceeded its budget
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Retry policy exhaustion
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl BackendError {
    /// Transient failures worth retrying under a backoff policy. Conflicts
    /// (`NoNode`, `NodeExists`) are surfaced immediately so the caller can
    /// inspect local dirty state and decide.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::ConnectionLost | BackendError::Unavailable(_) | BackendError::Timeout(_)
        )
    }
}

// Serialization is classified separately from storage and tree concerns
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Property blob encoding failed: {0}")]
    Bincode(#[from] bincode::Error),
}

// ============== Conversion Implementations ============== //
impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(SerializationError::Bincode(e))
    }
}
