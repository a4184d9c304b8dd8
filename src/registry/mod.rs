//! Coordination registry client abstraction.
//!
//! Everything the coordination engine knows about other processes flows
//! through a [`RegistryCenter`]: a hierarchical namespace of string-valued
//! nodes with persistent, ephemeral and ephemeral-sequential node kinds,
//! subtree watches and session-state notifications.
//!
//! # Components
//!
//! - [`RegistryCenter`]: the client trait consumed by every service
//! - [`Watch`]: stream of [`TreeEvent`]s below a path
//! - [`MemoryRegistry`]: in-process backend with real session semantics,
//!   used for single-host runs and by the test suite
//!
//! # Sessions
//!
//! Ephemeral nodes belong to the session that created them and disappear
//! when that session expires. Clients observe their own session through
//! [`RegistryCenter::session_events`].

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::{MemoryRegistry, MemorySession};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Session state as reported by the coordination client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Suspended,
    Reconnected,
    Lost,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Suspended => write!(f, "suspended"),
            SessionState::Reconnected => write!(f, "reconnected"),
            SessionState::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A change to a single node in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEvent {
    pub kind: EventKind,
    pub path: String,
    pub data: Option<String>,
}

/// One operation inside a multi-node [`RegistryCenter::transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Create {
        path: String,
        data: String,
        mode: CreateMode,
    },
    Update {
        path: String,
        data: String,
    },
    Delete {
        path: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Connection to registry lost")]
    ConnectionLoss,

    #[error("Registry session expired")]
    SessionExpired,

    #[error("Invalid node path: {0}")]
    InvalidPath(String),

    #[error("Registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    /// Errors worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::ConnectionLoss)
    }
}

/// Client of a hierarchical, watchable coordination service.
///
/// Paths are absolute (`/a/b/c`). `create` makes missing parents as
/// persistent nodes, `delete` removes the whole subtree.
#[async_trait]
pub trait RegistryCenter: Send + Sync {
    /// Create a node. Returns the actual path, which differs from `path`
    /// only for [`CreateMode::EphemeralSequential`].
    async fn create(&self, path: &str, data: &str, mode: CreateMode) -> Result<String, RegistryError>;

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError>;

    /// Replace the data of an existing node.
    async fn update(&self, path: &str, data: &str) -> Result<(), RegistryError>;

    /// Delete a node and all of its descendants.
    async fn delete(&self, path: &str) -> Result<(), RegistryError>;

    async fn exists(&self, path: &str) -> Result<bool, RegistryError>;

    /// Names of the direct children of `path`, sorted. Empty if `path` is absent.
    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError>;

    /// Apply `ops` in order. Backends with multi-node transactions override
    /// this to make the batch all-or-nothing; this default stops at the
    /// first failure and leaves earlier operations applied.
    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<(), RegistryError> {
        for op in ops {
            match op {
                TxnOp::Create { path, data, mode } => {
                    self.create(&path, &data, mode).await?;
                }
                TxnOp::Update { path, data } => self.update(&path, &data).await?,
                TxnOp::Delete { path } => self.delete(&path).await?,
            }
        }
        Ok(())
    }

    /// Subscribe to changes of `path` and everything below it.
    fn watch(&self, path: &str) -> Watch;

    fn session_events(&self) -> broadcast::Receiver<SessionState>;

    fn session_id(&self) -> SessionId;

    /// Close the session, releasing its ephemeral nodes.
    async fn close(&self);
}

/// Stream of tree events filtered to one subtree.
pub struct Watch {
    rx: broadcast::Receiver<TreeEvent>,
    prefix: String,
}

impl Watch {
    pub fn new(rx: broadcast::Receiver<TreeEvent>, path: &str) -> Self {
        Self {
            rx,
            prefix: path.trim_end_matches('/').to_string(),
        }
    }

    fn matches(&self, path: &str) -> bool {
        path == self.prefix
            || (path.starts_with(&self.prefix) && path[self.prefix.len()..].starts_with('/'))
    }

    /// Next event below the watched path, or `None` once the registry is gone.
    pub async fn next(&mut self) -> Option<TreeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event.path) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(path = %self.prefix, missed, "Watch lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_filters_by_subtree() {
        let (tx, rx) = broadcast::channel(16);
        let mut watch = Watch::new(rx, "/job/instances");

        for path in ["/job/instancesX", "/job/servers/a", "/job/instances/a"] {
            tx.send(TreeEvent {
                kind: EventKind::Created,
                path: path.to_string(),
                data: None,
            })
            .unwrap();
        }

        let event = watch.next().await.unwrap();
        assert_eq!(event.path, "/job/instances/a");
    }

    #[tokio::test]
    async fn watch_ends_when_sender_dropped() {
        let (tx, rx) = broadcast::channel::<TreeEvent>(4);
        let mut watch = Watch::new(rx, "/job");
        drop(tx);
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn only_connection_loss_is_transient() {
        assert!(RegistryError::ConnectionLoss.is_transient());
        assert!(!RegistryError::SessionExpired.is_transient());
        assert!(!RegistryError::NodeExists("/a".into()).is_transient());
    }
}
