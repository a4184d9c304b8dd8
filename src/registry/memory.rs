use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::{
    CreateMode, EventKind, RegistryCenter, RegistryError, SessionId, SessionState, TreeEvent,
    TxnOp, Watch,
};

const EVENT_CAPACITY: usize = 4096;
const SESSION_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Node {
    data: String,
    owner: Option<SessionId>,
}

#[derive(Debug, Clone, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Suspended,
    Expired,
    Closed,
}

struct SessionEntry {
    status: SessionStatus,
    events: broadcast::Sender<SessionState>,
}

struct Inner {
    tree: RwLock<Tree>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    events: broadcast::Sender<TreeEvent>,
    next_session: AtomicU64,
}

/// In-process coordination service.
///
/// Holds one tree shared by every session opened with [`MemoryRegistry::connect`].
/// The `suspend`/`expire`/`reconnect` controls reproduce what a networked
/// client sees when its link flaps or its session times out.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(Tree::default()),
                sessions: RwLock::new(HashMap::new()),
                events,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client session.
    pub async fn connect(&self) -> MemorySession {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        self.inner.sessions.write().await.insert(
            id,
            SessionEntry {
                status: SessionStatus::Active,
                events: events.clone(),
            },
        );
        tracing::debug!(session_id = id, "Registry session opened");
        MemorySession {
            id,
            inner: self.inner.clone(),
            state_tx: events,
        }
    }

    /// Simulate a network partition: calls fail with `ConnectionLoss`,
    /// ephemeral nodes are kept.
    pub async fn suspend(&self, id: SessionId) {
        self.transition(id, SessionStatus::Suspended, SessionState::Suspended)
            .await;
    }

    /// Simulate session timeout: ephemeral nodes are deleted and the client
    /// sees `Lost`. Calls fail with `SessionExpired` until `reconnect`.
    pub async fn expire(&self, id: SessionId) {
        if self
            .transition(id, SessionStatus::Expired, SessionState::Lost)
            .await
        {
            self.inner.drop_ephemerals(id).await;
        }
    }

    /// Restore a suspended or expired session.
    pub async fn reconnect(&self, id: SessionId) {
        self.transition(id, SessionStatus::Active, SessionState::Reconnected)
            .await;
    }

    async fn transition(&self, id: SessionId, status: SessionStatus, state: SessionState) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(entry) if entry.status != SessionStatus::Closed => {
                entry.status = status;
                let _ = entry.events.send(state);
                tracing::debug!(session_id = id, state = %state, "Registry session state changed");
                true
            }
            _ => false,
        }
    }

    /// Read a node without going through a session.
    pub async fn peek(&self, path: &str) -> Option<String> {
        self.inner
            .tree
            .read()
            .await
            .nodes
            .get(path)
            .map(|n| n.data.clone())
    }

    /// Whether `path` is an ephemeral node owned by `session`.
    pub async fn is_owned_by(&self, path: &str, session: SessionId) -> bool {
        self.inner
            .tree
            .read()
            .await
            .nodes
            .get(path)
            .is_some_and(|n| n.owner == Some(session))
    }
}

impl Inner {
    async fn check_session(&self, id: SessionId) -> Result<(), RegistryError> {
        match self.sessions.read().await.get(&id).map(|s| s.status) {
            Some(SessionStatus::Active) => Ok(()),
            Some(SessionStatus::Suspended) => Err(RegistryError::ConnectionLoss),
            _ => Err(RegistryError::SessionExpired),
        }
    }

    async fn drop_ephemerals(&self, id: SessionId) {
        let mut events = Vec::new();
        {
            let mut tree = self.tree.write().await;
            let owned: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, n)| n.owner == Some(id))
                .map(|(p, _)| p.clone())
                .collect();
            for path in owned {
                // A parent removed earlier in this loop takes its children with it.
                let _ = tree.delete(&path, &mut events);
            }
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<TreeEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

fn validate_path(path: &str) -> Result<(), RegistryError> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(RegistryError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn child_prefix(path: &str) -> String {
    format!("{}/", path)
}

impl Tree {
    fn ensure_parents(&mut self, path: &str, events: &mut Vec<TreeEvent>) {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(p) = current {
            if self.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = parent_of(p);
        }
        for p in missing.into_iter().rev() {
            self.nodes.insert(
                p.clone(),
                Node {
                    data: String::new(),
                    owner: None,
                },
            );
            events.push(TreeEvent {
                kind: EventKind::Created,
                path: p,
                data: Some(String::new()),
            });
        }
    }

    fn create(
        &mut self,
        path: &str,
        data: &str,
        mode: CreateMode,
        session: SessionId,
        events: &mut Vec<TreeEvent>,
    ) -> Result<String, RegistryError> {
        validate_path(path)?;
        let actual = if mode == CreateMode::EphemeralSequential {
            let counter = self.sequences.entry(path.to_string()).or_insert(0);
            let name = format!("{}{:010}", path, *counter);
            *counter += 1;
            name
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(RegistryError::NodeExists(actual));
        }
        self.ensure_parents(&actual, events);
        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_string(),
                owner: mode.is_ephemeral().then_some(session),
            },
        );
        events.push(TreeEvent {
            kind: EventKind::Created,
            path: actual.clone(),
            data: Some(data.to_string()),
        });
        Ok(actual)
    }

    fn update(&mut self, path: &str, data: &str, events: &mut Vec<TreeEvent>) -> Result<(), RegistryError> {
        validate_path(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        node.data = data.to_string();
        events.push(TreeEvent {
            kind: EventKind::Updated,
            path: path.to_string(),
            data: Some(data.to_string()),
        });
        Ok(())
    }

    fn delete(&mut self, path: &str, events: &mut Vec<TreeEvent>) -> Result<(), RegistryError> {
        validate_path(path)?;
        if !self.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        let descendants: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        // Deepest first, so watchers see children vanish before their parent.
        for p in descendants.into_iter().rev() {
            self.nodes.remove(&p);
            events.push(TreeEvent {
                kind: EventKind::Deleted,
                path: p,
                data: None,
            });
        }
        self.nodes.remove(path);
        events.push(TreeEvent {
            kind: EventKind::Deleted,
            path: path.to_string(),
            data: None,
        });
        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }
}

/// A client session on a [`MemoryRegistry`].
pub struct MemorySession {
    id: SessionId,
    inner: Arc<Inner>,
    state_tx: broadcast::Sender<SessionState>,
}

impl MemorySession {
    /// Handle to the registry this session belongs to.
    pub fn registry(&self) -> MemoryRegistry {
        MemoryRegistry {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl RegistryCenter for MemorySession {
    async fn create(&self, path: &str, data: &str, mode: CreateMode) -> Result<String, RegistryError> {
        self.inner.check_session(self.id).await?;
        let mut events = Vec::new();
        let actual = self
            .inner
            .tree
            .write()
            .await
            .create(path, data, mode, self.id, &mut events)?;
        self.inner.publish(events);
        Ok(actual)
    }

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError> {
        self.inner.check_session(self.id).await?;
        validate_path(path)?;
        Ok(self
            .inner
            .tree
            .read()
            .await
            .nodes
            .get(path)
            .map(|n| n.data.clone()))
    }

    async fn update(&self, path: &str, data: &str) -> Result<(), RegistryError> {
        self.inner.check_session(self.id).await?;
        let mut events = Vec::new();
        self.inner.tree.write().await.update(path, data, &mut events)?;
        self.inner.publish(events);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RegistryError> {
        self.inner.check_session(self.id).await?;
        let mut events = Vec::new();
        self.inner.tree.write().await.delete(path, &mut events)?;
        self.inner.publish(events);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        self.inner.check_session(self.id).await?;
        validate_path(path)?;
        Ok(self.inner.tree.read().await.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        self.inner.check_session(self.id).await?;
        validate_path(path)?;
        Ok(self.inner.tree.read().await.children(path))
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<(), RegistryError> {
        self.inner.check_session(self.id).await?;
        let mut events = Vec::new();
        {
            let mut tree = self.inner.tree.write().await;
            let mut staged = tree.clone();
            for op in ops {
                match op {
                    TxnOp::Create { path, data, mode } => {
                        staged.create(&path, &data, mode, self.id, &mut events)?;
                    }
                    TxnOp::Update { path, data } => staged.update(&path, &data, &mut events)?,
                    TxnOp::Delete { path } => staged.delete(&path, &mut events)?,
                }
            }
            *tree = staged;
        }
        self.inner.publish(events);
        Ok(())
    }

    fn watch(&self, path: &str) -> Watch {
        Watch::new(self.inner.events.subscribe(), path)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn close(&self) {
        {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(&self.id) {
                Some(entry) if entry.status != SessionStatus::Closed => {
                    entry.status = SessionStatus::Closed;
                }
                _ => return,
            }
        }
        self.inner.drop_ephemerals(self.id).await;
        tracing::debug!(session_id = self.id, "Registry session closed");
    }
}
