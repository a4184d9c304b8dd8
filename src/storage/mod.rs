//! Job-scoped access to the coordination registry.
//!
//! [`JobNodeStorage`] resolves node names relative to a job root, turns the
//! expected races of create-if-absent / delete-if-existed into booleans and
//! retries transient connection failures. [`ConfigService`] keeps the job
//! definition in the `config` node.

pub mod config;
pub mod path;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::registry::{
    CreateMode, RegistryCenter, RegistryError, SessionState, TxnOp, Watch,
};

pub use config::ConfigService;
pub use path::JobNodePath;

/// Bounded retry for transient registry failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay * attempt;
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

#[derive(Clone)]
pub struct JobNodeStorage {
    registry: Arc<dyn RegistryCenter>,
    path: JobNodePath,
    retry: RetryPolicy,
}

impl JobNodeStorage {
    pub fn new(registry: Arc<dyn RegistryCenter>, path: JobNodePath, retry: RetryPolicy) -> Self {
        Self {
            registry,
            path,
            retry,
        }
    }

    pub fn job_name(&self) -> &str {
        self.path.job_name()
    }

    pub fn node_path(&self) -> &JobNodePath {
        &self.path
    }

    pub fn registry(&self) -> &Arc<dyn RegistryCenter> {
        &self.registry
    }

    async fn retrying<T, F, Fut>(&self, op: &str, mut call: F) -> std::result::Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RegistryError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    tracing::debug!(
                        job = self.job_name(),
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient registry error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn is_node_existed(&self, node: &str) -> Result<bool> {
        let full = self.path.full_path(node);
        Ok(self.retrying("exists", || self.registry.exists(&full)).await?)
    }

    pub async fn get_data(&self, node: &str) -> Result<Option<String>> {
        let full = self.path.full_path(node);
        Ok(self.retrying("get", || self.registry.get(&full)).await?)
    }

    pub async fn children(&self, node: &str) -> Result<Vec<String>> {
        let full = self.path.full_path(node);
        Ok(self.retrying("children", || self.registry.children(&full)).await?)
    }

    async fn create_if_absent_with(&self, node: &str, data: &str, mode: CreateMode) -> Result<bool> {
        let full = self.path.full_path(node);
        match self
            .retrying("create", || self.registry.create(&full, data, mode))
            .await
        {
            Ok(_) => Ok(true),
            Err(RegistryError::NodeExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a persistent node unless it exists. Returns whether this call created it.
    pub async fn create_if_absent(&self, node: &str, data: &str) -> Result<bool> {
        self.create_if_absent_with(node, data, CreateMode::Persistent)
            .await
    }

    /// Create an ephemeral node unless it exists. Returns whether this call created it.
    pub async fn create_ephemeral_if_absent(&self, node: &str, data: &str) -> Result<bool> {
        self.create_if_absent_with(node, data, CreateMode::Ephemeral)
            .await
    }

    /// Create or overwrite an ephemeral node owned by this session.
    pub async fn fill_ephemeral(&self, node: &str, data: &str) -> Result<()> {
        self.remove_if_existed(node).await?;
        self.create_if_absent_with(node, data, CreateMode::Ephemeral)
            .await?;
        Ok(())
    }

    /// Create or overwrite a persistent node.
    pub async fn replace(&self, node: &str, data: &str) -> Result<()> {
        let full = self.path.full_path(node);
        match self
            .retrying("update", || self.registry.update(&full, data))
            .await
        {
            Ok(()) => Ok(()),
            Err(RegistryError::NoNode(_)) => {
                match self
                    .retrying("create", || {
                        self.registry.create(&full, data, CreateMode::Persistent)
                    })
                    .await
                {
                    Ok(_) => Ok(()),
                    // Lost a race with another writer: last write wins.
                    Err(RegistryError::NodeExists(_)) => {
                        Ok(self.retrying("update", || self.registry.update(&full, data)).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a node and its subtree. Returns whether it existed.
    pub async fn remove_if_existed(&self, node: &str) -> Result<bool> {
        let full = self.path.full_path(node);
        match self.retrying("delete", || self.registry.delete(&full)).await {
            Ok(()) => Ok(true),
            Err(RegistryError::NoNode(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Run job-relative operations as one registry transaction.
    pub async fn execute_in_transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        let ops: Vec<TxnOp> = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Create { path, data, mode } => TxnOp::Create {
                    path: self.path.full_path(&path),
                    data,
                    mode,
                },
                TxnOp::Update { path, data } => TxnOp::Update {
                    path: self.path.full_path(&path),
                    data,
                },
                TxnOp::Delete { path } => TxnOp::Delete {
                    path: self.path.full_path(&path),
                },
            })
            .collect();
        self.registry.transaction(ops).await?;
        Ok(())
    }

    /// Watch the whole job subtree.
    pub fn watch(&self) -> Watch {
        self.registry.watch(self.path.root())
    }

    pub fn session_events(&self) -> tokio::sync::broadcast::Receiver<SessionState> {
        self.registry.session_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    async fn storage(registry: &MemoryRegistry) -> JobNodeStorage {
        let session = registry.connect().await;
        JobNodeStorage::new(
            Arc::new(session),
            JobNodePath::new("ns", "orders"),
            RetryPolicy::from_config(&RegistryConfig::default()),
        )
    }

    #[tokio::test]
    async fn create_if_absent_reports_winner() {
        let registry = MemoryRegistry::new();
        let a = storage(&registry).await;
        let b = storage(&registry).await;

        assert!(a.create_ephemeral_if_absent("leader/election/instance", "a").await.unwrap());
        assert!(!b.create_ephemeral_if_absent("leader/election/instance", "b").await.unwrap());
        assert_eq!(
            b.get_data("leader/election/instance").await.unwrap().as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn replace_creates_then_overwrites() {
        let registry = MemoryRegistry::new();
        let s = storage(&registry).await;
        s.replace("servers/10.0.0.1", "").await.unwrap();
        s.replace("servers/10.0.0.1", "DISABLED").await.unwrap();
        assert_eq!(
            registry.peek("/ns/orders/servers/10.0.0.1").await.as_deref(),
            Some("DISABLED")
        );
    }

    #[tokio::test]
    async fn remove_if_existed_is_idempotent() {
        let registry = MemoryRegistry::new();
        let s = storage(&registry).await;
        s.create_if_absent("leader/failover/items/3", "").await.unwrap();
        assert!(s.remove_if_existed("leader/failover/items/3").await.unwrap());
        assert!(!s.remove_if_existed("leader/failover/items/3").await.unwrap());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_reconnect() {
        let registry = MemoryRegistry::new();
        let s = storage(&registry).await;
        let id = s.registry().session_id();
        registry.suspend(id).await;

        let flapping = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flapping.reconnect(id).await;
        });

        assert!(!s.is_node_existed("config").await.unwrap());
    }
}
