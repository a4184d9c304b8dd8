//! Operator actions and read-only views of a job's coordination state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{JobConfig, RegistryConfig};
use crate::error::{Result, ShardError};
use crate::execution::ExecutionRecord;
use crate::instance::{InstanceId, Server, ServerStatus};
use crate::registry::RegistryCenter;
use crate::storage::{path, JobNodePath, JobNodeStorage, RetryPolicy};

/// Admin facade over one job. Needs no local instance: any session on the
/// registry can drive it.
#[derive(Clone)]
pub struct JobOperator {
    storage: JobNodeStorage,
}

impl JobOperator {
    pub fn new(registry: Arc<dyn RegistryCenter>, registry_config: &RegistryConfig, job_name: &str) -> Self {
        Self::from_storage(JobNodeStorage::new(
            registry,
            JobNodePath::new(&registry_config.namespace, job_name),
            RetryPolicy::from_config(registry_config),
        ))
    }

    pub fn from_storage(storage: JobNodeStorage) -> Self {
        Self { storage }
    }

    pub fn job_name(&self) -> &str {
        self.storage.job_name()
    }

    pub async fn job_config(&self) -> Result<JobConfig> {
        let data = self
            .storage
            .get_data(path::CONFIG)
            .await?
            .ok_or_else(|| ShardError::JobNotFound(self.job_name().to_string()))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Replace the stored job definition. Running instances pick it up
    /// through their config watch.
    pub async fn update_config(&self, config: &JobConfig) -> Result<()> {
        config.validate()?;
        if config.job_name != self.job_name() {
            return Err(ShardError::Config(format!(
                "config is for job '{}', not '{}'",
                config.job_name,
                self.job_name()
            )));
        }
        self.storage
            .replace(path::CONFIG, &serde_json::to_string(config)?)
            .await
    }

    pub async fn set_server_enabled(&self, ip: &str, enabled: bool) -> Result<()> {
        let node = path::server(ip);
        if !self.storage.is_node_existed(&node).await? {
            return Err(ShardError::ServerNotFound(ip.to_string()));
        }
        self.storage
            .replace(&node, ServerStatus::from_enabled(enabled).as_data())
            .await?;
        tracing::info!(job = self.job_name(), ip, enabled, "Server status set by operator");
        Ok(())
    }

    /// Ask a live instance to fire once now. Returns `false` when the
    /// instance is not live or a request is already pending.
    pub async fn trigger_now(&self, instance: &InstanceId) -> Result<bool> {
        if !self
            .storage
            .is_node_existed(&path::instance(instance.as_str()))
            .await?
        {
            return Ok(false);
        }
        self.storage
            .create_ephemeral_if_absent(&path::trigger(instance.as_str()), "")
            .await
    }

    pub async fn mark_needs_sharding(&self) -> Result<()> {
        self.storage.create_if_absent(path::NEED_RESHARD, "").await?;
        Ok(())
    }

    pub async fn needs_sharding(&self) -> Result<bool> {
        self.storage.is_node_existed(path::NEED_RESHARD).await
    }

    /// Item → owner as currently stored. Items without an owner are absent.
    pub async fn assignment(&self) -> Result<BTreeMap<u32, InstanceId>> {
        let mut assignment = BTreeMap::new();
        for name in self.storage.children(path::SHARDING).await? {
            let Some(item) = path::parse_item(&name) else {
                continue;
            };
            if let Some(owner) = self
                .storage
                .get_data(&path::sharding_instance(item))
                .await?
                .and_then(|data| InstanceId::parse(&data))
            {
                assignment.insert(item, owner);
            }
        }
        Ok(assignment)
    }

    pub async fn servers(&self) -> Result<Vec<Server>> {
        let mut servers = Vec::new();
        for ip in self.storage.children(path::SERVERS).await? {
            if let Some(data) = self.storage.get_data(&path::server(&ip)).await? {
                servers.push(Server {
                    job_name: self.job_name().to_string(),
                    enabled: ServerStatus::from_data(&data).is_enabled(),
                    ip,
                });
            }
        }
        Ok(servers)
    }

    pub async fn instances(&self) -> Result<Vec<InstanceId>> {
        let mut instances: Vec<InstanceId> = self
            .storage
            .children(path::INSTANCES)
            .await?
            .iter()
            .filter_map(|name| InstanceId::parse(name))
            .collect();
        instances.sort();
        Ok(instances)
    }

    pub async fn leader(&self) -> Result<Option<InstanceId>> {
        Ok(self
            .storage
            .get_data(path::LEADER_ELECTION)
            .await?
            .and_then(|data| InstanceId::parse(&data)))
    }

    pub async fn execution_record(&self, item: u32) -> Result<ExecutionRecord> {
        ExecutionRecord::load(&self.storage, item).await
    }

    pub async fn pending_failover(&self) -> Result<Vec<u32>> {
        let mut items: Vec<u32> = self
            .storage
            .children(path::FAILOVER_ITEMS)
            .await?
            .iter()
            .filter_map(|name| path::parse_item(name))
            .collect();
        items.sort_unstable();
        Ok(items)
    }
}
