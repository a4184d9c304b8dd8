use std::collections::HashMap;

use crate::error::{Result, ShardError};
use crate::instance::{InstanceId, Server, ServerStatus};
use crate::storage::{path, JobNodeStorage};

/// Registers this process and its host, and answers which instances may
/// receive shard items.
pub struct InstanceRegistry {
    storage: JobNodeStorage,
    local: InstanceId,
}

impl InstanceRegistry {
    pub fn new(storage: JobNodeStorage, local: InstanceId) -> Self {
        Self { storage, local }
    }

    pub fn local_id(&self) -> &InstanceId {
        &self.local
    }

    pub fn is_local_instance(&self, id: &InstanceId) -> bool {
        *id == self.local
    }

    /// Create this process's ephemeral instance node. Safe to repeat after a
    /// reconnect; an existing node is left alone.
    pub async fn register_instance(&self) -> Result<()> {
        let created = self
            .storage
            .create_ephemeral_if_absent(&path::instance(self.local.as_str()), self.local.ip())
            .await?;
        if created {
            tracing::info!(job = self.storage.job_name(), instance = %self.local, "Instance registered");
        }
        Ok(())
    }

    pub async fn remove_instance(&self) -> Result<()> {
        self.storage
            .remove_if_existed(&path::instance(self.local.as_str()))
            .await?;
        tracing::info!(job = self.storage.job_name(), instance = %self.local, "Instance removed");
        Ok(())
    }

    /// Create this host's server node unless an operator flag already exists.
    pub async fn register_server(&self, enabled: bool) -> Result<()> {
        let ip = self.local.ip();
        let created = self
            .storage
            .create_if_absent(&path::server(ip), ServerStatus::from_enabled(enabled).as_data())
            .await?;
        if created {
            tracing::info!(job = self.storage.job_name(), ip, enabled, "Server registered");
        }
        Ok(())
    }

    /// Operator action: flip the enable flag of a known server.
    pub async fn set_server_enabled(&self, ip: &str, enabled: bool) -> Result<()> {
        let node = path::server(ip);
        if !self.storage.is_node_existed(&node).await? {
            return Err(ShardError::ServerNotFound(ip.to_string()));
        }
        self.storage
            .replace(&node, ServerStatus::from_enabled(enabled).as_data())
            .await?;
        tracing::info!(job = self.storage.job_name(), ip, enabled, "Server status changed");
        Ok(())
    }

    /// `None` when the server was never registered.
    pub async fn server_status(&self, ip: &str) -> Result<Option<ServerStatus>> {
        Ok(self
            .storage
            .get_data(&path::server(ip))
            .await?
            .map(|data| ServerStatus::from_data(&data)))
    }

    pub async fn servers(&self) -> Result<Vec<Server>> {
        let mut servers = Vec::new();
        for ip in self.storage.children(path::SERVERS).await? {
            if let Some(status) = self.server_status(&ip).await? {
                servers.push(Server {
                    job_name: self.storage.job_name().to_string(),
                    ip,
                    enabled: status.is_enabled(),
                });
            }
        }
        Ok(servers)
    }

    /// Every instance with a live node, sorted by id.
    pub async fn live_instances(&self) -> Result<Vec<InstanceId>> {
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

    pub async fn is_instance_alive(&self, id: &InstanceId) -> Result<bool> {
        self.storage
            .is_node_existed(&path::instance(id.as_str()))
            .await
    }

    /// Live instances on enabled servers, sorted by id so strategies see a
    /// stable order.
    pub async fn list_eligible_instances(&self) -> Result<Vec<InstanceId>> {
        let mut statuses: HashMap<String, bool> = HashMap::new();
        let mut eligible = Vec::new();
        for instance in self.live_instances().await? {
            let ip = instance.ip().to_string();
            let enabled = match statuses.get(&ip) {
                Some(enabled) => *enabled,
                None => {
                    let enabled = self
                        .server_status(&ip)
                        .await?
                        .is_some_and(ServerStatus::is_enabled);
                    statuses.insert(ip, enabled);
                    enabled
                }
            };
            if enabled {
                eligible.push(instance);
            }
        }
        Ok(eligible)
    }

    /// Whether this process is live and its server enabled.
    pub async fn is_local_available(&self) -> Result<bool> {
        if !self.is_instance_alive(&self.local).await? {
            return Ok(false);
        }
        Ok(self
            .server_status(self.local.ip())
            .await?
            .is_some_and(ServerStatus::is_enabled))
    }
}
