use tokio::sync::RwLock;

use crate::config::JobConfig;
use crate::error::{Result, ShardError};
use crate::storage::{path, JobNodeStorage};

/// What changed between two versions of a job definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChange {
    pub total_count_changed: bool,
    pub schedule_changed: bool,
}

/// Owns the job definition stored in the `config` node and a local cache of
/// the last version read.
pub struct ConfigService {
    storage: JobNodeStorage,
    cached: RwLock<JobConfig>,
}

impl ConfigService {
    pub fn new(storage: JobNodeStorage, local: JobConfig) -> Self {
        Self {
            storage,
            cached: RwLock::new(local),
        }
    }

    /// Write `local` unless the registry already holds a definition and
    /// `overwrite` is off. Returns the definition now in effect.
    pub async fn persist(&self, local: &JobConfig) -> Result<JobConfig> {
        local.validate()?;
        let json = serde_json::to_string(local)?;
        if local.overwrite {
            self.storage.replace(path::CONFIG, &json).await?;
        } else if !self.storage.create_if_absent(path::CONFIG, &json).await? {
            tracing::debug!(job = %local.job_name, "Registry already holds job config, keeping it");
        }
        self.load().await
    }

    /// Re-read the definition from the registry and refresh the cache.
    pub async fn load(&self) -> Result<JobConfig> {
        let data = self
            .storage
            .get_data(path::CONFIG)
            .await?
            .ok_or_else(|| ShardError::JobNotFound(self.storage.job_name().to_string()))?;
        let config = parse(&data)?;
        *self.cached.write().await = config.clone();
        Ok(config)
    }

    /// Last definition read, without touching the registry.
    pub async fn current(&self) -> JobConfig {
        self.cached.read().await.clone()
    }

    /// Apply a definition received through a watch event.
    pub async fn apply_remote(&self, data: &str) -> Result<ConfigChange> {
        let incoming = parse(data)?;
        let mut cached = self.cached.write().await;
        let change = ConfigChange {
            total_count_changed: cached.sharding_total_count != incoming.sharding_total_count,
            schedule_changed: cached.schedule != incoming.schedule,
        };
        *cached = incoming;
        Ok(change)
    }
}

fn parse(data: &str) -> Result<JobConfig> {
    let config: JobConfig = serde_json::from_str(data)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{RegistryConfig, Schedule};
    use crate::registry::MemoryRegistry;
    use crate::storage::{JobNodePath, RetryPolicy};

    async fn service(registry: &MemoryRegistry, local: &JobConfig) -> ConfigService {
        let storage = JobNodeStorage::new(
            Arc::new(registry.connect().await),
            JobNodePath::new("ns", &local.job_name),
            RetryPolicy::from_config(&RegistryConfig::default()),
        );
        ConfigService::new(storage, local.clone())
    }

    fn config(total: u32) -> JobConfig {
        JobConfig::new("orders", Schedule::Interval { interval_ms: 1000 }, total)
    }

    #[tokio::test]
    async fn first_writer_wins_without_overwrite() {
        let registry = MemoryRegistry::new();
        let first = service(&registry, &config(4)).await;
        assert_eq!(first.persist(&config(4)).await.unwrap().sharding_total_count, 4);

        let second = service(&registry, &config(8)).await;
        let effective = second.persist(&config(8)).await.unwrap();
        assert_eq!(effective.sharding_total_count, 4);
        assert_eq!(second.current().await.sharding_total_count, 4);
    }

    #[tokio::test]
    async fn overwrite_replaces_registry_copy() {
        let registry = MemoryRegistry::new();
        service(&registry, &config(4))
            .await
            .persist(&config(4))
            .await
            .unwrap();

        let mut replacement = config(6);
        replacement.overwrite = true;
        let svc = service(&registry, &replacement).await;
        assert_eq!(svc.persist(&replacement).await.unwrap().sharding_total_count, 6);
    }

    #[tokio::test]
    async fn invalid_local_config_is_not_written() {
        let registry = MemoryRegistry::new();
        let svc = service(&registry, &config(0)).await;
        assert!(svc.persist(&config(0)).await.is_err());
        assert!(registry.peek("/ns/orders/config").await.is_none());
    }

    #[tokio::test]
    async fn apply_remote_reports_changes() {
        let registry = MemoryRegistry::new();
        let svc = service(&registry, &config(4)).await;
        let mut next = config(5);
        next.schedule = Schedule::Interval { interval_ms: 50 };

        let change = svc
            .apply_remote(&serde_json::to_string(&next).unwrap())
            .await
            .unwrap();
        assert!(change.total_count_changed);
        assert!(change.schedule_changed);
        assert_eq!(svc.current().await, next);
    }
}
