//! Failover queue for abandoned shard items.
//!
//! An entry under `leader/failover/items/{item}` means "item needs an
//! out-of-band re-run". Entries are persistent, so they outlive both the
//! instance that abandoned the item and whoever queued it.
//!
//! A claim is an ephemeral `execution/{item}/failover` marker holding the
//! claimer's id; create-if-absent makes it atomic. The entry itself is
//! deleted only once the re-run succeeds, so a claimer that fails or
//! crashes leaves the entry queued for the next claim.

use std::sync::Arc;

use crate::error::Result;
use crate::execution::ExecutionRecord;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::storage::{path, ConfigService, JobNodeStorage};

pub struct FailoverService {
    storage: JobNodeStorage,
    config: Arc<ConfigService>,
    instances: Arc<InstanceRegistry>,
}

impl FailoverService {
    pub fn new(storage: JobNodeStorage, config: Arc<ConfigService>, instances: Arc<InstanceRegistry>) -> Self {
        Self {
            storage,
            config,
            instances,
        }
    }

    /// Queue `item` unless it is already queued. Returns whether this call queued it.
    pub async fn enqueue(&self, item: u32) -> Result<bool> {
        let queued = self
            .storage
            .create_if_absent(&path::failover_item(item), "")
            .await?;
        if queued {
            tracing::info!(job = self.storage.job_name(), item, "Failover entry queued");
        }
        Ok(queued)
    }

    /// Queued items, ascending.
    pub async fn pending_items(&self) -> Result<Vec<u32>> {
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

    pub async fn is_pending(&self, item: u32) -> Result<bool> {
        self.storage
            .is_node_existed(&path::failover_item(item))
            .await
    }

    /// Claim one queued item among `owned`. Items owned by other instances
    /// are never considered.
    pub async fn poll_and_claim(&self, owned: &[u32]) -> Result<Option<u32>> {
        if owned.is_empty() {
            return Ok(None);
        }
        let local = self.instances.local_id();
        for item in self.pending_items().await? {
            if !owned.contains(&item) {
                continue;
            }
            if self
                .storage
                .create_ephemeral_if_absent(&path::failover_claim(item), local.as_str())
                .await?
            {
                tracing::info!(
                    job = self.storage.job_name(),
                    instance = %local,
                    item,
                    "Claimed failover entry"
                );
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    pub async fn claimed_by(&self, item: u32) -> Result<Option<InstanceId>> {
        Ok(self
            .storage
            .get_data(&path::failover_claim(item))
            .await?
            .and_then(|data| InstanceId::parse(&data)))
    }

    /// Drop this instance's claim on `item`, leaving the entry queued.
    pub async fn release(&self, item: u32) -> Result<()> {
        if self
            .claimed_by(item)
            .await?
            .is_some_and(|id| self.instances.is_local_instance(&id))
        {
            self.storage
                .remove_if_existed(&path::failover_claim(item))
                .await?;
        }
        Ok(())
    }

    /// Finish a claimed re-run. Success removes the entry; failure only
    /// releases the claim.
    pub async fn complete(&self, item: u32, success: bool) -> Result<()> {
        if success {
            self.storage
                .remove_if_existed(&path::failover_item(item))
                .await?;
            tracing::info!(job = self.storage.job_name(), item, "Failover entry completed");
        } else {
            tracing::warn!(job = self.storage.job_name(), item, "Failover re-run failed, entry stays queued");
        }
        self.release(item).await
    }

    /// Queue the in-flight items of an instance that is gone.
    pub async fn enqueue_abandoned(&self, crashed: &InstanceId) -> Result<Vec<u32>> {
        self.enqueue_in_flight(|owner| owner == crashed).await
    }

    /// Queue in-flight items whose recorded owner is not in `live`.
    pub async fn sweep_orphans(&self, live: &[InstanceId]) -> Result<Vec<u32>> {
        self.enqueue_in_flight(|owner| !live.contains(owner)).await
    }

    async fn enqueue_in_flight<F>(&self, abandoned_by: F) -> Result<Vec<u32>>
    where
        F: Fn(&InstanceId) -> bool,
    {
        let config = self.config.current().await;
        if !config.failover {
            return Ok(Vec::new());
        }
        let mut queued = Vec::new();
        for item in 0..config.sharding_total_count {
            let owner = match self
                .storage
                .get_data(&path::sharding_instance(item))
                .await?
                .and_then(|data| InstanceId::parse(&data))
            {
                Some(owner) => owner,
                None => continue,
            };
            if !abandoned_by(&owner) {
                continue;
            }
            if ExecutionRecord::load(&self.storage, item).await?.is_in_flight() {
                self.enqueue(item).await?;
                queued.push(item);
            }
        }
        if !queued.is_empty() {
            tracing::info!(job = self.storage.job_name(), items = ?queued, "Queued abandoned items for failover");
        }
        Ok(queued)
    }
}
