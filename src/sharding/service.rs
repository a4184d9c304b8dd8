use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::JobConfig;
use crate::election::LeaderService;
use crate::error::Result;
use crate::failover::FailoverService;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::registry::{CreateMode, TxnOp};
use crate::sharding::strategy::{ShardingInput, ShardingPlan, ShardingStrategy, StrategyRegistry};
use crate::storage::{path, ConfigService, JobNodeStorage};

/// Owns the `needReshard` flag and the persisted item → owner mapping.
pub struct ShardingService {
    storage: JobNodeStorage,
    config: Arc<ConfigService>,
    instances: Arc<InstanceRegistry>,
    leader: Arc<LeaderService>,
    failover: Arc<FailoverService>,
    strategies: Arc<StrategyRegistry>,
    /// Serialises passes started from the tick and from the listener.
    pass_lock: Mutex<()>,
}

impl ShardingService {
    pub fn new(
        storage: JobNodeStorage,
        config: Arc<ConfigService>,
        instances: Arc<InstanceRegistry>,
        leader: Arc<LeaderService>,
        failover: Arc<FailoverService>,
        strategies: Arc<StrategyRegistry>,
    ) -> Self {
        Self {
            storage,
            config,
            instances,
            leader,
            failover,
            strategies,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn job_name(&self) -> &str {
        self.storage.job_name()
    }

    /// Idempotent: a flag that is already set stays set.
    pub async fn mark_needs_sharding(&self) -> Result<()> {
        if self.storage.create_if_absent(path::NEED_RESHARD, "").await? {
            tracing::debug!(job = self.storage.job_name(), "Resharding requested");
        }
        Ok(())
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.storage.is_node_existed(path::NEED_RESHARD).await
    }

    /// Whether a leader is in the middle of a pass.
    pub async fn is_resharding(&self) -> Result<bool> {
        self.storage.is_node_existed(path::RESHARD_PROCESSING).await
    }

    pub async fn sharding_total_count(&self) -> u32 {
        self.config.current().await.sharding_total_count
    }

    /// Recompute and persist the assignment when the flag is set and this
    /// instance leads. Returns whether a pass ran.
    ///
    /// Clearing the old mapping, writing the new one and clearing the flag
    /// happen in one registry transaction, so readers see either the old
    /// assignment or the new one.
    pub async fn reshard_if_necessary(&self) -> Result<bool> {
        let _pass = self.pass_lock.lock().await;
        if !self.is_need_sharding().await? {
            return Ok(false);
        }
        if !self.leader.is_leader_until_block().await? {
            return Ok(false);
        }

        let config = self.config.load().await?;
        let strategy = self.strategies.resolve(&config.sharding_strategy)?;
        let eligible = self.instances.list_eligible_instances().await?;
        let local = self.instances.local_id();

        self.storage
            .fill_ephemeral(path::RESHARD_PROCESSING, local.as_str())
            .await?;
        tracing::info!(
            job = self.storage.job_name(),
            leader = %local,
            instances = eligible.len(),
            total = config.sharding_total_count,
            strategy = strategy.name(),
            "Resharding started"
        );

        let plan = match self.rewrite_assignment(&config, &eligible, strategy.as_ref()).await {
            Ok(plan) => plan,
            Err(e) => {
                // The flag is still set, so the next pass starts over.
                let _ = self.storage.remove_if_existed(path::RESHARD_PROCESSING).await;
                return Err(e);
            }
        };

        let summary: BTreeMap<String, usize> = plan
            .iter()
            .map(|(instance, items)| (instance.to_string(), items.len()))
            .collect();
        tracing::info!(job = self.storage.job_name(), assignment = ?summary, "Resharding completed");

        // Topology or item count moved while the pass ran: the flag set by
        // that change was consumed by this transaction, so raise it again.
        let reloaded = self.config.load().await?;
        if reloaded.sharding_total_count != config.sharding_total_count
            || self.instances.list_eligible_instances().await? != eligible
        {
            self.mark_needs_sharding().await?;
        }
        Ok(true)
    }

    async fn rewrite_assignment(
        &self,
        config: &JobConfig,
        eligible: &[InstanceId],
        strategy: &dyn ShardingStrategy,
    ) -> Result<ShardingPlan> {
        if config.failover {
            // Owners on disabled servers are alive and finish their own runs.
            let live = self.instances.live_instances().await?;
            self.failover.sweep_orphans(&live).await?;
        }

        let item_parameters = config.item_parameters()?;
        let plan = strategy.shard(&ShardingInput {
            job_name: self.storage.job_name(),
            instances: eligible,
            total_count: config.sharding_total_count,
            item_parameters: &item_parameters,
        });

        let mut ops = Vec::new();
        for name in self.storage.children(path::SHARDING).await? {
            if path::parse_item(&name).is_some() {
                ops.push(TxnOp::Delete {
                    path: format!("{}/{}", path::SHARDING, name),
                });
            }
        }
        for (instance, items) in &plan {
            for item in items {
                ops.push(TxnOp::Create {
                    path: path::sharding_instance(*item),
                    data: instance.to_string(),
                    mode: CreateMode::Persistent,
                });
            }
        }
        if self.is_need_sharding().await? {
            ops.push(TxnOp::Delete {
                path: path::NEED_RESHARD.to_string(),
            });
        }
        ops.push(TxnOp::Delete {
            path: path::RESHARD_PROCESSING.to_string(),
        });
        self.storage.execute_in_transaction(ops).await?;
        Ok(plan)
    }

    /// Current owner of `item`; `None` while no owner is recorded.
    pub async fn sharding_owner(&self, item: u32) -> Result<Option<InstanceId>> {
        Ok(self
            .storage
            .get_data(&path::sharding_instance(item))
            .await?
            .and_then(|data| InstanceId::parse(&data)))
    }

    /// Items recorded for `instance`, ascending.
    pub async fn get_sharding_items(&self, instance: &InstanceId) -> Result<Vec<u32>> {
        let total = self.sharding_total_count().await;
        let mut items = Vec::new();
        for item in 0..total {
            if self.sharding_owner(item).await?.as_ref() == Some(instance) {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Items this instance owns right now. Empty when this instance is not
    /// available, whatever the mapping says.
    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        if !self.instances.is_local_available().await? {
            return Ok(Vec::new());
        }
        self.get_sharding_items(self.instances.local_id()).await
    }

    /// Snapshot of the full mapping. Items without an owner are absent.
    pub async fn assignment(&self) -> Result<BTreeMap<u32, InstanceId>> {
        let total = self.sharding_total_count().await;
        let mut assignment = BTreeMap::new();
        for item in 0..total {
            if let Some(owner) = self.sharding_owner(item).await? {
                assignment.insert(item, owner);
            }
        }
        Ok(assignment)
    }

    pub async fn is_assignment_complete(&self) -> Result<bool> {
        let total = self.sharding_total_count().await;
        for item in 0..total {
            if !self
                .storage
                .is_node_existed(&path::sharding_instance(item))
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Raise the flag when the mapping is incomplete and nobody is fixing
    /// it. Returns whether the flag was raised.
    pub async fn repair_if_incomplete(&self) -> Result<bool> {
        if self.is_need_sharding().await? || self.is_resharding().await? {
            return Ok(false);
        }
        if self.is_assignment_complete().await? {
            return Ok(false);
        }
        tracing::warn!(job = self.storage.job_name(), "Assignment incomplete, requesting resharding");
        self.mark_needs_sharding().await?;
        Ok(true)
    }

    /// Leader-side consistency check: raise the flag when the mapping is
    /// incomplete or names an owner that is no longer eligible.
    pub async fn reconcile_assignment(&self) -> Result<bool> {
        if !self.leader.is_leader().await? {
            return Ok(false);
        }
        if self.repair_if_incomplete().await? {
            return Ok(true);
        }
        if self.is_need_sharding().await? || self.is_resharding().await? {
            return Ok(false);
        }
        let eligible = self.instances.list_eligible_instances().await?;
        for owner in self.assignment().await?.values() {
            if !eligible.contains(owner) {
                tracing::info!(
                    job = self.storage.job_name(),
                    owner = %owner,
                    "Assigned owner no longer eligible, requesting resharding"
                );
                self.mark_needs_sharding().await?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}
