//! Per-item execution state.
//!
//! With monitoring on, a run of item `i` is bracketed by an ephemeral
//! `execution/{i}/running` marker; create-if-absent on that marker is what
//! keeps two instances from running the same item at once. Begin and
//! completion times are persisted next to it so an item whose owner died
//! mid-run can be recognised after the marker is gone.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::failover::FailoverService;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::sharding::ShardingService;
use crate::storage::{path, ConfigService, JobNodeStorage};

/// Persisted state of one shard item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub item: u32,
    /// Holder of the running marker, if any.
    pub running: Option<InstanceId>,
    pub last_begin_time: Option<DateTime<Utc>>,
    pub last_complete_time: Option<DateTime<Utc>>,
    pub misfire: bool,
    pub failing: bool,
}

impl ExecutionRecord {
    pub async fn load(storage: &JobNodeStorage, item: u32) -> Result<Self> {
        let running = storage
            .get_data(&path::running(item))
            .await?
            .and_then(|data| InstanceId::parse(&data));
        let last_begin_time = read_time(storage, &path::last_begin_time(item)).await?;
        let last_complete_time = read_time(storage, &path::last_complete_time(item)).await?;
        let misfire = storage.is_node_existed(&path::misfire(item)).await?;
        let failing = storage.is_node_existed(&path::failed(item)).await?;
        Ok(Self {
            item,
            running,
            last_begin_time,
            last_complete_time,
            misfire,
            failing,
        })
    }

    /// A run began and no completion was recorded after it.
    pub fn is_in_flight(&self) -> bool {
        match (self.last_begin_time, self.last_complete_time) {
            (Some(begin), Some(complete)) => begin > complete,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

async fn read_time(storage: &JobNodeStorage, node: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(storage
        .get_data(node)
        .await?
        .and_then(|data| data.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
}

fn now_millis() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Outcome of [`ExecutionService::complete_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub item: u32,
    /// This instance still owned the item when the run finished.
    pub still_owner: bool,
    /// A misfire was pending and the item should run again now.
    pub rerun: bool,
    pub failover_enqueued: bool,
}

pub struct ExecutionService {
    storage: JobNodeStorage,
    config: Arc<ConfigService>,
    instances: Arc<InstanceRegistry>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
    /// Items with a body executing in this process right now.
    local_running: Mutex<HashSet<u32>>,
}

impl ExecutionService {
    pub fn new(
        storage: JobNodeStorage,
        config: Arc<ConfigService>,
        instances: Arc<InstanceRegistry>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
    ) -> Self {
        Self {
            storage,
            config,
            instances,
            sharding,
            failover,
            local_running: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the right to run `item`. `false` means it is running elsewhere
    /// (or here) and the caller should flag a misfire instead.
    ///
    /// Without monitoring nothing is persisted and only local overlap is
    /// refused.
    pub async fn try_begin_running(&self, item: u32) -> Result<bool> {
        let mut local = self.local_running.lock().await;
        if local.contains(&item) {
            return Ok(false);
        }
        if self.config.current().await.monitor_execution {
            let owner = self.instances.local_id();
            if !self
                .storage
                .create_ephemeral_if_absent(&path::running(item), owner.as_str())
                .await?
            {
                return Ok(false);
            }
            if let Err(e) = self
                .storage
                .replace(&path::last_begin_time(item), &now_millis())
                .await
            {
                let _ = self.storage.remove_if_existed(&path::running(item)).await;
                return Err(e);
            }
        }
        local.insert(item);
        Ok(true)
    }

    /// Record the end of a run started by [`try_begin_running`](Self::try_begin_running).
    pub async fn complete_running(&self, item: u32, success: bool) -> Result<Completion> {
        self.local_running.lock().await.remove(&item);
        let config = self.config.current().await;
        let mut completion = Completion {
            item,
            still_owner: true,
            rerun: false,
            failover_enqueued: false,
        };
        if config.monitor_execution {
            self.storage
                .replace(&path::last_complete_time(item), &now_millis())
                .await?;
            if success {
                self.storage.remove_if_existed(&path::failed(item)).await?;
            } else {
                self.storage.replace(&path::failed(item), "").await?;
            }
            self.release_running_marker(item).await?;
        }

        completion.still_owner = self
            .sharding
            .get_local_sharding_items()
            .await?
            .contains(&item);
        // The flag goes whether or not the item is still ours; a new owner
        // must not replay a fire it never skipped.
        let misfire_pending = self.storage.remove_if_existed(&path::misfire(item)).await?;
        if !completion.still_owner {
            tracing::info!(
                job = self.storage.job_name(),
                item,
                success,
                misfire_dropped = misfire_pending,
                "Item finished after losing ownership"
            );
            return Ok(completion);
        }

        if !success && config.failover && config.monitor_execution {
            completion.failover_enqueued = self.failover.enqueue(item).await?;
        }
        completion.rerun = misfire_pending && config.misfire;
        Ok(completion)
    }

    /// Remember that a trigger for `item` was skipped because a run was in progress.
    pub async fn set_misfire(&self, item: u32) -> Result<()> {
        if self.storage.create_if_absent(&path::misfire(item), "").await? {
            tracing::info!(job = self.storage.job_name(), item, "Misfire recorded");
        }
        Ok(())
    }

    /// Flagged items among `items` that are not running anywhere.
    pub async fn misfired_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut misfired = Vec::new();
        for &item in items {
            if self.storage.is_node_existed(&path::misfire(item)).await?
                && !self.storage.is_node_existed(&path::running(item)).await?
            {
                misfired.push(item);
            }
        }
        Ok(misfired)
    }

    pub async fn clear_misfire(&self, item: u32) -> Result<bool> {
        self.storage.remove_if_existed(&path::misfire(item)).await
    }

    /// Whether any of `items` is running, here or on another instance.
    pub async fn has_running_items(&self, items: &[u32]) -> Result<bool> {
        {
            let local = self.local_running.lock().await;
            if items.iter().any(|item| local.contains(item)) {
                return Ok(true);
            }
        }
        if !self.config.current().await.monitor_execution {
            return Ok(false);
        }
        for &item in items {
            if self.storage.is_node_existed(&path::running(item)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn locally_running(&self) -> Vec<u32> {
        let mut items: Vec<u32> = self.local_running.lock().await.iter().copied().collect();
        items.sort_unstable();
        items
    }

    pub async fn execution_record(&self, item: u32) -> Result<ExecutionRecord> {
        ExecutionRecord::load(&self.storage, item).await
    }

    /// Re-establish presence after a session comes back and drop running
    /// markers this instance holds for items that no longer execute here,
    /// including items the mapping moved elsewhere while the session was
    /// down. Returns the items whose markers were cleared.
    pub async fn reconcile_after_reconnect(&self) -> Result<Vec<u32>> {
        let config = self.config.current().await;
        self.instances.register_server(!config.disabled).await?;
        self.instances.register_instance().await?;
        if !config.monitor_execution {
            return Ok(Vec::new());
        }

        let local = self.local_running.lock().await.clone();
        let mut cleared = Vec::new();
        for item in 0..config.sharding_total_count {
            if local.contains(&item) {
                continue;
            }
            if self.release_running_marker(item).await? {
                cleared.push(item);
            }
        }
        if !cleared.is_empty() {
            tracing::info!(
                job = self.storage.job_name(),
                items = ?cleared,
                "Cleared stale running markers after reconnect"
            );
        }
        Ok(cleared)
    }

    /// Drop running markers this instance holds for items not executing
    /// here. Used on shutdown.
    pub async fn clear_all_running(&self) -> Result<()> {
        if !self.config.current().await.monitor_execution {
            return Ok(());
        }
        let local = self.local_running.lock().await.clone();
        for item in 0..self.config.current().await.sharding_total_count {
            if !local.contains(&item) {
                self.release_running_marker(item).await?;
            }
        }
        Ok(())
    }

    async fn release_running_marker(&self, item: u32) -> Result<bool> {
        let node = path::running(item);
        let holder = self
            .storage
            .get_data(&node)
            .await?
            .and_then(|data| InstanceId::parse(&data));
        match holder {
            Some(id) if self.instances.is_local_instance(&id) => self.storage.remove_if_existed(&node).await,
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(begin: Option<i64>, complete: Option<i64>) -> ExecutionRecord {
        let at = |ms: i64| Utc.timestamp_millis_opt(ms).single().unwrap();
        ExecutionRecord {
            item: 0,
            running: None,
            last_begin_time: begin.map(at),
            last_complete_time: complete.map(at),
            misfire: false,
            failing: false,
        }
    }

    #[test]
    fn in_flight_when_begin_newer_than_complete() {
        assert!(!record(None, None).is_in_flight());
        assert!(record(Some(10), None).is_in_flight());
        assert!(record(Some(20), Some(10)).is_in_flight());
        assert!(!record(Some(10), Some(20)).is_in_flight());
        assert!(!record(Some(10), Some(10)).is_in_flight());
    }

    #[test]
    fn timestamps_are_epoch_millis() {
        let millis: i64 = now_millis().parse().unwrap();
        let parsed = Utc.timestamp_millis_opt(millis).single().unwrap();
        assert!(Utc::now() - parsed < Duration::seconds(5));
    }
}
