use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::task::TaskTracker;

use crate::error::Result;
use crate::execution::ExecutionService;
use crate::failover::FailoverService;
use crate::instance::InstanceId;
use crate::schedule::job::{JobError, ShardJob, ShardingContext};
use crate::sharding::ShardingService;
use crate::storage::ConfigService;

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub owned: Vec<u32>,
    pub started: Vec<u32>,
    pub failover: Vec<u32>,
    pub misfired: Vec<u32>,
}

/// Turns ticks into shard-item runs on this instance.
///
/// Every run goes through [`ExecutionService::try_begin_running`] first and
/// executes on its own task, bounded by a semaphore sized from
/// `max_concurrency`. A failing or panicking body only fails its own item.
pub struct ShardRunner {
    local: InstanceId,
    job: Arc<dyn ShardJob>,
    config: Arc<ConfigService>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
    failover: Arc<FailoverService>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    tick_lock: Mutex<()>,
}

impl ShardRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: InstanceId,
        job: Arc<dyn ShardJob>,
        config: Arc<ConfigService>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
        failover: Arc<FailoverService>,
        max_concurrency: usize,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            local,
            job,
            config,
            sharding,
            execution,
            failover,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            tracker,
            tick_lock: Mutex::new(()),
        }
    }

    /// One scheduled fire: settle the assignment, then start every owned
    /// item that is not already running. Queued failover entries for owned
    /// items are claimed first and replayed instead of a plain run.
    pub async fn execute_tick(self: &Arc<Self>) -> Result<TickReport> {
        let _tick = match self.tick_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(job = self.job_name(), "Previous tick still settling, skipping");
                return Ok(TickReport::default());
            }
        };

        self.sharding.reshard_if_necessary().await?;
        self.sharding.repair_if_incomplete().await?;

        let mut report = TickReport {
            owned: self.sharding.get_local_sharding_items().await?,
            ..Default::default()
        };
        if report.owned.is_empty() {
            return Ok(report);
        }

        let config = self.config.current().await;
        let mut plain = report.owned.clone();
        if config.failover {
            loop {
                let item = match self.failover.poll_and_claim(&plain).await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(job = self.job_name(), error = %e, "Failed to poll failover queue");
                        break;
                    }
                };
                plain.retain(|i| *i != item);
                match self.dispatch(item, true).await {
                    Ok(true) => report.failover.push(item),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(job = self.job_name(), item, error = %e, "Failed to start failover item");
                        let _ = self.failover.release(item).await;
                    }
                }
            }
        }
        // One item's coordination failure must not skip its siblings.
        for item in plain {
            match self.dispatch(item, false).await {
                Ok(true) => report.started.push(item),
                Ok(false) if config.misfire => match self.execution.set_misfire(item).await {
                    Ok(()) => report.misfired.push(item),
                    Err(e) => {
                        tracing::warn!(job = self.job_name(), item, error = %e, "Failed to record misfire");
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job = self.job_name(), item, error = %e, "Failed to start item");
                }
            }
        }
        Ok(report)
    }

    /// Claim and replay one queued failover entry among owned items.
    pub async fn poll_failover(self: &Arc<Self>) -> Result<Option<u32>> {
        if !self.config.current().await.failover {
            return Ok(None);
        }
        let owned = self.sharding.get_local_sharding_items().await?;
        match self.failover.poll_and_claim(&owned).await? {
            Some(item) if self.dispatch(item, true).await? => Ok(Some(item)),
            _ => Ok(None),
        }
    }

    /// Re-run owned items whose misfire flag is set and that are idle.
    pub async fn run_misfired(self: &Arc<Self>) -> Result<Vec<u32>> {
        let owned = self.sharding.get_local_sharding_items().await?;
        let mut started = Vec::new();
        for item in self.execution.misfired_items(&owned).await? {
            if !self.execution.clear_misfire(item).await? {
                continue;
            }
            if self.dispatch(item, false).await? {
                started.push(item);
            } else {
                self.execution.set_misfire(item).await?;
            }
        }
        if !started.is_empty() {
            tracing::info!(job = self.job_name(), items = ?started, "Re-running misfired items");
        }
        Ok(started)
    }

    /// Start `item` on its own task if the execution service lets it run.
    async fn dispatch(self: &Arc<Self>, item: u32, is_failover: bool) -> Result<bool> {
        if !self.execution.try_begin_running(item).await? {
            if is_failover {
                self.failover.release(item).await?;
            }
            return Ok(false);
        }
        let runner = self.clone();
        self.tracker.spawn(async move {
            runner.run_item(item, is_failover).await;
        });
        Ok(true)
    }

    async fn run_item(self: Arc<Self>, item: u32, mut is_failover: bool) {
        loop {
            let success = self.invoke(item, is_failover).await;

            let completion = match self.execution.complete_running(item, success).await {
                Ok(completion) => completion,
                Err(e) => {
                    tracing::warn!(job = self.job_name(), item, error = %e, "Failed to record completion");
                    if is_failover {
                        let _ = self.failover.release(item).await;
                    }
                    return;
                }
            };
            if is_failover {
                if let Err(e) = self.failover.complete(item, success).await {
                    tracing::warn!(job = self.job_name(), item, error = %e, "Failed to settle failover entry");
                }
            }
            if !completion.rerun {
                return;
            }
            match self.execution.try_begin_running(item).await {
                Ok(true) => {
                    tracing::info!(job = self.job_name(), item, "Running misfired item");
                    is_failover = false;
                }
                Ok(false) => {
                    // Someone else took the item between our completion and now.
                    let _ = self.execution.set_misfire(item).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(job = self.job_name(), item, error = %e, "Failed to restart misfired item");
                    return;
                }
            }
        }
    }

    /// Run the job body once; `true` on success.
    async fn invoke(&self, item: u32, is_failover: bool) -> bool {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let config = self.config.current().await;
        let item_parameter = config
            .item_parameters()
            .ok()
            .and_then(|mut params| params.remove(&item));
        let ctx = ShardingContext {
            job_name: config.job_name.clone(),
            total_count: config.sharding_total_count,
            item,
            item_parameter,
            job_parameter: config.job_parameter.clone(),
            is_failover,
        };

        tracing::debug!(job = %ctx.job_name, instance = %self.local, item, is_failover, "Item started");
        let job = self.job.clone();
        let outcome = match tokio::spawn(async move { job.execute(ctx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::Panicked(e.to_string())),
            Err(e) => Err(JobError::Failed(e.to_string())),
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(job = self.job_name(), item, "Item completed");
                true
            }
            Err(e) => {
                tracing::warn!(job = self.job_name(), instance = %self.local, item, error = %e, "Item failed");
                false
            }
        }
    }

    pub fn job_name(&self) -> &str {
        self.sharding.job_name()
    }

    pub async fn failover_enabled(&self) -> bool {
        self.config.current().await.failover
    }
}
