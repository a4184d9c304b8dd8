//! Per-job wiring.
//!
//! A [`JobCoordinator`] owns every service of one job on one instance and
//! the tasks that drive them: the schedule controller, the tree listener,
//! the connection listener and the leader's reconcile loop. Processes
//! running several jobs keep their coordinators in a [`CoordinatorRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admin::JobOperator;
use crate::config::{JobConfig, RegistryConfig};
use crate::election::LeaderService;
use crate::error::{Result, ShardError};
use crate::execution::ExecutionService;
use crate::failover::FailoverService;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::listener::{ConnectionListener, ListenerManager};
use crate::registry::RegistryCenter;
use crate::schedule::{CompiledSchedule, JobScheduleController, ScheduleHandle, ShardJob, ShardRunner};
use crate::sharding::{ShardingService, StrategyRegistry};
use crate::storage::{ConfigService, JobNodePath, JobNodeStorage, RetryPolicy};

/// The services of one job on one instance, before any task is started.
#[derive(Clone)]
pub struct JobServices {
    pub storage: JobNodeStorage,
    pub config: Arc<ConfigService>,
    pub instances: Arc<InstanceRegistry>,
    pub leader: Arc<LeaderService>,
    pub failover: Arc<FailoverService>,
    pub sharding: Arc<ShardingService>,
    pub execution: Arc<ExecutionService>,
}

impl JobServices {
    pub fn build(
        registry: Arc<dyn RegistryCenter>,
        registry_config: &RegistryConfig,
        job: JobConfig,
        local: InstanceId,
        strategies: Arc<StrategyRegistry>,
    ) -> Self {
        let storage = JobNodeStorage::new(
            registry,
            JobNodePath::new(&registry_config.namespace, &job.job_name),
            RetryPolicy::from_config(registry_config),
        );
        let config = Arc::new(ConfigService::new(storage.clone(), job));
        let instances = Arc::new(InstanceRegistry::new(storage.clone(), local));
        let leader = Arc::new(LeaderService::new(
            storage.clone(),
            instances.clone(),
            Duration::from_millis(registry_config.election_wait_ms),
        ));
        let failover = Arc::new(FailoverService::new(
            storage.clone(),
            config.clone(),
            instances.clone(),
        ));
        let sharding = Arc::new(ShardingService::new(
            storage.clone(),
            config.clone(),
            instances.clone(),
            leader.clone(),
            failover.clone(),
            strategies,
        ));
        let execution = Arc::new(ExecutionService::new(
            storage.clone(),
            config.clone(),
            instances.clone(),
            sharding.clone(),
            failover.clone(),
        ));
        Self {
            storage,
            config,
            instances,
            leader,
            failover,
            sharding,
            execution,
        }
    }
}

/// One job running on this instance.
pub struct JobCoordinator {
    services: JobServices,
    runner: Arc<ShardRunner>,
    handle: ScheduleHandle,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobCoordinator {
    pub async fn start(
        registry: Arc<dyn RegistryCenter>,
        registry_config: &RegistryConfig,
        job: JobConfig,
        body: Arc<dyn ShardJob>,
        local: InstanceId,
    ) -> Result<Self> {
        Self::start_with_strategies(
            registry,
            registry_config,
            job,
            body,
            local,
            Arc::new(StrategyRegistry::default()),
        )
        .await
    }

    /// Validate the job, publish it, register this instance and start the
    /// job's tasks. Configuration errors fail before anything is written.
    pub async fn start_with_strategies(
        registry: Arc<dyn RegistryCenter>,
        registry_config: &RegistryConfig,
        job: JobConfig,
        body: Arc<dyn ShardJob>,
        local: InstanceId,
        strategies: Arc<StrategyRegistry>,
    ) -> Result<Self> {
        job.validate()?;
        strategies.resolve(&job.sharding_strategy)?;
        CompiledSchedule::compile(&job.schedule)?;

        let server_enabled = !job.disabled;
        let services = JobServices::build(registry, registry_config, job.clone(), local.clone(), strategies.clone());

        let effective = services.config.persist(&job).await?;
        strategies.resolve(&effective.sharding_strategy)?;
        let schedule = CompiledSchedule::compile(&effective.schedule)?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let runner = Arc::new(ShardRunner::new(
            local.clone(),
            body,
            services.config.clone(),
            services.sharding.clone(),
            services.execution.clone(),
            services.failover.clone(),
            effective.max_concurrency,
            tracker.clone(),
        ));
        let (controller, handle) = JobScheduleController::new(
            runner.clone(),
            schedule,
            Duration::from_millis(effective.failover_poll_interval_ms.max(1)),
            cancel.clone(),
            tracker.clone(),
        );
        let listener = ListenerManager::new(
            services.storage.clone(),
            services.config.clone(),
            services.instances.clone(),
            services.leader.clone(),
            services.sharding.clone(),
            services.failover.clone(),
            handle.clone(),
        );
        let connection = ConnectionListener::new(
            services.storage.clone(),
            services.leader.clone(),
            services.sharding.clone(),
            services.execution.clone(),
            handle.clone(),
        );

        services.instances.register_server(server_enabled).await?;
        services.instances.register_instance().await?;
        services.leader.elect_leader().await?;
        services.sharding.mark_needs_sharding().await?;

        tracker.spawn(controller.run());
        tracker.spawn(listener.run(cancel.clone()));
        tracker.spawn(connection.run(cancel.clone()));
        if effective.reconcile_interval_ms > 0 {
            tracker.spawn(reconcile_loop(
                services.sharding.clone(),
                Duration::from_millis(effective.reconcile_interval_ms),
                cancel.clone(),
            ));
        }

        tracing::info!(
            job = %effective.job_name,
            instance = %local,
            total = effective.sharding_total_count,
            strategy = %effective.sharding_strategy,
            "Job coordinator started"
        );
        Ok(Self {
            services,
            runner,
            handle,
            cancel,
            tracker,
        })
    }

    pub fn job_name(&self) -> &str {
        self.services.storage.job_name()
    }

    pub fn local_id(&self) -> &InstanceId {
        self.services.instances.local_id()
    }

    pub fn services(&self) -> &JobServices {
        &self.services
    }

    pub fn runner(&self) -> &Arc<ShardRunner> {
        &self.runner
    }

    pub fn handle(&self) -> &ScheduleHandle {
        &self.handle
    }

    pub fn is_paused(&self) -> bool {
        self.handle.is_paused()
    }

    /// Fire a tick on this instance now.
    pub async fn trigger(&self) -> Result<()> {
        self.handle.trigger().await
    }

    pub async fn local_sharding_items(&self) -> Result<Vec<u32>> {
        self.services.sharding.get_local_sharding_items().await
    }

    pub async fn is_leader(&self) -> Result<bool> {
        self.services.leader.is_leader().await
    }

    /// Admin view of this job over the same registry session.
    pub fn operator(&self) -> JobOperator {
        JobOperator::from_storage(self.services.storage.clone())
    }

    /// Stop all tasks without touching the registry. In-flight runs keep
    /// going; their completion is recorded if the session still works.
    pub fn halt(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Stop ticking, wait for in-flight runs, then leave the job: resign
    /// leadership, remove the instance node and close the session.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(job = self.job_name(), instance = %self.local_id(), "Shutting down job coordinator");
        self.halt();
        self.tracker.wait().await;

        if let Err(e) = self.services.leader.remove_leader().await {
            tracing::warn!(job = self.job_name(), error = %e, "Failed to resign leadership");
        }
        if let Err(e) = self.services.execution.clear_all_running().await {
            tracing::warn!(job = self.job_name(), error = %e, "Failed to clear running markers");
        }
        if let Err(e) = self.services.instances.remove_instance().await {
            tracing::warn!(job = self.job_name(), error = %e, "Failed to remove instance node");
        }
        self.services.storage.registry().close().await;
        tracing::info!(job = self.job_name(), "Job coordinator stopped");
        Ok(())
    }
}

async fn reconcile_loop(sharding: Arc<ShardingService>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already requested a pass.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sharding.reconcile_assignment().await {
                    tracing::warn!(job = sharding.job_name(), error = %e, "Assignment reconcile failed");
                }
            }
        }
    }
}

/// Coordinators of every job this process runs, keyed by job name.
#[derive(Default)]
pub struct CoordinatorRegistry {
    jobs: BTreeMap<String, JobCoordinator>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, coordinator: JobCoordinator) -> Result<()> {
        let name = coordinator.job_name().to_string();
        if self.jobs.contains_key(&name) {
            return Err(ShardError::Config(format!("job '{}' is already running", name)));
        }
        self.jobs.insert(name, coordinator);
        Ok(())
    }

    pub fn get(&self, job_name: &str) -> Option<&JobCoordinator> {
        self.jobs.get(job_name)
    }

    pub fn remove(&mut self, job_name: &str) -> Option<JobCoordinator> {
        self.jobs.remove(job_name)
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Shut every job down, in name order.
    pub async fn shutdown_all(self) {
        for (name, coordinator) in self.jobs {
            if let Err(e) = coordinator.shutdown().await {
                tracing::warn!(job = %name, error = %e, "Job shutdown failed");
            }
        }
    }
}
