//! Execution tests: one running owner per item, misfire bookkeeping and
//! completion records.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use shardbeat::instance::InstanceId;
use shardbeat::registry::{
    CreateMode, MemoryRegistry, MemorySession, RegistryCenter, RegistryError, SessionId, SessionState, TxnOp,
    Watch,
};
use shardbeat::schedule::ShardRunner;
use shardbeat::sharding::StrategyRegistry;
use shardbeat::JobServices;
use test_harness::{
    assert_eventually, bare_services, register, test_job, test_registry_config, RecordingJob, RunLog, TestCluster,
};

/// Two instances racing for the same item: exactly one wins.
#[tokio::test]
async fn test_at_most_one_running_owner() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 2);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    let (b, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 2)).await;
    register(&a, &job).await;
    register(&b, &job).await;

    let (won_a, won_b) = tokio::join!(
        a.execution.try_begin_running(0),
        b.execution.try_begin_running(0)
    );
    let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());
    assert!(won_a ^ won_b, "exactly one instance should start item 0");

    let (winner, loser) = if won_a { (&a, &b) } else { (&b, &a) };
    let record = loser.execution.execution_record(0).await.unwrap();
    assert_eq!(record.running.as_ref(), Some(winner.instances.local_id()));
    assert!(record.is_in_flight());
    assert!(loser.execution.has_running_items(&[0]).await.unwrap());
    assert!(!loser.execution.has_running_items(&[1]).await.unwrap());

    // The winner may not start it twice either.
    assert!(!winner.execution.try_begin_running(0).await.unwrap());

    winner.execution.complete_running(0, true).await.unwrap();
    let record = loser.execution.execution_record(0).await.unwrap();
    assert!(record.running.is_none());
    assert!(!record.is_in_flight());
    assert!(record.last_complete_time.is_some());
    assert!(loser.execution.try_begin_running(0).await.unwrap());
}

/// Without monitoring nothing is persisted and only local overlap is refused.
#[tokio::test]
async fn test_unmonitored_runs_are_local_only() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 1).with_monitor_execution(false);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    let (b, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 2)).await;
    register(&a, &job).await;
    register(&b, &job).await;

    assert!(a.execution.try_begin_running(0).await.unwrap());
    assert!(!a.execution.try_begin_running(0).await.unwrap());
    assert!(b.execution.try_begin_running(0).await.unwrap());

    let record = a.execution.execution_record(0).await.unwrap();
    assert!(record.running.is_none());
    assert!(record.last_begin_time.is_none());

    let completion = a.execution.complete_running(0, false).await.unwrap();
    assert!(!completion.failover_enqueued);
    assert!(a.execution.locally_running().await.is_empty());
}

/// A failed run is recorded and cleared by the next successful one.
#[tokio::test]
async fn test_failed_run_is_recorded() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 1);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    register(&a, &job).await;
    a.leader.elect_leader().await.unwrap();
    a.sharding.mark_needs_sharding().await.unwrap();
    a.sharding.reshard_if_necessary().await.unwrap();

    assert!(a.execution.try_begin_running(0).await.unwrap());
    let completion = a.execution.complete_running(0, false).await.unwrap();
    assert!(completion.still_owner);
    assert!(!completion.failover_enqueued);
    assert!(a.execution.execution_record(0).await.unwrap().failing);

    assert!(a.execution.try_begin_running(0).await.unwrap());
    a.execution.complete_running(0, true).await.unwrap();
    assert!(!a.execution.execution_record(0).await.unwrap().failing);
}

/// A fire that finds an item still running flags a misfire; the item runs
/// again as soon as the slow run completes, and only once.
#[tokio::test]
async fn test_misfire_reruns_after_completion() {
    let cluster = TestCluster::start_local(test_job("orders", 2), 1).await;
    let ids = cluster.ids();
    cluster
        .wait_for_owners(&ids, Duration::from_secs(5))
        .await
        .expect("assignment should settle");

    let instance = cluster.instance(&ids[0]);
    instance.job.block(0);
    instance.coordinator.trigger().await.unwrap();

    let log = cluster.log.clone();
    let id = ids[0].clone();
    assert_eventually(
        || {
            let (log, id) = (log.clone(), id.clone());
            async move { log.has_started(&id, 0) && log.finished().len() == 1 }
        },
        Duration::from_secs(5),
        "item 0 should be running and item 1 done",
    )
    .await;

    instance.coordinator.trigger().await.unwrap();
    let operator = cluster.operator();
    assert_eventually(
        || async move { operator.execution_record(0).await.unwrap().misfire },
        Duration::from_secs(5),
        "second fire should flag item 0 as misfired",
    )
    .await;
    assert_eventually(
        || {
            let (log, id) = (log.clone(), id.clone());
            async move { log.started_by(&id).iter().filter(|i| **i == 1).count() == 2 }
        },
        Duration::from_secs(5),
        "idle item 1 should run again on the second fire",
    )
    .await;

    instance.job.release();
    assert_eventually(
        || {
            let log = log.clone();
            async move { log.started().iter().filter(|r| r.item == 0).count() == 2 }
        },
        Duration::from_secs(5),
        "item 0 should re-run once after the blocked run completes",
    )
    .await;
    assert_eventually(
        || async move {
            let record = operator.execution_record(0).await.unwrap();
            !record.misfire && record.running.is_none()
        },
        Duration::from_secs(5),
        "misfire flag should be consumed",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        cluster.log.started().iter().filter(|r| r.item == 0).count(),
        2,
        "a consumed misfire should not trigger further runs"
    );

    cluster.shutdown().await;
}

/// Misfired items are replayed explicitly; flags on running items stay.
#[tokio::test]
async fn test_misfired_items_skip_running() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 2);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    register(&a, &job).await;

    a.execution.set_misfire(0).await.unwrap();
    a.execution.set_misfire(1).await.unwrap();
    assert!(a.execution.try_begin_running(1).await.unwrap());

    assert_eq!(a.execution.misfired_items(&[0, 1]).await.unwrap(), vec![0]);
    assert!(a.execution.clear_misfire(0).await.unwrap());
    assert!(!a.execution.clear_misfire(0).await.unwrap());
    assert!(a.execution.misfired_items(&[0, 1]).await.unwrap().is_empty());
}

/// Local overlap flags a misfire even without monitoring, and completing the
/// run consumes it and asks for a re-run.
#[tokio::test]
async fn test_unmonitored_misfire_is_rerun() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 1).with_monitor_execution(false);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    register(&a, &job).await;
    a.leader.elect_leader().await.unwrap();
    a.sharding.mark_needs_sharding().await.unwrap();
    a.sharding.reshard_if_necessary().await.unwrap();

    assert!(a.execution.try_begin_running(0).await.unwrap());
    assert!(!a.execution.try_begin_running(0).await.unwrap());
    a.execution.set_misfire(0).await.unwrap();

    let completion = a.execution.complete_running(0, true).await.unwrap();
    assert!(completion.still_owner);
    assert!(completion.rerun);
    assert!(!a.execution.execution_record(0).await.unwrap().misfire);
}

/// An instance that lost the item mid-run drops the misfire flag without
/// re-running, so the new owner never replays it.
#[tokio::test]
async fn test_misfire_dropped_when_ownership_lost() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 1);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("10.0.0.5", 1)).await;
    register(&a, &job).await;
    a.leader.elect_leader().await.unwrap();
    a.sharding.mark_needs_sharding().await.unwrap();
    a.sharding.reshard_if_necessary().await.unwrap();

    assert!(a.execution.try_begin_running(0).await.unwrap());
    a.execution.set_misfire(0).await.unwrap();
    a.instances.set_server_enabled("10.0.0.5", false).await.unwrap();

    let completion = a.execution.complete_running(0, true).await.unwrap();
    assert!(!completion.still_owner);
    assert!(!completion.rerun);
    let record = a.execution.execution_record(0).await.unwrap();
    assert!(!record.misfire);
    assert!(record.running.is_none());
}

/// Session whose creates under one path always fail.
struct FailingCreates {
    inner: MemorySession,
    suffix: &'static str,
}

#[async_trait]
impl RegistryCenter for FailingCreates {
    async fn create(&self, path: &str, data: &str, mode: CreateMode) -> Result<String, RegistryError> {
        if path.ends_with(self.suffix) {
            return Err(RegistryError::Backend(format!("create refused: {}", path)));
        }
        self.inner.create(path, data, mode).await
    }

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError> {
        self.inner.get(path).await
    }

    async fn update(&self, path: &str, data: &str) -> Result<(), RegistryError> {
        self.inner.update(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<(), RegistryError> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        self.inner.exists(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        self.inner.children(path).await
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<(), RegistryError> {
        self.inner.transaction(ops).await
    }

    fn watch(&self, path: &str) -> Watch {
        self.inner.watch(path)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.inner.session_events()
    }

    fn session_id(&self) -> SessionId {
        self.inner.session_id()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// A registry error while starting one item does not keep the tick from
/// starting the others.
#[tokio::test]
async fn test_tick_continues_past_item_error() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 3);
    let id = InstanceId::new("127.0.0.1", 1);
    let session = FailingCreates {
        inner: registry.connect().await,
        suffix: "/execution/1/running",
    };
    let a = JobServices::build(
        Arc::new(session),
        &test_registry_config(),
        job.clone(),
        id.clone(),
        Arc::new(StrategyRegistry::default()),
    );
    register(&a, &job).await;
    a.leader.elect_leader().await.unwrap();
    a.sharding.mark_needs_sharding().await.unwrap();

    let log = Arc::new(RunLog::default());
    let tracker = TaskTracker::new();
    let runner = Arc::new(ShardRunner::new(
        id.clone(),
        Arc::new(RecordingJob::new(id, log.clone())),
        a.config.clone(),
        a.sharding.clone(),
        a.execution.clone(),
        a.failover.clone(),
        4,
        tracker.clone(),
    ));

    let report = runner.execute_tick().await.unwrap();
    assert_eq!(report.owned, vec![0, 1, 2]);
    assert_eq!(report.started, vec![0, 2]);
    assert!(report.misfired.is_empty());

    tracker.close();
    tracker.wait().await;
    let mut items: Vec<u32> = log.finished().into_iter().map(|(run, _)| run.item).collect();
    items.sort_unstable();
    assert_eq!(items, vec![0, 2]);
}
