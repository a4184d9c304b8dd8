//! Failover tests: claiming queued entries, re-running abandoned items and
//! recovering from an instance crash mid-run.


use std::time::Duration;

use shardbeat::coordinator::JobServices;
use shardbeat::instance::InstanceId;
use shardbeat::registry::MemoryRegistry;
use test_harness::{assert_eventually, bare_services, register, test_job, TestCluster};

async fn resharded_pair(
    registry: &MemoryRegistry,
    total: u32,
) -> (JobServices, JobServices, shardbeat::registry::SessionId) {
    let job = test_job("orders", total).with_failover(true);
    let (a, _) = bare_services(registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    let (b, b_session) = bare_services(registry, &job, InstanceId::new("127.0.0.1", 2)).await;
    register(&a, &job).await;
    register(&b, &job).await;
    a.leader.elect_leader().await.unwrap();
    a.sharding.mark_needs_sharding().await.unwrap();
    a.sharding.reshard_if_necessary().await.unwrap();
    (a, b, b_session)
}

/// Two instances polling the same entry: exactly one claim succeeds.
#[tokio::test]
async fn test_failover_claim_is_exclusive() {
    let registry = MemoryRegistry::new();
    let (a, b, _) = resharded_pair(&registry, 2).await;

    assert!(a.failover.enqueue(0).await.unwrap());
    assert!(!b.failover.enqueue(0).await.unwrap(), "entry is already queued");

    let (claim_a, claim_b) = tokio::join!(a.failover.poll_and_claim(&[0]), b.failover.poll_and_claim(&[0]));
    let claims: Vec<u32> = [claim_a.unwrap(), claim_b.unwrap()].into_iter().flatten().collect();
    assert_eq!(claims, vec![0]);

    let holder = a.failover.claimed_by(0).await.unwrap().expect("claim should be recorded");
    assert!(holder == *a.instances.local_id() || holder == *b.instances.local_id());
    assert!(a.failover.is_pending(0).await.unwrap());
}

/// Entries for items owned elsewhere are never claimed.
#[tokio::test]
async fn test_failover_claim_respects_ownership() {
    let registry = MemoryRegistry::new();
    let (a, b, _) = resharded_pair(&registry, 2).await;
    a.failover.enqueue(1).await.unwrap();

    let a_items = a.sharding.get_local_sharding_items().await.unwrap();
    assert_eq!(a_items, vec![0]);
    assert_eq!(a.failover.poll_and_claim(&a_items).await.unwrap(), None);

    let b_items = b.sharding.get_local_sharding_items().await.unwrap();
    assert_eq!(b.failover.poll_and_claim(&b_items).await.unwrap(), Some(1));
}

/// A failed re-run releases the claim and keeps the entry queued; a
/// successful one removes it.
#[tokio::test]
async fn test_failed_rerun_keeps_entry() {
    let registry = MemoryRegistry::new();
    let (a, _b, _) = resharded_pair(&registry, 2).await;
    a.failover.enqueue(0).await.unwrap();

    assert_eq!(a.failover.poll_and_claim(&[0]).await.unwrap(), Some(0));
    assert_eq!(a.failover.poll_and_claim(&[0]).await.unwrap(), None, "claimed entries are skipped");
    a.failover.complete(0, false).await.unwrap();
    assert!(a.failover.is_pending(0).await.unwrap());
    assert_eq!(a.failover.claimed_by(0).await.unwrap(), None);

    assert_eq!(a.failover.poll_and_claim(&[0]).await.unwrap(), Some(0));
    a.failover.complete(0, true).await.unwrap();
    assert!(!a.failover.is_pending(0).await.unwrap());
    assert!(a.failover.pending_items().await.unwrap().is_empty());
}

/// Only items that were mid-run when their owner vanished are queued.
#[tokio::test]
async fn test_abandoned_in_flight_items_are_queued() {
    let registry = MemoryRegistry::new();
    let (a, b, b_session) = resharded_pair(&registry, 4).await;
    assert_eq!(b.sharding.get_local_sharding_items().await.unwrap(), vec![2, 3]);

    assert!(b.execution.try_begin_running(2).await.unwrap());
    assert!(b.execution.try_begin_running(3).await.unwrap());
    b.execution.complete_running(3, true).await.unwrap();

    registry.expire(b_session).await;

    let b_id = InstanceId::new("127.0.0.1", 2);
    assert_eq!(a.failover.enqueue_abandoned(&b_id).await.unwrap(), vec![2]);
    assert_eq!(a.failover.pending_items().await.unwrap(), vec![2]);

    // The leader's sweep finds the same item and leaves the queue as it is.
    assert_eq!(
        a.failover
            .sweep_orphans(&[a.instances.local_id().clone()])
            .await
            .unwrap(),
        vec![2]
    );
    assert_eq!(a.failover.pending_items().await.unwrap(), vec![2]);
}

/// Nothing is queued when failover is off.
#[tokio::test]
async fn test_abandoned_items_ignored_without_failover() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 2);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 1)).await;
    let (b, b_session) = bare_services(&registry, &job, InstanceId::new("127.0.0.1", 2)).await;
    register(&a, &job).await;
    register(&b, &job).await;
    a.leader.elect_leader().await.unwrap();
    a.sharding.mark_needs_sharding().await.unwrap();
    a.sharding.reshard_if_necessary().await.unwrap();

    assert!(b.execution.try_begin_running(1).await.unwrap());
    registry.expire(b_session).await;

    assert!(a
        .failover
        .enqueue_abandoned(b.instances.local_id())
        .await
        .unwrap()
        .is_empty());
    assert!(a.failover.pending_items().await.unwrap().is_empty());
}

/// A failed plain run on the owner is queued and replayed as failover.
#[tokio::test]
async fn test_failed_run_is_replayed_as_failover() {
    let cluster = TestCluster::start_local(test_job("orders", 1).with_failover(true), 1).await;
    let ids = cluster.ids();
    cluster
        .wait_for_owners(&ids, Duration::from_secs(5))
        .await
        .expect("assignment should settle");

    let instance = cluster.instance(&ids[0]);
    instance.job.fail(0);
    instance.coordinator.trigger().await.unwrap();

    let log = cluster.log.clone();
    assert_eventually(
        || {
            let log = log.clone();
            async move { !log.failover_runs().is_empty() }
        },
        Duration::from_secs(5),
        "failed item should be replayed through failover",
    )
    .await;
    instance.job.heal(0);

    let operator = cluster.operator();
    assert_eventually(
        || async move { operator.pending_failover().await.unwrap().is_empty() },
        Duration::from_secs(5),
        "entry should be removed after a successful replay",
    )
    .await;
    assert!(cluster
        .log
        .finished()
        .iter()
        .any(|(run, ok)| run.is_failover && *ok));

    cluster.shutdown().await;
}

/// An instance crashes with an item mid-run; the item's new owner replays
/// it once as failover and the queue drains.
#[tokio::test]
async fn test_crashed_instance_item_is_failed_over() {
    let mut cluster = TestCluster::start_local(test_job("orders", 6).with_failover(true), 3).await;
    let ids = cluster.ids();
    let assignment = cluster
        .wait_for_owners(&ids, Duration::from_secs(5))
        .await
        .expect("assignment should settle");
    assert_eq!(assignment[&2], ids[1]);
    assert_eq!(assignment[&3], ids[1]);

    let victim = cluster.instance(&ids[1]);
    victim.job.block(3);
    victim.coordinator.trigger().await.unwrap();

    let log = cluster.log.clone();
    let victim_id = ids[1].clone();
    assert_eventually(
        || {
            let (log, id) = (log.clone(), victim_id.clone());
            async move {
                log.has_started(&id, 3)
                    && log.finished().iter().any(|(run, _)| run.instance == id && run.item == 2)
            }
        },
        Duration::from_secs(5),
        "item 3 should be blocked mid-run and item 2 done",
    )
    .await;
    let operator = cluster.operator().clone();
    let operator = &operator;
    assert_eventually(
        || async move {
            let record = operator.execution_record(2).await.unwrap();
            record.running.is_none() && !record.is_in_flight()
        },
        Duration::from_secs(5),
        "item 2 completion should be recorded",
    )
    .await;

    let crashed = cluster.kill(&ids[1]).await;

    let survivors = vec![ids[0].clone(), ids[2].clone()];
    let assignment = cluster
        .wait_for_owners(&survivors, Duration::from_secs(5))
        .await
        .expect("items should move to the survivors");
    assert_eq!(assignment[&3], ids[2]);

    assert_eventually(
        || {
            let log = log.clone();
            async move { !log.failover_runs().is_empty() }
        },
        Duration::from_secs(5),
        "abandoned item should be replayed",
    )
    .await;
    assert_eventually(
        || async move { operator.pending_failover().await.unwrap().is_empty() },
        Duration::from_secs(5),
        "failover queue should drain",
    )
    .await;

    let replays = cluster.log.failover_runs();
    assert_eq!(replays.len(), 1, "item should be replayed exactly once");
    assert_eq!(replays[0].item, 3);
    assert_eq!(replays[0].instance, ids[2]);

    crashed.job.release();
    cluster.shutdown().await;
}

/// Disabling a server moves its items away, but an owner still running one
/// is alive: its item is not queued, and its completion queues nothing.
#[tokio::test]
async fn test_disabled_live_owner_is_not_an_orphan() {
    let registry = MemoryRegistry::new();
    let job = test_job("orders", 2).with_failover(true);
    let (a, _) = bare_services(&registry, &job, InstanceId::new("10.0.0.5", 1)).await;
    let (b, _) = bare_services(&registry, &job, InstanceId::new("10.0.0.6", 1)).await;
    register(&a, &job).await;
    register(&b, &job).await;
    assert!(b.leader.elect_leader().await.unwrap());
    b.sharding.mark_needs_sharding().await.unwrap();
    b.sharding.reshard_if_necessary().await.unwrap();
    assert_eq!(a.sharding.get_local_sharding_items().await.unwrap(), vec![0]);

    assert!(a.execution.try_begin_running(0).await.unwrap());
    b.instances.set_server_enabled("10.0.0.5", false).await.unwrap();
    b.sharding.mark_needs_sharding().await.unwrap();
    assert!(b.sharding.reshard_if_necessary().await.unwrap());

    assert_eq!(b.sharding.get_local_sharding_items().await.unwrap(), vec![0, 1]);
    assert!(b.instances.is_instance_alive(a.instances.local_id()).await.unwrap());
    assert!(b.failover.pending_items().await.unwrap().is_empty());

    let completion = a.execution.complete_running(0, false).await.unwrap();
    assert!(!completion.still_owner);
    assert!(!completion.failover_enqueued);
    assert!(b.failover.pending_items().await.unwrap().is_empty());
    assert_eq!(b.failover.poll_and_claim(&[0, 1]).await.unwrap(), None);
}
