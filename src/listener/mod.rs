//! Reactions to changes in the job's coordination subtree.
//!
//! One task per job consumes the subtree watch and turns node events into
//! service calls: topology changes raise the resharding flag, a departed
//! instance's in-flight items are queued for failover, a vanished leader
//! marker starts an election, config edits propagate, and a trigger node
//! for this instance fires the controller.

pub mod connection;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::election::LeaderService;
use crate::error::Result;
use crate::failover::FailoverService;
use crate::instance::{InstanceId, InstanceRegistry, ServerStatus};
use crate::registry::{EventKind, TreeEvent, Watch};
use crate::schedule::ScheduleHandle;
use crate::sharding::ShardingService;
use crate::storage::{path, ConfigService, JobNodeStorage};

pub use connection::{ConnectionAction, ConnectionListener, ConnectionStateMachine};

/// The job nodes the listener cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobNode {
    Config,
    Server(String),
    Instance(InstanceId),
    NeedReshard,
    Leader,
    Trigger(InstanceId),
}

impl JobNode {
    /// Classify a path relative to the job root.
    pub fn classify(relative: &str) -> Option<Self> {
        match relative {
            path::CONFIG => return Some(JobNode::Config),
            path::NEED_RESHARD => return Some(JobNode::NeedReshard),
            path::LEADER_ELECTION => return Some(JobNode::Leader),
            _ => {}
        }
        let (parent, name) = relative.split_once('/')?;
        if name.contains('/') {
            return None;
        }
        match parent {
            path::SERVERS => Some(JobNode::Server(name.to_string())),
            path::INSTANCES => InstanceId::parse(name).map(JobNode::Instance),
            path::TRIGGER => InstanceId::parse(name).map(JobNode::Trigger),
            _ => None,
        }
    }
}

pub struct ListenerManager {
    storage: JobNodeStorage,
    config: Arc<ConfigService>,
    instances: Arc<InstanceRegistry>,
    leader: Arc<LeaderService>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
    handle: ScheduleHandle,
    watch: Watch,
}

impl ListenerManager {
    pub fn new(
        storage: JobNodeStorage,
        config: Arc<ConfigService>,
        instances: Arc<InstanceRegistry>,
        leader: Arc<LeaderService>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
        handle: ScheduleHandle,
    ) -> Self {
        // Subscribe now so events between construction and the first poll are kept.
        let watch = storage.watch();
        Self {
            storage,
            config,
            instances,
            leader,
            sharding,
            failover,
            handle,
            watch,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.watch.next() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_event(&event).await {
                            tracing::warn!(
                                job = self.storage.job_name(),
                                path = %event.path,
                                error = %e,
                                "Failed to handle registry event"
                            );
                        }
                    }
                    None => break,
                },
            }
        }
    }

    pub async fn on_event(&self, event: &TreeEvent) -> Result<()> {
        let node = match self
            .storage
            .node_path()
            .relative(&event.path)
            .and_then(JobNode::classify)
        {
            Some(node) => node,
            None => return Ok(()),
        };

        match (node, event.kind) {
            (JobNode::Config, EventKind::Created | EventKind::Updated) => {
                if let Some(data) = &event.data {
                    self.on_config_changed(data).await?;
                }
            }
            (JobNode::Server(ip), kind) => {
                self.sharding.mark_needs_sharding().await?;
                if ip == self.instances.local_id().ip() && kind != EventKind::Deleted {
                    self.on_local_server_changed(event.data.as_deref().unwrap_or_default())
                        .await?;
                }
            }
            (JobNode::Instance(id), EventKind::Created) => {
                tracing::debug!(job = self.storage.job_name(), instance = %id, "Instance joined");
                self.sharding.mark_needs_sharding().await?;
            }
            (JobNode::Instance(id), EventKind::Deleted) => {
                tracing::info!(job = self.storage.job_name(), instance = %id, "Instance left");
                if !self.instances.is_local_instance(&id) {
                    self.failover.enqueue_abandoned(&id).await?;
                }
                self.sharding.mark_needs_sharding().await?;
            }
            (JobNode::NeedReshard, EventKind::Created) => {
                if self.leader.is_leader().await? {
                    self.sharding.reshard_if_necessary().await?;
                }
            }
            (JobNode::Leader, EventKind::Deleted) => {
                if self.leader.elect_leader().await? {
                    self.sharding.reshard_if_necessary().await?;
                }
            }
            (JobNode::Trigger(id), EventKind::Created) if self.instances.is_local_instance(&id) => {
                self.storage
                    .remove_if_existed(&path::trigger(id.as_str()))
                    .await?;
                tracing::info!(job = self.storage.job_name(), "Manual trigger received");
                self.handle.trigger().await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_config_changed(&self, data: &str) -> Result<()> {
        let change = self.config.apply_remote(data).await?;
        if change.total_count_changed {
            tracing::info!(job = self.storage.job_name(), "Sharding total count changed");
            self.sharding.mark_needs_sharding().await?;
        }
        if change.schedule_changed {
            let schedule = self.config.current().await.schedule;
            self.handle.reschedule(schedule).await?;
        }
        Ok(())
    }

    async fn on_local_server_changed(&self, data: &str) -> Result<()> {
        if ServerStatus::from_data(data).is_enabled() {
            if !self.leader.has_leader().await? && self.leader.elect_leader().await? {
                self.sharding.reshard_if_necessary().await?;
            }
        } else {
            tracing::info!(job = self.storage.job_name(), "Local server disabled");
            self.leader.remove_leader().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_job_nodes() {
        assert_eq!(JobNode::classify("config"), Some(JobNode::Config));
        assert_eq!(
            JobNode::classify("servers/10.0.0.5"),
            Some(JobNode::Server("10.0.0.5".to_string()))
        );
        assert_eq!(
            JobNode::classify("instances/10.0.0.5@-@7"),
            Some(JobNode::Instance(InstanceId::new("10.0.0.5", 7)))
        );
        assert_eq!(JobNode::classify("sharding/needReshard"), Some(JobNode::NeedReshard));
        assert_eq!(JobNode::classify("leader/election/instance"), Some(JobNode::Leader));
        assert_eq!(
            JobNode::classify("trigger/10.0.0.5@-@7"),
            Some(JobNode::Trigger(InstanceId::new("10.0.0.5", 7)))
        );
    }

    #[test]
    fn ignores_other_nodes() {
        for relative in [
            "servers",
            "instances",
            "sharding/3/instance",
            "execution/3/running",
            "leader/failover/items/3",
            "instances/not-an-id",
        ] {
            assert_eq!(JobNode::classify(relative), None, "{}", relative);
        }
    }
}
