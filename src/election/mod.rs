//! Leader election over a single ephemeral marker.
//!
//! Every available instance races to create `leader/election/instance`;
//! the winner's id is the node's data. The marker disappears with the
//! leader's session, and followers watching the job tree race again.
//!
//! Leadership only decides who recomputes the sharding assignment. It
//! carries no execution rights: every instance runs its own items.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::instance::{InstanceId, InstanceRegistry};
use crate::storage::{path, JobNodeStorage};

const LEADER_POLL: Duration = Duration::from_millis(100);

/// This instance's view of the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    NoLeader,
    Leader,
    Follower,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::NoLeader => write!(f, "no-leader"),
            ElectionState::Leader => write!(f, "leader"),
            ElectionState::Follower => write!(f, "follower"),
        }
    }
}

pub struct LeaderService {
    storage: JobNodeStorage,
    instances: Arc<InstanceRegistry>,
    wait_limit: Duration,
}

impl LeaderService {
    pub fn new(storage: JobNodeStorage, instances: Arc<InstanceRegistry>, wait_limit: Duration) -> Self {
        Self {
            storage,
            instances,
            wait_limit,
        }
    }

    /// Try to take leadership. Instances that are not live or sit on a
    /// disabled server never stand. Returns whether this instance now leads.
    pub async fn elect_leader(&self) -> Result<bool> {
        if !self.instances.is_local_available().await? {
            return Ok(false);
        }
        let local = self.instances.local_id();
        if self
            .storage
            .create_ephemeral_if_absent(path::LEADER_ELECTION, local.as_str())
            .await?
        {
            tracing::info!(job = self.storage.job_name(), instance = %local, "Elected leader");
            return Ok(true);
        }
        self.is_leader().await
    }

    pub async fn leader_id(&self) -> Result<Option<InstanceId>> {
        Ok(self
            .storage
            .get_data(path::LEADER_ELECTION)
            .await?
            .and_then(|data| InstanceId::parse(&data)))
    }

    pub async fn has_leader(&self) -> Result<bool> {
        self.storage.is_node_existed(path::LEADER_ELECTION).await
    }

    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self
            .leader_id()
            .await?
            .is_some_and(|id| self.instances.is_local_instance(&id)))
    }

    pub async fn state(&self) -> Result<ElectionState> {
        Ok(match self.leader_id().await? {
            None => ElectionState::NoLeader,
            Some(id) if self.instances.is_local_instance(&id) => ElectionState::Leader,
            Some(_) => ElectionState::Follower,
        })
    }

    /// Whether this instance leads, waiting for an election to settle while
    /// there is no leader but some instance could take the role.
    pub async fn is_leader_until_block(&self) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.wait_limit;
        while !self.has_leader().await? {
            if self.instances.list_eligible_instances().await?.is_empty() {
                return Ok(false);
            }
            if self.elect_leader().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(job = self.storage.job_name(), "No leader elected within wait limit");
                return Ok(false);
            }
            tokio::time::sleep(LEADER_POLL).await;
        }
        self.is_leader().await
    }

    /// Give up leadership if this instance holds it.
    pub async fn remove_leader(&self) -> Result<()> {
        if self.is_leader().await? {
            self.storage.remove_if_existed(path::LEADER_ELECTION).await?;
            tracing::info!(
                job = self.storage.job_name(),
                instance = %self.instances.local_id(),
                "Resigned leadership"
            );
        }
        Ok(())
    }
}
