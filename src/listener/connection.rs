use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::election::LeaderService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::registry::SessionState;
use crate::schedule::ScheduleHandle;
use crate::sharding::ShardingService;
use crate::storage::JobNodeStorage;

const RECONCILE_ATTEMPTS: u32 = 5;
const RECONCILE_BACKOFF: Duration = Duration::from_millis(200);

/// What the coordinator must do after a session state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Pause,
    ReconcileAndResume,
}

/// Folds session notifications into pause / resume edges. Repeated
/// notifications of the same side produce no action.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    connected: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self { connected: true }
    }
}

impl ConnectionStateMachine {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn on_event(&mut self, state: SessionState) -> Option<ConnectionAction> {
        match (self.connected, state.is_connected()) {
            (true, false) => {
                self.connected = false;
                Some(ConnectionAction::Pause)
            }
            (false, true) => {
                self.connected = true;
                Some(ConnectionAction::ReconcileAndResume)
            }
            _ => None,
        }
    }
}

/// Drives the schedule controller from the registry session.
pub struct ConnectionListener {
    storage: JobNodeStorage,
    leader: Arc<LeaderService>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
    handle: ScheduleHandle,
    events: broadcast::Receiver<SessionState>,
}

impl ConnectionListener {
    pub fn new(
        storage: JobNodeStorage,
        leader: Arc<LeaderService>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
        handle: ScheduleHandle,
    ) -> Self {
        let events = storage.session_events();
        Self {
            storage,
            leader,
            sharding,
            execution,
            handle,
            events,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut machine = ConnectionStateMachine::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(state) => {
                        tracing::info!(job = self.storage.job_name(), state = %state, "Registry session state changed");
                        if let Some(action) = machine.on_event(state) {
                            self.apply(action, &cancel).await;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(job = self.storage.job_name(), skipped = n, "Session events lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn apply(&self, action: ConnectionAction, cancel: &CancellationToken) {
        match action {
            ConnectionAction::Pause => {
                if let Err(e) = self.handle.pause().await {
                    tracing::warn!(job = self.storage.job_name(), error = %e, "Failed to pause schedule");
                }
            }
            ConnectionAction::ReconcileAndResume => {
                for attempt in 1..=RECONCILE_ATTEMPTS {
                    match self.reconcile().await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(
                                job = self.storage.job_name(),
                                attempt,
                                error = %e,
                                "Reconcile after reconnect failed"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(RECONCILE_BACKOFF * attempt) => {}
                            }
                        }
                    }
                }
                if let Err(e) = self.handle.resume().await {
                    tracing::warn!(job = self.storage.job_name(), error = %e, "Failed to resume schedule");
                }
            }
        }
    }

    async fn reconcile(&self) -> Result<()> {
        self.execution.reconcile_after_reconnect().await?;
        if !self.leader.has_leader().await? && self.leader.elect_leader().await? {
            self.sharding.reshard_if_necessary().await?;
        }
        self.sharding.repair_if_incomplete().await?;
        Ok(())
    }
}
