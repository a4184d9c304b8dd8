use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Schedule;
use crate::error::{Result, ShardError};
use crate::schedule::runner::ShardRunner;
use crate::schedule::trigger::CompiledSchedule;

const CONTROL_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop firing ticks; in-flight runs finish.
    Pause,
    /// Fire again and re-run items flagged as misfired.
    Resume,
    /// Fire one tick now.
    TriggerNow,
    Reschedule(Schedule),
}

/// Published after every state change of the controller loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub paused: bool,
    /// Ticks fired since start.
    pub ticks: u64,
}

/// Cloneable handle for steering a running [`JobScheduleController`].
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    tx: mpsc::Sender<ControlMessage>,
    state: watch::Receiver<ControllerState>,
}

impl ScheduleHandle {
    async fn send(&self, msg: ControlMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ShardError::Internal("schedule controller has stopped".to_string()))
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(ControlMessage::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(ControlMessage::Resume).await
    }

    pub async fn trigger(&self) -> Result<()> {
        self.send(ControlMessage::TriggerNow).await
    }

    pub async fn reschedule(&self, schedule: Schedule) -> Result<()> {
        self.send(ControlMessage::Reschedule(schedule)).await
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }
}

/// Local trigger loop of one job instance.
///
/// The loop only decides *when*; tick bodies, failover polls and item runs
/// are spawned onto the tracker so a slow registry call never delays the
/// next fire time.
pub struct JobScheduleController {
    runner: Arc<ShardRunner>,
    schedule: CompiledSchedule,
    failover_poll: Duration,
    rx: mpsc::Receiver<ControlMessage>,
    state_tx: watch::Sender<ControllerState>,
    state: ControllerState,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobScheduleController {
    pub fn new(
        runner: Arc<ShardRunner>,
        schedule: CompiledSchedule,
        failover_poll: Duration,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> (Self, ScheduleHandle) {
        let (tx, rx) = mpsc::channel(CONTROL_BUFFER);
        let (state_tx, state_rx) = watch::channel(ControllerState::default());
        let controller = Self {
            runner,
            schedule,
            failover_poll,
            rx,
            state_tx,
            state: ControllerState::default(),
            cancel,
            tracker,
        };
        (controller, ScheduleHandle { tx, state: state_rx })
    }

    pub async fn run(mut self) {
        let mut next = self.schedule.next_fire(Utc::now());
        let mut failover_tick = tokio::time::interval(self.failover_poll);
        failover_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let poll_failover = !self.state.paused && self.runner.failover_enabled().await;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(job = self.runner.job_name(), "Schedule controller stopping");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg, &mut next),
                    None => break,
                },
                _ = sleep_until(next) => {
                    next = self.schedule.next_fire(Utc::now());
                    if self.state.paused {
                        tracing::debug!(job = self.runner.job_name(), "Paused, skipping tick");
                    } else {
                        self.fire();
                    }
                }
                _ = failover_tick.tick(), if poll_failover => {
                    let runner = self.runner.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = runner.poll_failover().await {
                            tracing::warn!(job = runner.job_name(), error = %e, "Failover poll failed");
                        }
                    });
                }
            }
        }
    }

    fn handle(&mut self, msg: ControlMessage, next: &mut Option<DateTime<Utc>>) {
        match msg {
            ControlMessage::Pause => {
                if !self.state.paused {
                    tracing::info!(job = self.runner.job_name(), "Schedule paused");
                    self.state.paused = true;
                    self.publish();
                }
            }
            ControlMessage::Resume => {
                if self.state.paused {
                    tracing::info!(job = self.runner.job_name(), "Schedule resumed");
                    self.state.paused = false;
                    self.publish();
                    let runner = self.runner.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = runner.run_misfired().await {
                            tracing::warn!(job = runner.job_name(), error = %e, "Misfire replay failed");
                        }
                    });
                }
            }
            ControlMessage::TriggerNow => {
                if self.state.paused {
                    tracing::info!(job = self.runner.job_name(), "Paused, ignoring trigger");
                } else {
                    self.fire();
                }
            }
            ControlMessage::Reschedule(schedule) => match CompiledSchedule::compile(&schedule) {
                Ok(compiled) => {
                    self.schedule = compiled;
                    *next = self.schedule.next_fire(Utc::now());
                    tracing::info!(job = self.runner.job_name(), schedule = ?schedule, "Rescheduled");
                }
                Err(e) => {
                    tracing::warn!(job = self.runner.job_name(), error = %e, "Ignoring invalid schedule");
                }
            },
        }
    }

    fn fire(&mut self) {
        self.state.ticks += 1;
        self.publish();
        let runner = self.runner.clone();
        self.tracker.spawn(async move {
            match runner.execute_tick().await {
                Ok(report) if !report.misfired.is_empty() => {
                    tracing::info!(job = runner.job_name(), items = ?report.misfired, "Items still running, misfire recorded");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(job = runner.job_name(), error = %e, "Tick failed"),
            }
        });
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state);
    }
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending().await,
    }
}
