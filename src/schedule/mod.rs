//! Local triggering of one job instance.
//!
//! [`JobScheduleController`] owns the fire-time loop, [`ShardRunner`]
//! turns a fire into shard-item runs and [`ShardJob`] is the body those
//! runs execute.

pub mod controller;
pub mod job;
pub mod runner;
pub mod trigger;

pub use controller::{ControlMessage, ControllerState, JobScheduleController, ScheduleHandle};
pub use job::{JobError, JobResult, ScriptJob, ShardJob, ShardingContext};
pub use runner::{ShardRunner, TickReport};
pub use trigger::CompiledSchedule;
