pub mod admin;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod execution;
pub mod failover;
pub mod instance;
pub mod listener;
pub mod registry;
pub mod schedule;
pub mod sharding;
pub mod shutdown;
pub mod storage;

pub use coordinator::{CoordinatorRegistry, JobCoordinator, JobServices};
pub use error::{Result, ShardError};
