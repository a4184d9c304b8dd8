//! Shard item assignment.
//!
//! [`strategy`] holds the pure item-allocation policies; [`ShardingService`]
//! runs them on the leader and persists the result under `sharding/`.

pub mod service;
pub mod strategy;

pub use service::ShardingService;
pub use strategy::{
    AverageAllocation, ParitySortByName, RotateByName, ShardingInput, ShardingPlan, ShardingStrategy,
    StrategyRegistry,
};
