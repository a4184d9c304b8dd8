use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, ShardError};
use crate::instance::InstanceId;

/// Instance → owned items. Every instance passed in gets an entry, possibly empty.
pub type ShardingPlan = BTreeMap<InstanceId, Vec<u32>>;

/// Everything a strategy may look at.
#[derive(Debug, Clone, Copy)]
pub struct ShardingInput<'a> {
    pub job_name: &'a str,
    /// Eligible instances in registry order.
    pub instances: &'a [InstanceId],
    pub total_count: u32,
    pub item_parameters: &'a BTreeMap<u32, String>,
}

/// Maps eligible instances to shard items.
///
/// Implementations must cover `0..total_count` exactly once and return the
/// same plan for the same input.
pub trait ShardingStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn shard(&self, input: &ShardingInput<'_>) -> ShardingPlan;
}

/// Contiguous near-equal ranges in list order; the first `total % n`
/// instances get one extra item.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageAllocation;

impl AverageAllocation {
    fn allocate(instances: &[InstanceId], total_count: u32) -> ShardingPlan {
        let mut plan = ShardingPlan::new();
        if instances.is_empty() {
            return plan;
        }
        let n = instances.len() as u32;
        let base = total_count / n;
        let remainder = total_count % n;
        let mut next = 0;
        for (idx, instance) in instances.iter().enumerate() {
            let count = base + u32::from((idx as u32) < remainder);
            plan.insert(instance.clone(), (next..next + count).collect());
            next += count;
        }
        plan
    }
}

impl ShardingStrategy for AverageAllocation {
    fn name(&self) -> &str {
        AVERAGE
    }

    fn shard(&self, input: &ShardingInput<'_>) -> ShardingPlan {
        Self::allocate(input.instances, input.total_count)
    }
}

/// Average allocation over the instance list rotated by a job-name hash, so
/// jobs sharing a pool do not all put item 0 on the same instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotateByName;

impl ShardingStrategy for RotateByName {
    fn name(&self) -> &str {
        ROTATE_BY_NAME
    }

    fn shard(&self, input: &ShardingInput<'_>) -> ShardingPlan {
        if input.instances.is_empty() {
            return ShardingPlan::new();
        }
        let offset = (name_hash(input.job_name) % input.instances.len() as u64) as usize;
        let mut rotated = input.instances.to_vec();
        rotated.rotate_left(offset);
        AverageAllocation::allocate(&rotated, input.total_count)
    }
}

/// Average allocation over instances sorted ascending for odd job-name
/// hashes and descending for even ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParitySortByName;

impl ShardingStrategy for ParitySortByName {
    fn name(&self) -> &str {
        PARITY_BY_NAME
    }

    fn shard(&self, input: &ShardingInput<'_>) -> ShardingPlan {
        let mut sorted = input.instances.to_vec();
        sorted.sort();
        if name_hash(input.job_name) % 2 == 0 {
            sorted.reverse();
        }
        AverageAllocation::allocate(&sorted, input.total_count)
    }
}

pub const AVERAGE: &str = "average";
pub const ROTATE_BY_NAME: &str = "rotate_by_name";
pub const PARITY_BY_NAME: &str = "parity_by_name";

/// FNV-1a over the job name; stable across processes.
pub fn name_hash(job_name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001B3;
    let mut hash = FNV_OFFSET;
    for b in job_name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub type StrategyConstructor = Arc<dyn Fn() -> Arc<dyn ShardingStrategy> + Send + Sync>;

/// Name → constructor table for sharding strategies.
#[derive(Clone)]
pub struct StrategyRegistry {
    constructors: HashMap<String, StrategyConstructor>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(AVERAGE, || Arc::new(AverageAllocation) as Arc<dyn ShardingStrategy>);
        registry.register(ROTATE_BY_NAME, || Arc::new(RotateByName) as Arc<dyn ShardingStrategy>);
        registry.register(PARITY_BY_NAME, || Arc::new(ParitySortByName) as Arc<dyn ShardingStrategy>);
        registry
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Add or replace a strategy under `name`.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn ShardingStrategy> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ShardingStrategy>> {
        self.constructors
            .get(name)
            .map(|construct| construct())
            .ok_or_else(|| ShardError::UnknownStrategy(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}
