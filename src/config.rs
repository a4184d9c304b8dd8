use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};

/// When the local controller fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Six or seven field cron expression (seconds first).
    Cron { expr: String },
    /// Fixed delay between fire times.
    Interval { interval_ms: u64 },
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Interval { interval_ms: 10_000 }
    }
}

/// Definition of one sharded job.
///
/// Stored as JSON in the job's `config` node; the registry copy is the one
/// every instance reads when resharding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub job_name: String,
    pub schedule: Schedule,
    pub sharding_total_count: u32,
    /// Per-item parameters, `"0=a,1=b"`.
    pub sharding_item_parameters: String,
    pub job_parameter: String,
    /// Persist running/misfire state to enforce one running owner per item.
    pub monitor_execution: bool,
    /// Queue items abandoned by crashed or failed owners for re-execution.
    pub failover: bool,
    /// Re-run an item once when a tick found it still running.
    pub misfire: bool,
    pub sharding_strategy: String,
    /// Maximum concurrent shard-item runs on one instance.
    pub max_concurrency: usize,
    pub failover_poll_interval_ms: u64,
    /// Period of the leader's assignment consistency check; 0 disables it.
    pub reconcile_interval_ms: u64,
    /// Register this host's server as disabled on first start.
    pub disabled: bool,
    /// Replace the registry copy of the config with this one on startup.
    pub overwrite: bool,
    pub description: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            schedule: Schedule::default(),
            sharding_total_count: 1,
            sharding_item_parameters: String::new(),
            job_parameter: String::new(),
            monitor_execution: true,
            failover: false,
            misfire: true,
            sharding_strategy: "average".to_string(),
            max_concurrency: 8,
            failover_poll_interval_ms: 1_000,
            reconcile_interval_ms: 60_000,
            disabled: false,
            overwrite: false,
            description: String::new(),
        }
    }
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, schedule: Schedule, sharding_total_count: u32) -> Self {
        Self {
            job_name: job_name.into(),
            schedule,
            sharding_total_count,
            ..Default::default()
        }
    }

    pub fn with_item_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.sharding_item_parameters = parameters.into();
        self
    }

    pub fn with_failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_monitor_execution(mut self, monitor: bool) -> Self {
        self.monitor_execution = monitor;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.sharding_strategy = strategy.into();
        self
    }

    /// Load a job definition from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: JobConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject definitions the coordinator cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(ShardError::Config("job name must not be empty".into()));
        }
        if self.job_name.contains('/') {
            return Err(ShardError::Config(format!(
                "job name '{}' must not contain '/'",
                self.job_name
            )));
        }
        if self.sharding_total_count == 0 {
            return Err(ShardError::Config(
                "sharding total count must be greater than zero".into(),
            ));
        }
        match &self.schedule {
            Schedule::Cron { expr } if expr.trim().is_empty() => {
                return Err(ShardError::Config("cron expression must not be empty".into()));
            }
            Schedule::Interval { interval_ms: 0 } => {
                return Err(ShardError::Config("schedule interval must be positive".into()));
            }
            _ => {}
        }
        if self.max_concurrency == 0 {
            return Err(ShardError::Config("max concurrency must be positive".into()));
        }
        if self.failover && !self.monitor_execution {
            return Err(ShardError::Config(
                "failover requires monitor_execution to be enabled".into(),
            ));
        }
        if self.failover && self.failover_poll_interval_ms == 0 {
            return Err(ShardError::Config(
                "failover poll interval must be positive".into(),
            ));
        }
        for item in self.item_parameters()?.keys() {
            if *item >= self.sharding_total_count {
                return Err(ShardError::Config(format!(
                    "parameter given for item {} but sharding total count is {}",
                    item, self.sharding_total_count
                )));
            }
        }
        Ok(())
    }

    /// Parsed `sharding_item_parameters`.
    pub fn item_parameters(&self) -> Result<BTreeMap<u32, String>> {
        parse_item_parameters(&self.sharding_item_parameters)
    }
}

/// Parse `"0=a,1=b"` into an item → parameter map.
pub fn parse_item_parameters(raw: &str) -> Result<BTreeMap<u32, String>> {
    let mut parameters = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (item, value) = pair.split_once('=').ok_or_else(|| {
            ShardError::Config(format!("sharding item parameter '{}' is not item=value", pair))
        })?;
        let item: u32 = item.trim().parse().map_err(|_| {
            ShardError::Config(format!("sharding item '{}' is not a non-negative integer", item))
        })?;
        if parameters.insert(item, value.trim().to_string()).is_some() {
            return Err(ShardError::Config(format!(
                "sharding item {} has more than one parameter",
                item
            )));
        }
    }
    Ok(parameters)
}

/// Connection-level settings shared by every job on one registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Root node under which every job tree lives. Empty for none.
    pub namespace: String,
    /// Attempts for calls failing with a transient connection error.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// How long a follower waits for a leader to appear before giving up on
    /// a resharding pass.
    pub election_wait_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "shardbeat".to_string(),
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            election_wait_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}
