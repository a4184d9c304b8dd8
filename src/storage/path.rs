//! Node layout of one job's subtree.
//!
//! ```text
//! /{namespace}/{job}
//!   config                          job definition (JSON)
//!   servers/{ip}                    "" enabled, "DISABLED" disabled
//!   instances/{instanceId}          ephemeral, one per live process
//!   sharding/needReshard            flag
//!   sharding/processing             ephemeral, leader id while a pass runs
//!   sharding/{item}/instance        owner of item
//!   leader/election/instance        ephemeral, leader id
//!   leader/failover/items/{item}    queued failover entry
//!   execution/{item}/running        ephemeral, owner id
//!   execution/{item}/misfire
//!   execution/{item}/failover       ephemeral, claimer of a failover entry
//!   execution/{item}/lastBeginTime
//!   execution/{item}/lastCompleteTime
//!   execution/{item}/failed
//!   trigger/{instanceId}            ephemeral "run now" request
//! ```

pub const CONFIG: &str = "config";
pub const SERVERS: &str = "servers";
pub const INSTANCES: &str = "instances";
pub const SHARDING: &str = "sharding";
pub const NEED_RESHARD: &str = "sharding/needReshard";
pub const RESHARD_PROCESSING: &str = "sharding/processing";
pub const LEADER_ELECTION: &str = "leader/election/instance";
pub const FAILOVER_ITEMS: &str = "leader/failover/items";
pub const EXECUTION: &str = "execution";
pub const TRIGGER: &str = "trigger";

pub fn server(ip: &str) -> String {
    format!("{}/{}", SERVERS, ip)
}

pub fn instance(instance_id: &str) -> String {
    format!("{}/{}", INSTANCES, instance_id)
}

pub fn sharding_item(item: u32) -> String {
    format!("{}/{}", SHARDING, item)
}

pub fn sharding_instance(item: u32) -> String {
    format!("{}/{}/instance", SHARDING, item)
}

pub fn failover_item(item: u32) -> String {
    format!("{}/{}", FAILOVER_ITEMS, item)
}

pub fn running(item: u32) -> String {
    format!("{}/{}/running", EXECUTION, item)
}

pub fn misfire(item: u32) -> String {
    format!("{}/{}/misfire", EXECUTION, item)
}

pub fn failover_claim(item: u32) -> String {
    format!("{}/{}/failover", EXECUTION, item)
}

pub fn last_begin_time(item: u32) -> String {
    format!("{}/{}/lastBeginTime", EXECUTION, item)
}

pub fn last_complete_time(item: u32) -> String {
    format!("{}/{}/lastCompleteTime", EXECUTION, item)
}

pub fn failed(item: u32) -> String {
    format!("{}/{}/failed", EXECUTION, item)
}

pub fn trigger(instance_id: &str) -> String {
    format!("{}/{}", TRIGGER, instance_id)
}

/// Parse a child name of `sharding/`, `execution/` or the failover queue.
pub fn parse_item(name: &str) -> Option<u32> {
    name.parse().ok()
}

/// Absolute paths for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
    job_name: String,
    root: String,
}

impl JobNodePath {
    pub fn new(namespace: &str, job_name: &str) -> Self {
        let namespace = namespace.trim_matches('/');
        let root = if namespace.is_empty() {
            format!("/{}", job_name)
        } else {
            format!("/{}/{}", namespace, job_name)
        };
        Self {
            job_name: job_name.to_string(),
            root,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Absolute path of a node relative to the job root.
    pub fn full_path(&self, node: &str) -> String {
        format!("{}/{}", self.root, node)
    }

    /// Inverse of [`full_path`](Self::full_path); `None` outside this job.
    pub fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.root.as_str())?.strip_prefix('/')
    }
}
