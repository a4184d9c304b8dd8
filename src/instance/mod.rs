//! Live job instances and the servers they run on.
//!
//! An instance is one running process of a job, backed by an ephemeral node
//! that vanishes with its session. A server is a host, backed by a
//! persistent node carrying an operator enable/disable flag. Only instances
//! on enabled servers are eligible for shard items.

pub mod registry;
pub mod server;

use std::fmt;
use std::net::UdpSocket;

use serde::{Deserialize, Serialize};

pub use registry::InstanceRegistry;
pub use server::{Server, ServerStatus};

/// Separates host ip from the process discriminator in an instance id.
pub const DELIMITER: &str = "@-@";

/// Identity of one running process: `{ip}@-@{discriminator}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(ip: &str, discriminator: impl fmt::Display) -> Self {
        Self(format!("{}{}{}", ip, DELIMITER, discriminator))
    }

    /// Id of the current process on `ip`.
    pub fn for_process(ip: &str) -> Self {
        Self::new(ip, std::process::id())
    }

    /// Parse a stored id; `None` unless it has the `ip@-@x` shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let (ip, rest) = raw.split_once(DELIMITER)?;
        if ip.is_empty() || rest.is_empty() || raw.contains('/') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn ip(&self) -> &str {
        self.0.split(DELIMITER).next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A process of a given job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub job_name: String,
    pub instance_id: InstanceId,
}

/// Best-effort address of the interface used for outbound traffic.
pub fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not determine local ip, using loopback");
            "127.0.0.1".to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_shape() {
        let id = InstanceId::new("10.0.0.5", 4242);
        assert_eq!(id.as_str(), "10.0.0.5@-@4242");
        assert_eq!(id.ip(), "10.0.0.5");
        assert_eq!(InstanceId::parse("10.0.0.5@-@4242"), Some(id));
    }

    #[test]
    fn malformed_ids_do_not_parse() {
        assert!(InstanceId::parse("10.0.0.5").is_none());
        assert!(InstanceId::parse("@-@1").is_none());
        assert!(InstanceId::parse("10.0.0.5@-@").is_none());
        assert!(InstanceId::parse("a/b@-@1").is_none());
    }

    #[test]
    fn ids_order_as_strings() {
        let mut ids = vec![
            InstanceId::new("10.0.0.2", 1),
            InstanceId::new("10.0.0.10", 1),
            InstanceId::new("10.0.0.1", 9),
        ];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(InstanceId::as_str).collect();
        assert_eq!(ordered, vec!["10.0.0.1@-@9", "10.0.0.10@-@1", "10.0.0.2@-@1"]);
    }

    #[test]
    fn process_id_is_discriminator() {
        let id = InstanceId::for_process("127.0.0.1");
        assert_eq!(id.as_str(), format!("127.0.0.1@-@{}", std::process::id()));
    }
}
