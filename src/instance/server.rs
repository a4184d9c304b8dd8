use serde::{Deserialize, Serialize};

const DISABLED: &str = "DISABLED";

/// Operator flag stored in `servers/{ip}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Enabled,
    Disabled,
}

impl ServerStatus {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            ServerStatus::Enabled
        } else {
            ServerStatus::Disabled
        }
    }

    /// Node data for this status.
    pub fn as_data(self) -> &'static str {
        match self {
            ServerStatus::Enabled => "",
            ServerStatus::Disabled => DISABLED,
        }
    }

    /// Anything other than the disabled marker counts as enabled.
    pub fn from_data(data: &str) -> Self {
        if data == DISABLED {
            ServerStatus::Disabled
        } else {
            ServerStatus::Enabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self == ServerStatus::Enabled
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Enabled => write!(f, "enabled"),
            ServerStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// A host registered for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub job_name: String,
    pub ip: String,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_data_mapping() {
        assert_eq!(ServerStatus::Enabled.as_data(), "");
        assert_eq!(ServerStatus::Disabled.as_data(), "DISABLED");
        assert_eq!(ServerStatus::from_data(""), ServerStatus::Enabled);
        assert_eq!(ServerStatus::from_data("DISABLED"), ServerStatus::Disabled);
        assert!(ServerStatus::from_enabled(true).is_enabled());
        assert!(!ServerStatus::from_enabled(false).is_enabled());
    }
}
