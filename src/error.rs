use thiserror::Error;

use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Invalid job configuration: {0}")]
    Config(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Unknown sharding strategy: {0}")]
    UnknownStrategy(String),

    #[error("Job not registered: {0}")]
    JobNotFound(String),

    #[error("Server not registered: {0}")]
    ServerNotFound(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardError {
    /// True for errors that can only be fixed by changing the job definition.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ShardError::Config(_) | ShardError::InvalidCron { .. } | ShardError::UnknownStrategy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShardError>;
