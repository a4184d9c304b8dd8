use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// What a job body gets to know about the item it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingContext {
    pub job_name: String,
    pub total_count: u32,
    pub item: u32,
    pub item_parameter: Option<String>,
    pub job_parameter: String,
    /// This run replays an item abandoned by another instance.
    pub is_failover: bool,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type JobResult = std::result::Result<(), JobError>;

/// Body run once per owned shard item per tick.
#[async_trait]
pub trait ShardJob: Send + Sync + 'static {
    async fn execute(&self, ctx: ShardingContext) -> JobResult;
}

/// Runs a shell command for each item, exposing the item through
/// `SHARD_ITEM`, `SHARD_PARAM`, `SHARD_TOTAL`, `JOB_NAME` and `JOB_PARAM`.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    command: String,
}

impl ScriptJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl ShardJob for ScriptJob {
    async fn execute(&self, ctx: ShardingContext) -> JobResult {
        tracing::debug!(job = %ctx.job_name, item = ctx.item, command = %self.command, "Executing script");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("SHARD_ITEM", ctx.item.to_string())
            .env("SHARD_PARAM", ctx.item_parameter.as_deref().unwrap_or(""))
            .env("SHARD_TOTAL", ctx.total_count.to_string())
            .env("JOB_NAME", &ctx.job_name)
            .env("JOB_PARAM", &ctx.job_parameter)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::info!(job = %ctx.job_name, item = ctx.item, output = %stdout.trim(), "Script output");
        }
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(JobError::Failed(if stderr.trim().is_empty() {
            format!("exit code: {:?}", output.status.code())
        } else {
            stderr.trim().to_string()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(item: u32) -> ShardingContext {
        ShardingContext {
            job_name: "orders".to_string(),
            total_count: 4,
            item,
            item_parameter: Some("eu".to_string()),
            job_parameter: "full".to_string(),
            is_failover: false,
        }
    }

    #[tokio::test]
    async fn script_sees_shard_environment() {
        let job = ScriptJob::new(
            r#"test "$SHARD_ITEM" = 2 && test "$SHARD_PARAM" = eu && test "$SHARD_TOTAL" = 4 && test "$JOB_NAME" = orders && test "$JOB_PARAM" = full"#,
        );
        job.execute(ctx(2)).await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let job = ScriptJob::new("echo boom >&2; exit 3");
        match job.execute(ctx(0)).await {
            Err(JobError::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
