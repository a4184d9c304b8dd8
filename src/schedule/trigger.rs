use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::config::Schedule;
use crate::error::{Result, ShardError};

/// A [`Schedule`] ready to answer "when next".
#[derive(Debug, Clone)]
pub enum CompiledSchedule {
    Cron(Box<cron::Schedule>),
    Interval(chrono::Duration),
}

impl CompiledSchedule {
    pub fn compile(schedule: &Schedule) -> Result<Self> {
        match schedule {
            Schedule::Cron { expr } => cron::Schedule::from_str(expr)
                .map(|s| CompiledSchedule::Cron(Box::new(s)))
                .map_err(|e| ShardError::InvalidCron {
                    expr: expr.clone(),
                    reason: e.to_string(),
                }),
            Schedule::Interval { interval_ms } => {
                if *interval_ms == 0 {
                    return Err(ShardError::Config("interval_ms must be positive".to_string()));
                }
                let millis = i64::try_from(*interval_ms)
                    .map_err(|_| ShardError::Config(format!("interval_ms {} too large", interval_ms)))?;
                Ok(CompiledSchedule::Interval(chrono::Duration::milliseconds(millis)))
            }
        }
    }

    /// First fire time strictly after `after`; `None` when a cron
    /// expression has no future occurrence.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CompiledSchedule::Cron(schedule) => schedule.after(&after).next(),
            CompiledSchedule::Interval(every) => Some(after + *every),
        }
    }
}
