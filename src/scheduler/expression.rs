//! Cron expressions accepted by the scheduler.
//!
//! Classic five-field expressions (`min hour dom mon dow`) are extended with
//! a leading `0` seconds field, the form the `cron` crate parses. Six and
//! seven-field expressions are used unchanged.

use crate::error::{Result, UpdateError};
use chrono::{DateTime, Local};
use std::str::FromStr;

/// A parsed, schedulable cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    /// Parse `expression`, accepting five, six or seven fields.
    pub fn parse(expression: &str) -> Result<Self> {
        let source = expression.trim();
        let normalized = normalize(source);
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| UpdateError::Schedule(format!("invalid cron expression {source:?}: {e}")))?;
        Ok(Self {
            source: source.to_owned(),
            schedule,
        })
    }

    /// The expression as configured.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching instant strictly after `after`, in local time.
    #[must_use]
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(after).next()
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn normalize(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    }
}
