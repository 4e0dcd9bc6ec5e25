//! Periodic update checks.
//!
//! The [`Scheduler`] fires the coordinator at every instant matching the
//! configured cron expression and rebinds when the expression changes.

pub mod expression;
pub mod runner;

pub use expression::CronExpression;
pub use runner::{ScheduleTarget, Scheduler};
