//! Update orchestration: scheduled checks, readiness gating and restart
//! arbitration for a loader self-updater and a platform updater.
//!
//! # Architecture
//!
//! - **Scheduler**: fires at each instant of the configured cron expression
//! - **UpdateCoordinator**: one check → apply → restart state machine per source
//! - **UpdateWatchdog**: bounds every open check cycle
//! - **RestartArbiter**: merges both sources' restart needs into one decision
//! - **ReadinessGate**: foreground-session and battery policy
//!
//! The platform update service, foreground session and restart actions are
//! provided by the host shell through [`host`].

pub mod arbiter;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod loader;
pub mod package_manager;
pub mod power;
pub mod readiness;
pub mod scheduler;
pub mod service;
pub mod watchdog;


pub use arbiter::{RestartArbiter, RestartDecision, UpdateSource, UpdateStatus};
pub use config::{ConfigStore, OsUpdateHandler, UpdateConfig};
pub use coordinator::{CyclePhase, TriggerOutcome, UpdateCoordinator};
pub use error::{Result, UpdateError};
pub use package_manager::UpdateResult;
pub use readiness::{Readiness, ReadinessGate};
pub use scheduler::Scheduler;
pub use watchdog::UpdateWatchdog;
