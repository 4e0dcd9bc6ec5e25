//! Restart arbitration between the loader and platform update pipelines.
//!
//! Both pipelines progress independently and can each demand a restart. The
//! [`RestartArbiter`] owns the per-source [`UpdateStatus`] map, derives one
//! combined [`RestartDecision`] from it (OS restart outranks client restart),
//! and is the only component that ever performs a restart.
//!
//! # Write rules
//!
//! While a source has a restart pending, writes that would lower its restart
//! severity are ignored. A late `UP_TO_DATE` from a stale event therefore
//! cannot erase a real pending restart. The only way back to `UP_TO_DATE` is
//! [`RestartArbiter::reset_after_restart`], issued after a restart action has
//! actually been carried out.
//!
//! Open check cycles are recorded separately and hold every restart back
//! until they close, whatever the source's status.

use crate::error::Result;
use crate::readiness::{Readiness, ReadinessGate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Which update pipeline a status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// The loader's self-update pipeline.
    Loader,
    /// The host platform's update pipeline.
    Platform,
}

impl UpdateSource {
    pub const ALL: [Self; 2] = [Self::Loader, Self::Platform];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loader => "loader",
            Self::Platform => "platform",
        }
    }
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Update status of one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    #[default]
    UpToDate,
    InProgress,
    OsRestartRequired,
    ClientRestartRequired,
}

impl UpdateStatus {
    /// Restart severity: 0 for no restart, 1 for client, 2 for OS.
    #[must_use]
    pub fn restart_severity(self) -> u8 {
        match self {
            Self::UpToDate | Self::InProgress => 0,
            Self::ClientRestartRequired => 1,
            Self::OsRestartRequired => 2,
        }
    }

    #[must_use]
    pub fn is_restart_pending(self) -> bool {
        self.restart_severity() > 0
    }

    fn decision(self) -> RestartDecision {
        match self {
            Self::OsRestartRequired => RestartDecision::RestartOs,
            Self::ClientRestartRequired => RestartDecision::RestartClient,
            Self::UpToDate | Self::InProgress => RestartDecision::NoAction,
        }
    }
}

/// Combined restart decision, ordered by precedence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RestartDecision {
    #[default]
    NoAction,
    RestartClient,
    RestartOs,
}

impl std::fmt::Display for RestartDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAction => f.write_str("no action"),
            Self::RestartClient => f.write_str("restart client"),
            Self::RestartOs => f.write_str("restart OS"),
        }
    }
}

/// Restart actions performed by the arbiter.
#[async_trait]
pub trait RestartActions: Send + Sync {
    /// Full power cycle of the device.
    async fn restart_system(&self) -> Result<()>;
    /// Application-level restart.
    async fn restart_application(&self) -> Result<()>;
}

/// Per-source status map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationState {
    pub loader: UpdateStatus,
    pub platform: UpdateStatus,
}

impl ArbitrationState {
    #[must_use]
    pub fn get(&self, source: UpdateSource) -> UpdateStatus {
        match source {
            UpdateSource::Loader => self.loader,
            UpdateSource::Platform => self.platform,
        }
    }

    fn slot(&mut self, source: UpdateSource) -> &mut UpdateStatus {
        match source {
            UpdateSource::Loader => &mut self.loader,
            UpdateSource::Platform => &mut self.platform,
        }
    }

    /// Apply a write under the severity rule. Returns `false` when ignored.
    fn write(&mut self, source: UpdateSource, status: UpdateStatus) -> bool {
        let slot = self.slot(source);
        if slot.is_restart_pending() && status.restart_severity() < slot.restart_severity() {
            return false;
        }
        *slot = status;
        true
    }

    /// Combined decision: any OS restart wins, then any client restart.
    #[must_use]
    pub fn decision(&self) -> RestartDecision {
        self.loader.decision().max(self.platform.decision())
    }

    /// First source still in progress, if any.
    #[must_use]
    pub fn in_progress(&self) -> Option<UpdateSource> {
        UpdateSource::ALL
            .into_iter()
            .find(|source| self.get(*source) == UpdateStatus::InProgress)
    }
}

/// Why an evaluation did not act on a pending decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// The other pipeline is still working.
    InProgress(UpdateSource),
    /// The readiness gate said no.
    NotReady(Readiness),
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Nothing to do (or a progress write that never evaluates).
    NoAction,
    /// A restart is pending but was not acted on.
    Deferred(RestartDecision, DeferReason),
    /// The restart action was issued successfully.
    Performed(RestartDecision),
    /// The restart action failed; the decision stays pending.
    Failed(RestartDecision),
}

impl Evaluation {
    #[must_use]
    pub fn performed(&self) -> bool {
        matches!(self, Self::Performed(_))
    }
}

/// Statuses plus the sources that currently have an open check cycle.
/// Open cycles are not subject to the severity rule.
#[derive(Debug, Default)]
struct Ledger {
    statuses: ArbitrationState,
    open: HashSet<UpdateSource>,
}

impl Ledger {
    fn record(&mut self, source: UpdateSource, status: UpdateStatus) {
        let previous = self.statuses.get(source);
        if self.statuses.write(source, status) {
            debug!(%source, ?previous, ?status, "update status written");
        } else {
            info!(
                %source,
                pending = ?previous,
                ignored = ?status,
                "restart pending, ignoring lower-severity status"
            );
        }
    }

    /// First source that is still updating, if any.
    fn busy(&self) -> Option<UpdateSource> {
        UpdateSource::ALL
            .into_iter()
            .find(|source| self.open.contains(source))
            .or_else(|| self.statuses.in_progress())
    }
}

/// Single owner of the restart decision.
pub struct RestartArbiter {
    state: Mutex<Ledger>,
    gate: ReadinessGate,
    actions: Arc<dyn RestartActions>,
}

impl RestartArbiter {
    pub fn new(gate: ReadinessGate, actions: Arc<dyn RestartActions>) -> Self {
        Self {
            state: Mutex::new(Ledger::default()),
            gate,
            actions,
        }
    }

    /// Record a status for `source`, then re-evaluate unless it is
    /// `IN_PROGRESS`.
    pub async fn set_status(&self, source: UpdateSource, status: UpdateStatus) -> Evaluation {
        self.state.lock().await.record(source, status);
        if status == UpdateStatus::InProgress {
            return Evaluation::NoAction;
        }
        self.evaluate().await
    }

    /// A check cycle for `source` has opened. Restarts wait until it closes,
    /// whatever the recorded status.
    pub async fn open_cycle(&self, source: UpdateSource) {
        let mut state = self.state.lock().await;
        state.open.insert(source);
        state.record(source, UpdateStatus::InProgress);
    }

    /// The cycle for `source` finished with `status`; record it and evaluate.
    pub async fn close_cycle(&self, source: UpdateSource, status: UpdateStatus) -> Evaluation {
        self.state.lock().await.open.remove(&source);
        self.set_status(source, status).await
    }

    /// The cycle for `source` was dropped without a result.
    pub async fn abandon_cycle(&self, source: UpdateSource) {
        self.state.lock().await.open.remove(&source);
    }

    /// Whether `source` has an open check cycle.
    pub async fn cycle_open(&self, source: UpdateSource) -> bool {
        self.state.lock().await.open.contains(&source)
    }

    /// Compute the combined decision and act on it when the system is ready.
    pub async fn evaluate(&self) -> Evaluation {
        let state = self.state.lock().await;
        let decision = state.statuses.decision();
        if decision == RestartDecision::NoAction {
            return Evaluation::NoAction;
        }

        if let Some(source) = state.busy() {
            debug!(%decision, %source, "restart deferred until update finishes");
            return Evaluation::Deferred(decision, DeferReason::InProgress(source));
        }

        let readiness = self.gate.check().await;
        if !readiness.is_ready() {
            info!(%decision, %readiness, "restart deferred, system not ready");
            return Evaluation::Deferred(decision, DeferReason::NotReady(readiness));
        }

        let result = match decision {
            RestartDecision::RestartOs => {
                info!("pending system restart, restarting");
                self.actions.restart_system().await
            }
            RestartDecision::RestartClient => {
                info!("pending client restart, restarting");
                self.actions.restart_application().await
            }
            RestartDecision::NoAction => return Evaluation::NoAction,
        };
        drop(state);

        match result {
            Ok(()) => Evaluation::Performed(decision),
            Err(e) => {
                error!(%decision, error = %e, "restart action failed, keeping it pending");
                Evaluation::Failed(decision)
            }
        }
    }

    /// Clear both sources after a restart action has been carried out.
    pub async fn reset_after_restart(&self) {
        self.state.lock().await.statuses = ArbitrationState::default();
        info!("restart carried out, statuses reset");
    }

    pub async fn status(&self, source: UpdateSource) -> UpdateStatus {
        self.state.lock().await.statuses.get(source)
    }

    pub async fn decision(&self) -> RestartDecision {
        self.state.lock().await.statuses.decision()
    }

    pub async fn snapshot(&self) -> ArbitrationState {
        self.state.lock().await.statuses
    }
}
