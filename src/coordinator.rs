//! Check → event → apply → restart workflow, one state machine per source.
//!
//! Every source is either idle or has exactly one open check cycle. A
//! cycle is opened by [`UpdateCoordinator::trigger`], fed by the platform's
//! update-state stream (or the loader updater), bounded by an
//! [`UpdateWatchdog`], and closed by the first terminal transition. All
//! transitions go through [`transition`], a pure `(phase, event)` dispatch.
//!
//! # Locking
//!
//! Cycle bookkeeping lives behind one mutex. Arbiter writes are issued while
//! that mutex is held, so the arbiter lock is always taken second. Remote
//! calls (`start_check`, `apply_updates`, package manager, loader) run with
//! no lock held; their completions are dispatched against the cycle id they
//! started under and are dropped if that cycle has since closed.

use crate::arbiter::{Evaluation, RestartArbiter, UpdateSource, UpdateStatus};
use crate::config::{ConfigStore, OsUpdateHandler};
use crate::loader::LoaderUpdater;
use crate::package_manager::{PackageManager, UpdateResult};
use crate::readiness::{Readiness, ReadinessGate};
use crate::service::{
    StateSubscription, UpdateScope, UpdateSelection, UpdateService, UpdateStateEvent,
    UpdaterState, UpdaterType,
};
use crate::watchdog::UpdateWatchdog;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Phase of one source's state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Checking,
    Applying,
    /// Transient: the restart obligation has been handed to the arbiter and
    /// the cycle is being torn down.
    RestartPending,
}

/// Restart obligation carried by a restart-pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    Os,
    Client,
}

impl RestartKind {
    fn status(self) -> UpdateStatus {
        match self {
            Self::Os => UpdateStatus::OsRestartRequired,
            Self::Client => UpdateStatus::ClientRestartRequired,
        }
    }
}

/// Everything that can happen to an open cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEvent {
    /// `CHECKING` / `APPLYING` progress.
    Progress,
    /// Updates available; never empty.
    Available(Vec<UpdaterType>),
    /// Restart-pending state with matching flags.
    RestartPending(RestartKind),
    /// Restart-pending state whose flags match no policy.
    MismatchedRestart(UpdaterState),
    /// Terminal "nothing to do": up to date, invalid, rollback, unknown,
    /// or available with no valid item.
    NoUpdate(UpdaterState),
    /// Payload that failed to decode.
    Malformed(String),
    /// The event stream ended while the cycle was open.
    StreamClosed,
    /// The remote `start_check` call failed.
    CheckRejected,
    /// The apply call (or package-manager run) failed.
    ApplyRejected,
    /// Readiness lost before an apply.
    NotReady,
    /// The loader updater finished.
    LoaderFinished(UpdateResult),
    /// The watchdog fired.
    TimedOut,
}

impl CycleEvent {
    /// Classify a raw update-state payload.
    #[must_use]
    pub fn classify(payload: &serde_json::Value) -> Self {
        match UpdateStateEvent::from_payload(payload) {
            Ok(event) => Self::from_event(&event),
            Err(e) => Self::Malformed(e.to_string()),
        }
    }

    /// Classify a decoded update-state event.
    #[must_use]
    pub fn from_event(event: &UpdateStateEvent) -> Self {
        match event.state {
            UpdaterState::Checking | UpdaterState::Applying => Self::Progress,
            UpdaterState::Available => {
                let types = event.available_types();
                if types.is_empty() {
                    Self::NoUpdate(UpdaterState::Available)
                } else {
                    Self::Available(types)
                }
            }
            UpdaterState::SystemRestartPending => {
                if event.supports_os_updates && event.requires_system_restart() {
                    Self::RestartPending(RestartKind::Os)
                } else {
                    Self::MismatchedRestart(event.state)
                }
            }
            UpdaterState::ClientRestartPending => {
                if event.requires_client_restart() {
                    Self::RestartPending(RestartKind::Client)
                } else {
                    Self::MismatchedRestart(event.state)
                }
            }
            state @ (UpdaterState::UpToDate
            | UpdaterState::Invalid
            | UpdaterState::Rollback
            | UpdaterState::Unknown) => Self::NoUpdate(state),
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleAction {
    /// Keep the cycle open.
    None,
    /// Start applying the given item types.
    Apply(Vec<UpdaterType>),
    /// Tear the cycle down and write this status to the arbiter.
    Finish(UpdateStatus),
}

/// Result of [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: CyclePhase,
    pub action: CycleAction,
}

impl Transition {
    fn stay(phase: CyclePhase) -> Self {
        Self {
            next: phase,
            action: CycleAction::None,
        }
    }

    fn finish(next: CyclePhase, status: UpdateStatus) -> Self {
        Self {
            next,
            action: CycleAction::Finish(status),
        }
    }
}

/// The state machine of one source.
#[must_use]
pub fn transition(phase: CyclePhase, event: &CycleEvent) -> Transition {
    use CyclePhase::{Applying, Checking, Idle, RestartPending};

    match (phase, event) {
        // Nothing is open: stale deliveries change nothing.
        (Idle | RestartPending, _) => Transition::stay(phase),

        (_, CycleEvent::Progress) => Transition::stay(phase),

        (Checking, CycleEvent::Available(types)) => Transition {
            next: Applying,
            action: CycleAction::Apply(types.clone()),
        },
        (Applying, CycleEvent::Available(_)) => Transition::stay(Applying),

        (Checking | Applying, CycleEvent::RestartPending(kind)) => {
            Transition::finish(RestartPending, kind.status())
        }
        (Checking | Applying, CycleEvent::LoaderFinished(UpdateResult::Updated)) => {
            Transition::finish(RestartPending, UpdateStatus::ClientRestartRequired)
        }

        (
            Checking | Applying,
            CycleEvent::MismatchedRestart(_)
            | CycleEvent::NoUpdate(_)
            | CycleEvent::Malformed(_)
            | CycleEvent::StreamClosed
            | CycleEvent::CheckRejected
            | CycleEvent::ApplyRejected
            | CycleEvent::NotReady
            | CycleEvent::LoaderFinished(UpdateResult::NotUpdated | UpdateResult::Fail)
            | CycleEvent::TimedOut,
        ) => Transition::finish(Idle, UpdateStatus::UpToDate),
    }
}

/// Outcome of a trigger request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new cycle was opened.
    Started,
    /// A cycle was already open; the trigger was coalesced into it.
    AlreadyRunning,
    /// The readiness gate refused.
    NotReady(Readiness),
    /// The cycle opened but the remote check call failed and it was torn down.
    CheckFailed,
    /// The coordinator has been shut down.
    ShutDown,
}

/// Outcome of [`UpdateCoordinator::check_for_updates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub loader: TriggerOutcome,
    pub platform: TriggerOutcome,
}

/// One open check cycle.
struct CheckCycle {
    id: u64,
    phase: CyclePhase,
    cancel: CancellationToken,
    watchdog: UpdateWatchdog,
}

impl CheckCycle {
    /// Unsubscribe and disarm.
    fn close(mut self) {
        self.cancel.cancel();
        self.watchdog.disarm();
    }
}

#[derive(Default)]
struct Cycles {
    loader: Option<CheckCycle>,
    platform: Option<CheckCycle>,
    next_id: u64,
}

impl Cycles {
    fn slot(&mut self, source: UpdateSource) -> &mut Option<CheckCycle> {
        match source {
            UpdateSource::Loader => &mut self.loader,
            UpdateSource::Platform => &mut self.platform,
        }
    }

    fn open(&mut self, source: UpdateSource, id: u64) -> Option<&mut CheckCycle> {
        self.slot(source).as_mut().filter(|cycle| cycle.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    cycles: Mutex<Cycles>,
    arbiter: Arc<RestartArbiter>,
    gate: ReadinessGate,
    config: ConfigStore,
    service: Arc<dyn UpdateService>,
    loader: Arc<dyn LoaderUpdater>,
    package_manager: Arc<dyn PackageManager>,
    shutdown: CancellationToken,
}

/// Drives both update sources. Cheap to clone.
#[derive(Clone)]
pub struct UpdateCoordinator {
    inner: Arc<Inner>,
}

impl UpdateCoordinator {
    pub fn new(
        arbiter: Arc<RestartArbiter>,
        gate: ReadinessGate,
        config: ConfigStore,
        service: Arc<dyn UpdateService>,
        loader: Arc<dyn LoaderUpdater>,
        package_manager: Arc<dyn PackageManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cycles: Mutex::new(Cycles::default()),
                arbiter,
                gate,
                config,
                service,
                loader,
                package_manager,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn arbiter(&self) -> &Arc<RestartArbiter> {
        &self.inner.arbiter
    }

    /// Current phase of `source`.
    pub async fn phase(&self, source: UpdateSource) -> CyclePhase {
        self.inner
            .cycles
            .lock()
            .await
            .slot(source)
            .as_ref()
            .map_or(CyclePhase::Idle, |cycle| cycle.phase)
    }

    /// Trigger the loader source, then the platform source.
    pub async fn check_for_updates(&self) -> CheckOutcome {
        let loader = self.trigger(UpdateSource::Loader).await;
        let platform = self.trigger(UpdateSource::Platform).await;
        CheckOutcome { loader, platform }
    }

    /// Open a check cycle for `source` unless one is already open or the
    /// system is not ready.
    pub async fn trigger(&self, source: UpdateSource) -> TriggerOutcome {
        let mut cycles = self.inner.cycles.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return TriggerOutcome::ShutDown;
        }
        if cycles.slot(source).is_some() {
            info!(%source, "update check already in progress, coalescing trigger");
            return TriggerOutcome::AlreadyRunning;
        }

        let readiness = self.inner.gate.check().await;
        if !readiness.is_ready() {
            info!(%source, %readiness, "update check skipped");
            return TriggerOutcome::NotReady(readiness);
        }

        let id = cycles.allocate_id();
        let cancel = self.inner.shutdown.child_token();
        let mut watchdog = UpdateWatchdog::new();
        let timeout = self.watchdog_timeout();
        let on_timeout = self.clone();
        watchdog.arm(timeout, async move {
            warn!(%source, cycle = id, ?timeout, "update cycle timed out, abandoning it");
            on_timeout.dispatch(source, id, CycleEvent::TimedOut).await;
        });
        *cycles.slot(source) = Some(CheckCycle {
            id,
            phase: CyclePhase::Checking,
            cancel: cancel.clone(),
            watchdog,
        });
        self.inner.arbiter.open_cycle(source).await;
        info!(%source, cycle = id, "update check started");

        match source {
            UpdateSource::Loader => {
                tokio::spawn(self.clone().run_loader(id, cancel));
                TriggerOutcome::Started
            }
            UpdateSource::Platform => {
                let subscription = self.inner.service.subscribe_state_changes();
                tokio::spawn(self.clone().pump(id, subscription, cancel));
                drop(cycles);

                match self.inner.service.start_check().await {
                    Ok(()) => TriggerOutcome::Started,
                    Err(e) => {
                        warn!(%source, error = %e, "update check rejected");
                        self.dispatch(source, id, CycleEvent::CheckRejected).await;
                        TriggerOutcome::CheckFailed
                    }
                }
            }
        }
    }

    /// Re-run the arbiter, e.g. after the foreground session ended.
    pub async fn reevaluate(&self) -> Evaluation {
        let _cycles = self.inner.cycles.lock().await;
        let evaluation = self.inner.arbiter.evaluate().await;
        if evaluation.performed() {
            self.inner.arbiter.reset_after_restart().await;
        }
        evaluation
    }

    /// Close every open cycle without writing statuses. Later triggers are
    /// refused.
    pub async fn shutdown(&self) {
        let mut cycles = self.inner.cycles.lock().await;
        self.inner.shutdown.cancel();
        for source in UpdateSource::ALL {
            if let Some(cycle) = cycles.slot(source).take() {
                debug!(%source, cycle = cycle.id, "closing cycle on shutdown");
                cycle.close();
                self.inner.arbiter.abandon_cycle(source).await;
            }
        }
    }

    fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.config.snapshot().watchdog_timeout_secs)
    }

    /// Feed one event to the cycle `id` of `source`.
    ///
    /// Boxed: `apply` is spawned from here and dispatches back into it.
    fn dispatch(&self, source: UpdateSource, id: u64, event: CycleEvent) -> BoxFuture<'_> {
        Box::pin(async move {
            let mut cycles = self.inner.cycles.lock().await;
            let Some(cycle) = cycles.open(source, id) else {
                debug!(%source, cycle = id, ?event, "event for closed cycle ignored");
                return;
            };
            let from = cycle.phase;
            let Transition { next, action } = transition(from, &event);
            log_event(source, id, &event);

            match action {
                CycleAction::None => {
                    cycle.phase = next;
                }
                CycleAction::Apply(types) => {
                    cycle.phase = next;
                    debug!(%source, cycle = id, ?from, ?next, "phase changed");
                    tokio::spawn(self.clone().apply(source, id, types));
                }
                CycleAction::Finish(status) => {
                    if let Some(cycle) = cycles.slot(source).take() {
                        cycle.close();
                    }
                    info!(%source, cycle = id, ?from, ?next, ?status, "update cycle closed");
                    let evaluation = self.inner.arbiter.close_cycle(source, status).await;
                    if evaluation.performed() {
                        self.inner.arbiter.reset_after_restart().await;
                    }
                }
            }
        })
    }

    /// Forward update-state events to the platform cycle until it closes.
    async fn pump(self, id: u64, mut subscription: StateSubscription, cancel: CancellationToken) {
        loop {
            let payload = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                payload = subscription.next() => payload,
            };
            let Some(payload) = payload else {
                warn!(cycle = id, "update-state stream closed");
                self.dispatch(UpdateSource::Platform, id, CycleEvent::StreamClosed)
                    .await;
                break;
            };
            self.dispatch(UpdateSource::Platform, id, CycleEvent::classify(&payload))
                .await;
        }
        debug!(cycle = id, "unsubscribed from update-state events");
    }

    async fn run_loader(self, id: u64, cancel: CancellationToken) {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = self.inner.loader.update() => result,
        };
        info!(cycle = id, %result, "loader update finished");
        self.dispatch(UpdateSource::Loader, id, CycleEvent::LoaderFinished(result))
            .await;
    }

    async fn apply(self, source: UpdateSource, id: u64, types: Vec<UpdaterType>) {
        let Some(selection) = UpdateSelection::from_available(&types) else {
            self.dispatch(source, id, CycleEvent::NoUpdate(UpdaterState::Available))
                .await;
            return;
        };

        let readiness = self.inner.gate.check().await;
        if !readiness.is_ready() {
            info!(%source, %readiness, "not ready to apply, abandoning cycle");
            self.dispatch(source, id, CycleEvent::NotReady).await;
            return;
        }

        if selection.scope == UpdateScope::Os
            && self.inner.config.os_update_handler() == OsUpdateHandler::PackageManager
        {
            info!(%source, types = ?selection.types, "applying OS update through package manager");
            let event = match self.inner.package_manager.run_update().await {
                UpdateResult::Updated => {
                    CycleEvent::from_event(&UpdateStateEvent::system_restart_pending())
                }
                UpdateResult::NotUpdated => CycleEvent::NoUpdate(UpdaterState::UpToDate),
                UpdateResult::Fail => CycleEvent::ApplyRejected,
            };
            self.dispatch(source, id, event).await;
            return;
        }

        let selector = selection.selector();
        info!(%source, scope = ?selection.scope, types = ?selection.types, %selector, "applying updates");
        if let Err(e) = self.inner.service.apply_updates(&selector).await {
            warn!(%source, error = %e, "apply call rejected");
            self.dispatch(source, id, CycleEvent::ApplyRejected).await;
        }
    }
}

fn log_event(source: UpdateSource, id: u64, event: &CycleEvent) {
    match event {
        CycleEvent::Progress => debug!(%source, cycle = id, "update in progress"),
        CycleEvent::Available(types) => info!(%source, cycle = id, ?types, "updates available"),
        CycleEvent::RestartPending(kind) => {
            info!(%source, cycle = id, ?kind, "update applied, restart required");
        }
        CycleEvent::MismatchedRestart(state) => error!(
            %source,
            cycle = id,
            ?state,
            "restart-pending event with unexpected flags, resetting"
        ),
        CycleEvent::NoUpdate(state) => info!(%source, cycle = id, ?state, "no update"),
        CycleEvent::Malformed(reason) => {
            warn!(%source, cycle = id, %reason, "malformed update event, abandoning cycle");
        }
        CycleEvent::StreamClosed
        | CycleEvent::CheckRejected
        | CycleEvent::ApplyRejected
        | CycleEvent::NotReady
        | CycleEvent::TimedOut => debug!(%source, cycle = id, ?event, "cycle aborted"),
        CycleEvent::LoaderFinished(UpdateResult::Fail) => {
            warn!(%source, cycle = id, "loader update failed");
        }
        CycleEvent::LoaderFinished(_) => {}
    }
}
