//! Shared fakes and harness for integration tests.

use async_trait::async_trait;
use auto_update::arbiter::{RestartActions, RestartArbiter};
use auto_update::config::{ConfigStore, OsUpdateHandler, UpdateConfig};
use auto_update::coordinator::UpdateCoordinator;
use auto_update::error::{Result, UpdateError};
use auto_update::loader::LoaderUpdater;
use auto_update::package_manager::{PackageManager, UpdateResult};
use auto_update::readiness::{PowerSensor, ReadinessGate, SessionMonitor};
use auto_update::service::{StateSubscription, UpdateService};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

/// Platform update service that records calls and lets tests push events.
pub(crate) struct FakeService {
    events: broadcast::Sender<serde_json::Value>,
    start_checks: AtomicUsize,
    selectors: Mutex<Vec<String>>,
    fail_start: AtomicBool,
    fail_apply: AtomicBool,
}

impl FakeService {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            events,
            start_checks: AtomicUsize::new(0),
            selectors: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
        }
    }

    pub(crate) fn emit(&self, payload: serde_json::Value) {
        let _ = self.events.send(payload);
    }

    pub(crate) fn start_checks(&self) -> usize {
        self.start_checks.load(Ordering::SeqCst)
    }

    pub(crate) fn selectors(&self) -> Vec<String> {
        self.selectors.lock().unwrap().clone()
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    pub(crate) fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpdateService for FakeService {
    async fn start_check(&self) -> Result<()> {
        self.start_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(UpdateError::Service("check refused".to_owned()));
        }
        Ok(())
    }

    async fn apply_updates(&self, selector: &str) -> Result<()> {
        self.selectors.lock().unwrap().push(selector.to_owned());
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(UpdateError::Service("apply refused".to_owned()));
        }
        Ok(())
    }

    fn subscribe_state_changes(&self) -> StateSubscription {
        StateSubscription::new(self.events.subscribe())
    }
}

pub(crate) struct FakePower {
    level: AtomicU8,
    charging: AtomicBool,
}

impl FakePower {
    pub(crate) fn new(level: u8, charging: bool) -> Self {
        Self {
            level: AtomicU8::new(level),
            charging: AtomicBool::new(charging),
        }
    }

    pub(crate) fn set(&self, level: u8, charging: bool) {
        self.level.store(level, Ordering::SeqCst);
        self.charging.store(charging, Ordering::SeqCst);
    }
}

#[async_trait]
impl PowerSensor for FakePower {
    async fn battery_level(&self) -> Result<u8> {
        Ok(self.level.load(Ordering::SeqCst))
    }

    async fn is_charging(&self) -> Result<bool> {
        Ok(self.charging.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub(crate) struct FakeSession(AtomicBool);

impl FakeSession {
    pub(crate) fn set_active(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionMonitor for FakeSession {
    async fn is_foreground_session_active(&self) -> Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub(crate) struct FakeRestarts {
    system: AtomicUsize,
    application: AtomicUsize,
}

impl FakeRestarts {
    pub(crate) fn system(&self) -> usize {
        self.system.load(Ordering::SeqCst)
    }

    pub(crate) fn application(&self) -> usize {
        self.application.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestartActions for FakeRestarts {
    async fn restart_system(&self) -> Result<()> {
        self.system.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_application(&self) -> Result<()> {
        self.application.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Loader updater returning a preset result, optionally held until released.
pub(crate) struct FakeLoader {
    result: Mutex<UpdateResult>,
    hold: AtomicBool,
    release: Notify,
    calls: AtomicUsize,
}

impl FakeLoader {
    pub(crate) fn set_result(&self, result: UpdateResult) {
        *self.result.lock().unwrap() = result;
    }

    /// Make the next runs wait for [`FakeLoader::release`].
    pub(crate) fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoaderUpdater for FakeLoader {
    async fn update(&self) -> UpdateResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let released = self.release.notified();
        if self.hold.load(Ordering::SeqCst) {
            released.await;
        }
        *self.result.lock().unwrap()
    }
}

pub(crate) struct FakePackageManager {
    result: Mutex<UpdateResult>,
    runs: AtomicUsize,
}

impl FakePackageManager {
    pub(crate) fn set_result(&self, result: UpdateResult) {
        *self.result.lock().unwrap() = result;
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn run_update(&self) -> UpdateResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.result.lock().unwrap()
    }
}

/// Fully wired coordinator over fakes. Ready by default: no foreground
/// session, full battery, charging.
pub(crate) struct Harness {
    pub(crate) service: Arc<FakeService>,
    pub(crate) power: Arc<FakePower>,
    pub(crate) session: Arc<FakeSession>,
    pub(crate) restarts: Arc<FakeRestarts>,
    pub(crate) loader: Arc<FakeLoader>,
    pub(crate) package_manager: Arc<FakePackageManager>,
    pub(crate) config: ConfigStore,
    pub(crate) arbiter: Arc<RestartArbiter>,
    pub(crate) coordinator: UpdateCoordinator,
}

pub(crate) fn harness() -> Harness {
    harness_with(UpdateConfig::default())
}

pub(crate) fn harness_with(config: UpdateConfig) -> Harness {
    let service = Arc::new(FakeService::new());
    let power = Arc::new(FakePower::new(100, true));
    let session = Arc::new(FakeSession::default());
    let restarts = Arc::new(FakeRestarts::default());
    let loader = Arc::new(FakeLoader {
        result: Mutex::new(UpdateResult::NotUpdated),
        hold: AtomicBool::new(false),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let package_manager = Arc::new(FakePackageManager {
        result: Mutex::new(UpdateResult::Updated),
        runs: AtomicUsize::new(0),
    });
    let config = ConfigStore::in_memory(config);

    let gate = ReadinessGate::new(power.clone(), session.clone(), config.clone());
    let arbiter = Arc::new(RestartArbiter::new(gate.clone(), restarts.clone()));
    let coordinator = UpdateCoordinator::new(
        arbiter.clone(),
        gate,
        config.clone(),
        service.clone(),
        loader.clone(),
        package_manager.clone(),
    );

    Harness {
        service,
        power,
        session,
        restarts,
        loader,
        package_manager,
        config,
        arbiter,
        coordinator,
    }
}

/// Config selecting the package-manager OS update path.
pub(crate) fn package_manager_config() -> UpdateConfig {
    UpdateConfig {
        os_update_handler: OsUpdateHandler::PackageManager,
        ..UpdateConfig::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// Let spawned tasks run without waiting for a specific condition.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
