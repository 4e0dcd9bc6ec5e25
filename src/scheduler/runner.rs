//! Recurring trigger bound to the configured cron expression.
//!
//! At most one [`ScheduleBinding`] is active. Binding a new expression
//! always stops the previous binding first, so an invalid expression leaves
//! the scheduler unbound instead of keeping stale behavior.

use crate::config::ConfigStore;
use crate::coordinator::UpdateCoordinator;
use crate::scheduler::expression::CronExpression;
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whatever a schedule instant triggers.
#[async_trait]
pub trait ScheduleTarget: Send + Sync + 'static {
    async fn fire(&self);
}

#[async_trait]
impl ScheduleTarget for UpdateCoordinator {
    async fn fire(&self) {
        let outcome = self.check_for_updates().await;
        debug!(?outcome, "scheduled update check");
    }
}

/// The active recurring trigger. Dropping it stops the trigger.
struct ScheduleBinding {
    expression: CronExpression,
    cancel: CancellationToken,
}

impl Drop for ScheduleBinding {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the recurring update-check trigger.
pub struct Scheduler {
    target: Arc<dyn ScheduleTarget>,
    binding: Mutex<Option<ScheduleBinding>>,
}

impl Scheduler {
    pub fn new(target: Arc<dyn ScheduleTarget>) -> Self {
        Self {
            target,
            binding: Mutex::new(None),
        }
    }

    /// Replace the current binding with one for `expression`.
    ///
    /// Returns `true` when a new binding is active. An empty expression
    /// disables scheduling; an invalid one is logged. Either way any
    /// previous binding has been stopped.
    pub async fn bind(&self, expression: &str) -> bool {
        let mut binding = self.binding.lock().await;
        if let Some(previous) = binding.take() {
            info!(expression = %previous.expression, "schedule stopped");
        }

        if expression.trim().is_empty() {
            info!("no cron expression configured, scheduled checks disabled");
            return false;
        }
        let expression = match CronExpression::parse(expression) {
            Ok(expression) => expression,
            Err(e) => {
                warn!(error = %e, "cannot schedule update checks");
                return false;
            }
        };

        let cancel = CancellationToken::new();
        tokio::spawn(run(
            expression.clone(),
            Arc::clone(&self.target),
            cancel.clone(),
        ));
        info!(%expression, "scheduled update checks");
        *binding = Some(ScheduleBinding { expression, cancel });
        true
    }

    /// Stop and clear the current binding.
    pub async fn unbind(&self) {
        if let Some(previous) = self.binding.lock().await.take() {
            info!(expression = %previous.expression, "schedule stopped");
        }
    }

    pub async fn is_bound(&self) -> bool {
        self.binding.lock().await.is_some()
    }

    /// Expression of the active binding.
    pub async fn expression(&self) -> Option<String> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|binding| binding.expression.as_str().to_owned())
    }

    /// Bind the configured expression now, then rebind whenever the
    /// configured cron expression changes.
    pub async fn watch_config(self: &Arc<Self>, store: ConfigStore) -> JoinHandle<()> {
        let mut rx = store.subscribe();
        let mut current = rx.borrow_and_update().cron.clone();
        self.bind(&current).await;

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let cron = rx.borrow_and_update().cron.clone();
                if cron != current {
                    info!(from = %current, to = %cron, "cron expression changed");
                    scheduler.bind(&cron).await;
                    current = cron;
                }
            }
            debug!("config store closed, schedule watcher exiting");
        })
    }
}

async fn run(expression: CronExpression, target: Arc<dyn ScheduleTarget>, cancel: CancellationToken) {
    let mut last = Local::now();
    loop {
        let now = Local::now();
        let Some(next) = expression.next_after(&last.max(now)) else {
            info!(%expression, "schedule has no further instants");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(%next, ?wait, "next scheduled update check");

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }
        info!(%expression, "scheduled update check due");
        target.fire().await;
        last = next;
    }
}
