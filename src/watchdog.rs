//! Single-shot timer bounding an open check cycle.
//!
//! The update service's event stream is long-lived and may stop emitting
//! terminal events. Without a bound, a stalled cycle would keep the source's
//! "one open cycle" slot forever and every later trigger would be coalesced
//! into nothing.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound on an update check/apply cycle. `watchdog_timeout_secs`
/// in the config overrides it.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Cancellable single-shot timer.
#[derive(Debug, Default)]
pub struct UpdateWatchdog {
    armed: Option<CancellationToken>,
}

impl UpdateWatchdog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer. `on_timeout` runs once if the timer is not disarmed
    /// within `duration`. Re-arming replaces the previous timer.
    pub fn arm<F>(&mut self, duration: Duration, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.disarm();

        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => {
                    debug!("watchdog disarmed");
                }
                () = tokio::time::sleep(duration) => {
                    guard.cancel();
                    on_timeout.await;
                }
            }
        });
        self.armed = Some(token);
    }

    /// Cancel the timer. Safe to call repeatedly or when never armed.
    pub fn disarm(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }

    /// `true` while a timer is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.as_ref().is_some_and(|token| !token.is_cancelled())
    }
}

impl Drop for UpdateWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}
