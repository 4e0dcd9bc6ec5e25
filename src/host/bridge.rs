//! Daemon-side proxy for everything the host shell provides.
//!
//! The host owns the platform update service, knows whether a foreground
//! session is running, and performs restarts. [`HostBridge`] exposes those
//! as [`UpdateService`], [`SessionMonitor`] and [`RestartActions`]. Outgoing
//! calls are [`EventEnvelope`]s; each waits for the matching `call.result`.

use crate::arbiter::RestartActions;
use crate::error::{Result, UpdateError};
use crate::host::contract::{CallResult, EventEnvelope, HostCall};
use crate::readiness::SessionMonitor;
use crate::service::{StateSubscription, UpdateService};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// How long a host call may stay unanswered.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 128;
const STATE_CAPACITY: usize = 64;

struct Inner {
    outgoing: broadcast::Sender<EventEnvelope>,
    state_tx: broadcast::Sender<serde_json::Value>,
    foreground: watch::Sender<bool>,
    pending: Mutex<HashMap<String, oneshot::Sender<CallResult>>>,
    call_timeout: Duration,
}

/// Cheap to clone; all clones share one connection state.
#[derive(Clone)]
pub struct HostBridge {
    inner: Arc<Inner>,
}

impl HostBridge {
    #[must_use]
    pub fn new(call_timeout: Duration) -> Self {
        let (outgoing, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = broadcast::channel(STATE_CAPACITY);
        let (foreground, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                outgoing,
                state_tx,
                foreground,
                pending: Mutex::new(HashMap::new()),
                call_timeout,
            }),
        }
    }

    /// Events to forward to the host.
    #[must_use]
    pub fn subscribe_outgoing(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.outgoing.subscribe()
    }

    /// Deliver an update-state payload pushed by the host. Returns the number
    /// of live subscriptions that received it.
    pub fn publish_state(&self, payload: serde_json::Value) -> usize {
        self.inner.state_tx.send(payload).unwrap_or(0)
    }

    /// Record the host's foreground-session flag. Returns `true` on change.
    pub fn set_foreground(&self, active: bool) -> bool {
        let changed = self.inner.foreground.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
        if changed {
            info!(active, "foreground session changed");
        }
        changed
    }

    #[must_use]
    pub fn foreground_active(&self) -> bool {
        *self.inner.foreground.borrow()
    }

    /// Complete a pending call. Returns `false` for unknown or expired ids.
    pub async fn resolve_call(&self, result: CallResult) -> bool {
        let Some(tx) = self.inner.pending.lock().await.remove(&result.call_id) else {
            warn!(call_id = %result.call_id, "result for unknown host call");
            return false;
        };
        tx.send(result).is_ok()
    }

    /// Send a call to the host and wait for its result.
    pub async fn call(&self, call: HostCall, payload: serde_json::Value) -> Result<serde_json::Value> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(call_id.clone(), tx);

        let envelope = EventEnvelope::new(call_id.clone(), call.as_str(), payload);
        if self.inner.outgoing.send(envelope).is_err() {
            self.inner.pending.lock().await.remove(&call_id);
            return Err(UpdateError::Channel(format!(
                "no host connected for {}",
                call.as_str()
            )));
        }
        debug!(call = call.as_str(), %call_id, "host call sent");

        let result = match tokio::time::timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                return Err(UpdateError::Channel(format!(
                    "host call {} dropped",
                    call.as_str()
                )));
            }
            Err(_) => {
                self.inner.pending.lock().await.remove(&call_id);
                return Err(UpdateError::Channel(format!(
                    "host call {} timed out after {:?}",
                    call.as_str(),
                    self.inner.call_timeout
                )));
            }
        };

        if result.ok {
            Ok(result.payload)
        } else {
            Err(UpdateError::Service(format!(
                "{} rejected: {}",
                call.as_str(),
                result.error.as_deref().unwrap_or("no reason given")
            )))
        }
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

#[async_trait]
impl UpdateService for HostBridge {
    async fn start_check(&self) -> Result<()> {
        self.call(HostCall::StartCheck, serde_json::json!({}))
            .await
            .map(|_| ())
    }

    async fn apply_updates(&self, selector: &str) -> Result<()> {
        self.call(
            HostCall::ApplyUpdates,
            serde_json::json!({ "selector": selector }),
        )
        .await
        .map(|_| ())
    }

    fn subscribe_state_changes(&self) -> StateSubscription {
        StateSubscription::new(self.inner.state_tx.subscribe())
    }
}

#[async_trait]
impl SessionMonitor for HostBridge {
    async fn is_foreground_session_active(&self) -> Result<bool> {
        Ok(self.foreground_active())
    }
}

#[async_trait]
impl RestartActions for HostBridge {
    async fn restart_system(&self) -> Result<()> {
        self.call(HostCall::RestartSystem, serde_json::json!({}))
            .await
            .map(|_| ())
            .map_err(|e| UpdateError::Restart(e.to_string()))
    }

    async fn restart_application(&self) -> Result<()> {
        self.call(HostCall::RestartClient, serde_json::json!({}))
            .await
            .map(|_| ())
            .map_err(|e| UpdateError::Restart(e.to_string()))
    }
}
