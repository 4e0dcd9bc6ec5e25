//! Command router for the host shell.

use crate::arbiter::UpdateSource;
use crate::config::{ConfigKey, ConfigStore, ConfigValue};
use crate::coordinator::UpdateCoordinator;
use crate::error::{Result, UpdateError};
use crate::host::bridge::HostBridge;
use crate::host::contract::{CallResult, CommandEnvelope, CommandName, EVENT_VERSION, ResponseEnvelope};
use crate::scheduler::Scheduler;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Routes host commands to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct HostCommandServer {
    bridge: HostBridge,
    coordinator: UpdateCoordinator,
    config: ConfigStore,
    scheduler: Arc<Scheduler>,
    stop: CancellationToken,
}

impl HostCommandServer {
    pub fn new(
        bridge: HostBridge,
        coordinator: UpdateCoordinator,
        config: ConfigStore,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            bridge,
            coordinator,
            config,
            scheduler,
            stop: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    /// Cancelled once `runtime.stop` has been handled.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Validate and route one envelope, always producing a response.
    pub async fn handle(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        if let Err(e) = envelope.validate() {
            return ResponseEnvelope::error(envelope.request_id.clone(), e.to_string());
        }
        match self.route(envelope).await {
            Ok(response) => response,
            Err(e) => {
                debug!(command = envelope.command.as_str(), error = %e, "host command failed");
                ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
            }
        }
    }

    /// Route a command envelope to the appropriate handler.
    pub async fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        match envelope.command {
            CommandName::HostPing => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                json!({"pong": true, "contract_version": EVENT_VERSION}),
            )),
            CommandName::RuntimeStop => {
                info!("runtime.stop received");
                self.stop.cancel();
                Ok(ResponseEnvelope::ok(
                    envelope.request_id.clone(),
                    json!({"stopping": true}),
                ))
            }
            CommandName::UpdatesCheckNow => self.handle_check_now(envelope).await,
            CommandName::UpdatesStateChanged => self.handle_state_changed(envelope),
            CommandName::SessionSetForeground => self.handle_set_foreground(envelope).await,
            CommandName::ConfigGet => self.handle_config_get(envelope),
            CommandName::ConfigSet => self.handle_config_set(envelope),
            CommandName::StatusGet => self.handle_status_get(envelope).await,
            CommandName::CallResult => self.handle_call_result(envelope).await,
        }
    }

    async fn handle_check_now(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        info!("on-demand update check requested");
        let outcome = self.coordinator.check_for_updates().await;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            json!({
                "loader": format!("{:?}", outcome.loader),
                "platform": format!("{:?}", outcome.platform),
            }),
        ))
    }

    fn handle_state_changed(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let delivered = self.bridge.publish_state(envelope.payload.clone());
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            json!({"accepted": true, "delivered": delivered}),
        ))
    }

    async fn handle_set_foreground(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let active = envelope
            .payload
            .get("active")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| {
                UpdateError::Channel("session.set_foreground requires payload.active".to_owned())
            })?;

        let changed = self.bridge.set_foreground(active);
        let evaluation = if changed && !active {
            Some(format!("{:?}", self.coordinator.reevaluate().await))
        } else {
            None
        };
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            json!({"active": active, "changed": changed, "evaluation": evaluation}),
        ))
    }

    fn handle_config_get(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let payload = match envelope.payload.get("key").and_then(serde_json::Value::as_str) {
            Some(raw) => {
                let key = parse_key(raw)?;
                json!({"key": key.as_str(), "value": self.config.get(key).to_json()})
            }
            None => json!({
                "cron": self.config.get(ConfigKey::Cron).to_json(),
                "min_battery": self.config.get(ConfigKey::MinBattery).to_json(),
                "os_update_handler": self.config.get(ConfigKey::OsUpdateHandler).to_json(),
            }),
        };
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
    }

    fn handle_config_set(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let Some(raw) = envelope.payload.get("key").and_then(serde_json::Value::as_str) else {
            return Err(UpdateError::Config(
                "config.set requires payload.key".to_owned(),
            ));
        };
        let key = parse_key(raw)?;
        let value = envelope.payload.get("value").ok_or_else(|| {
            UpdateError::Config("config.set requires payload.value".to_owned())
        })?;
        let value = ConfigValue::from_json(key, value)?;
        self.config.set(value)?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            json!({"accepted": true, "key": key.as_str()}),
        ))
    }

    async fn handle_status_get(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let statuses = self.coordinator.arbiter().snapshot().await;
        let mut sources = serde_json::Map::new();
        for source in UpdateSource::ALL {
            sources.insert(
                source.as_str().to_owned(),
                json!({
                    "status": statuses.get(source),
                    "phase": self.coordinator.phase(source).await,
                }),
            );
        }
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            json!({
                "sources": sources,
                "decision": statuses.decision(),
                "schedule": self.scheduler.expression().await,
                "foreground_active": self.bridge.foreground_active(),
            }),
        ))
    }

    async fn handle_call_result(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let result: CallResult = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| UpdateError::Channel(format!("invalid call.result payload: {e}")))?;
        let call_id = result.call_id.clone();
        if !self.bridge.resolve_call(result).await {
            return Err(UpdateError::Channel(format!(
                "no pending host call {call_id}"
            )));
        }
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            json!({"resolved": call_id}),
        ))
    }
}

fn parse_key(raw: &str) -> Result<ConfigKey> {
    ConfigKey::parse(raw).ok_or_else(|| UpdateError::Config(format!("unknown config key `{raw}`")))
}
