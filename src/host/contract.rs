//! Versioned envelopes exchanged with the host shell.
//!
//! The host sends [`CommandEnvelope`]s and receives one [`ResponseEnvelope`]
//! per command. The daemon sends [`EventEnvelope`]s; those naming a
//! [`HostCall`] expect the host to answer with a `call.result` command
//! carrying the event id as `call_id`.

use serde::{Deserialize, Serialize};

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Commands the host may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "runtime.stop")]
    RuntimeStop,
    #[serde(rename = "updates.check_now")]
    UpdatesCheckNow,
    #[serde(rename = "updates.state_changed")]
    UpdatesStateChanged,
    #[serde(rename = "session.set_foreground")]
    SessionSetForeground,
    #[serde(rename = "config.get")]
    ConfigGet,
    #[serde(rename = "config.set")]
    ConfigSet,
    #[serde(rename = "status.get")]
    StatusGet,
    #[serde(rename = "call.result")]
    CallResult,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::RuntimeStop => "runtime.stop",
            Self::UpdatesCheckNow => "updates.check_now",
            Self::UpdatesStateChanged => "updates.state_changed",
            Self::SessionSetForeground => "session.set_foreground",
            Self::ConfigGet => "config.get",
            Self::ConfigSet => "config.set",
            Self::StatusGet => "status.get",
            Self::CallResult => "call.result",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host.ping" => Some(Self::HostPing),
            "runtime.stop" => Some(Self::RuntimeStop),
            "updates.check_now" => Some(Self::UpdatesCheckNow),
            "updates.state_changed" => Some(Self::UpdatesStateChanged),
            "session.set_foreground" => Some(Self::SessionSetForeground),
            "config.get" => Some(Self::ConfigGet),
            "config.set" => Some(Self::ConfigSet),
            "status.get" => Some(Self::StatusGet),
            "call.result" => Some(Self::CallResult),
            _ => None,
        }
    }
}

/// Calls the daemon makes into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    StartCheck,
    ApplyUpdates,
    RestartSystem,
    RestartClient,
}

impl HostCall {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartCheck => "updates.start_check",
            Self::ApplyUpdates => "updates.apply",
            Self::RestartSystem => "system.restart",
            Self::RestartClient => "client.restart",
        }
    }
}

/// A versioned response envelope from daemon -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned command envelope from host -> daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A versioned event envelope from daemon -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Payload of a `call.result` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub call_id: String,
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}
