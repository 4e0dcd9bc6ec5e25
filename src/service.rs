//! Contract of the remote platform update service.
//!
//! The service is reached through an opaque transport (see [`crate::host`]).
//! It exposes three calls and one event stream. Events arrive as untyped
//! JSON values and are decoded into [`UpdateStateEvent`] by the coordinator,
//! so that a malformed payload is handled as a state-machine event rather
//! than a transport failure.

use crate::error::{Result, UpdateError};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Remote update service calls.
#[async_trait]
pub trait UpdateService: Send + Sync {
    /// Ask the service to check for updates. Progress arrives as events.
    async fn start_check(&self) -> Result<()>;
    /// Apply the updates named by `selector` (see [`UpdateSelection::selector`]).
    async fn apply_updates(&self, selector: &str) -> Result<()>;
    /// Subscribe to update-state events.
    fn subscribe_state_changes(&self) -> StateSubscription;
}

/// A live subscription to update-state events. Dropping it unsubscribes.
#[derive(Debug)]
pub struct StateSubscription {
    rx: broadcast::Receiver<serde_json::Value>,
}

impl StateSubscription {
    #[must_use]
    pub fn new(rx: broadcast::Receiver<serde_json::Value>) -> Self {
        Self { rx }
    }

    /// Next raw event payload, or `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update-state subscription lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Platform updater state carried by each event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdaterState {
    #[default]
    Invalid,
    UpToDate,
    Checking,
    Available,
    Applying,
    ClientRestartPending,
    SystemRestartPending,
    Rollback,
    /// A state this build does not know about.
    Unknown,
}

impl UpdaterState {
    /// Map the platform's numeric state code. The platform never assigns 1.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Invalid,
            2 => Self::UpToDate,
            3 => Self::Checking,
            4 => Self::Available,
            5 => Self::Applying,
            6 => Self::ClientRestartPending,
            7 => Self::SystemRestartPending,
            8 => Self::Rollback,
            _ => Self::Unknown,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "INVALID" => Self::Invalid,
            "UP_TO_DATE" => Self::UpToDate,
            "CHECKING" => Self::Checking,
            "AVAILABLE" => Self::Available,
            "APPLYING" => Self::Applying,
            "CLIENT_RESTART_PENDING" => Self::ClientRestartPending,
            "SYSTEM_RESTART_PENDING" => Self::SystemRestartPending,
            "ROLLBACK" => Self::Rollback,
            _ => Self::Unknown,
        }
    }
}

/// Numeric code or symbolic name, as hosts send either.
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeOrName {
    Code(i64),
    Name(String),
}

impl<'de> Deserialize<'de> for UpdaterState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match CodeOrName::deserialize(deserializer)? {
            CodeOrName::Code(code) => Self::from_code(code),
            CodeOrName::Name(name) => Self::from_name(&name),
        })
    }
}

/// Kind of an update item reported by a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdaterType {
    #[default]
    Invalid,
    Client,
    Os,
    Bios,
    Aggregated,
    Other(u8),
}

impl UpdaterType {
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Invalid,
            1 => Self::Client,
            2 => Self::Os,
            3 => Self::Bios,
            4 => Self::Aggregated,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Client => 1,
            Self::Os => 2,
            Self::Bios => 3,
            Self::Aggregated => 4,
            Self::Other(code) => code,
        }
    }

    /// Items installed through the operating-system update path.
    #[must_use]
    pub fn is_os_level(self) -> bool {
        matches!(self, Self::Os | Self::Bios)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "INVALID" => Some(Self::Invalid),
            "CLIENT" => Some(Self::Client),
            "OS" => Some(Self::Os),
            "BIOS" => Some(Self::Bios),
            "AGGREGATED" => Some(Self::Aggregated),
            _ => None,
        }
    }
}

impl Serialize for UpdaterType {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for UpdaterType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match CodeOrName::deserialize(deserializer)? {
            CodeOrName::Code(code) => u8::try_from(code)
                .map(Self::from_code)
                .map_err(|_| serde::de::Error::custom(format!("updater type {code} out of range"))),
            CodeOrName::Name(name) => Self::from_name(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown updater type {name}"))),
        }
    }
}

/// One item of a check result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCheckResult {
    pub available: bool,
    #[serde(rename = "type")]
    pub kind: UpdaterType,
}

/// One item of an apply result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateApplyResult {
    pub requires_system_restart: bool,
    pub requires_client_restart: bool,
}

/// Decoded update-state event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateStateEvent {
    pub state: UpdaterState,
    pub supports_os_updates: bool,
    pub update_check_results: Vec<UpdateCheckResult>,
    pub update_apply_results: Vec<UpdateApplyResult>,
}

impl UpdateStateEvent {
    /// Decode a raw payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(UpdateError::Event(format!(
                "expected an object, got {payload}"
            )));
        }
        Self::deserialize(payload).map_err(|e| UpdateError::Event(e.to_string()))
    }

    /// The event the package-manager path synthesizes after an OS update.
    #[must_use]
    pub fn system_restart_pending() -> Self {
        Self {
            state: UpdaterState::SystemRestartPending,
            supports_os_updates: true,
            update_check_results: Vec::new(),
            update_apply_results: vec![UpdateApplyResult {
                requires_system_restart: true,
                requires_client_restart: false,
            }],
        }
    }

    /// Item types that are available and valid.
    #[must_use]
    pub fn available_types(&self) -> Vec<UpdaterType> {
        self.update_check_results
            .iter()
            .filter(|result| result.available && result.kind != UpdaterType::Invalid)
            .map(|result| result.kind)
            .collect()
    }

    #[must_use]
    pub fn requires_system_restart(&self) -> bool {
        self.update_apply_results
            .iter()
            .any(|result| result.requires_system_restart)
    }

    #[must_use]
    pub fn requires_client_restart(&self) -> bool {
        self.update_apply_results
            .iter()
            .any(|result| result.requires_client_restart)
    }
}

/// Which update path a selection goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateScope {
    Os,
    Client,
}

/// The item types chosen for one apply call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSelection {
    pub scope: UpdateScope,
    pub types: Vec<UpdaterType>,
}

impl UpdateSelection {
    /// Partition available types; OS-level items win when both are present.
    #[must_use]
    pub fn from_available(types: &[UpdaterType]) -> Option<Self> {
        let (os, client): (Vec<UpdaterType>, Vec<UpdaterType>) =
            types.iter().partition(|kind| kind.is_os_level());
        if !os.is_empty() {
            Some(Self {
                scope: UpdateScope::Os,
                types: os,
            })
        } else if !client.is_empty() {
            Some(Self {
                scope: UpdateScope::Client,
                types: client,
            })
        } else {
            None
        }
    }

    /// Apply-call argument: base64 of one `0x08 <type>` pair per item, the
    /// serialized repeated-enum field 1 the platform expects.
    #[must_use]
    pub fn selector(&self) -> String {
        let bytes: Vec<u8> = self
            .types
            .iter()
            .flat_map(|kind| [0x08, kind.code()])
            .collect();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}
