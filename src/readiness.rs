//! Readiness policy: may the system check, apply or restart right now?
//!
//! The gate is re-evaluated before every readiness-sensitive action and the
//! answer is never cached, because the foreground session and the battery
//! state can change while an update call is suspended.

use crate::config::ConfigStore;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Battery and charging state.
#[async_trait]
pub trait PowerSensor: Send + Sync {
    /// Battery charge in percent. Systems without a battery report 101.
    async fn battery_level(&self) -> Result<u8>;
    /// Whether the device is on external power.
    async fn is_charging(&self) -> Result<bool>;
}

/// Whether the user is in a foreground session that must not be interrupted.
#[async_trait]
pub trait SessionMonitor: Send + Sync {
    async fn is_foreground_session_active(&self) -> Result<bool>;
}

/// Outcome of one readiness evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The user is in an active foreground session.
    ForegroundSession,
    /// Battery below the configured minimum and not charging.
    BatteryLow { level: u8, minimum: u8 },
    /// A sensor query failed; treated as not ready.
    SensorUnavailable(String),
}

impl Readiness {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::ForegroundSession => f.write_str("foreground session active"),
            Self::BatteryLow { level, minimum } => {
                write!(f, "battery low ({level}% < {minimum}%)")
            }
            Self::SensorUnavailable(reason) => write!(f, "sensor unavailable: {reason}"),
        }
    }
}

/// Readiness predicate combining foreground activity and battery state.
#[derive(Clone)]
pub struct ReadinessGate {
    power: Arc<dyn PowerSensor>,
    session: Arc<dyn SessionMonitor>,
    config: ConfigStore,
}

impl ReadinessGate {
    pub fn new(
        power: Arc<dyn PowerSensor>,
        session: Arc<dyn SessionMonitor>,
        config: ConfigStore,
    ) -> Self {
        Self {
            power,
            session,
            config,
        }
    }

    /// Evaluate readiness, logging the specific cause of a negative answer.
    pub async fn check(&self) -> Readiness {
        let readiness = self.evaluate().await;
        match &readiness {
            Readiness::Ready => {}
            Readiness::ForegroundSession => info!("user in foreground session, not ready"),
            Readiness::BatteryLow { level, minimum } => {
                warn!(level, minimum, "battery low, not ready");
            }
            Readiness::SensorUnavailable(reason) => {
                warn!(%reason, "readiness sensor unavailable, not ready");
            }
        }
        readiness
    }

    /// `true` when updates may proceed right now.
    pub async fn ready(&self) -> bool {
        self.check().await.is_ready()
    }

    async fn evaluate(&self) -> Readiness {
        match self.session.is_foreground_session_active().await {
            Ok(true) => return Readiness::ForegroundSession,
            Ok(false) => {}
            Err(e) => return Readiness::SensorUnavailable(e.to_string()),
        }

        let minimum = self.config.min_battery();
        let level = match self.power.battery_level().await {
            Ok(level) => level,
            Err(e) => return Readiness::SensorUnavailable(e.to_string()),
        };
        if level >= minimum {
            return Readiness::Ready;
        }

        match self.power.is_charging().await {
            Ok(true) => Readiness::Ready,
            Ok(false) => Readiness::BatteryLow { level, minimum },
            Err(e) => Readiness::SensorUnavailable(e.to_string()),
        }
    }
}
