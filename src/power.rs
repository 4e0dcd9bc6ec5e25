//! Battery state from the Linux power-supply class (`/sys/class/power_supply`).
//!
//! The first `BAT*` entry (sorted by name) is used. A system without a
//! battery, or with unreadable attributes, reports a level of
//! [`NO_BATTERY_LEVEL`] and "charging" so it never blocks an update.

use crate::error::Result;
use crate::readiness::PowerSensor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Level reported when there is no battery. Above any valid minimum.
pub const NO_BATTERY_LEVEL: u8 = 101;

/// Battery sensor backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsPowerSupply {
    supply_dir: PathBuf,
}

impl SysfsPowerSupply {
    pub fn new(supply_dir: impl Into<PathBuf>) -> Self {
        Self {
            supply_dir: supply_dir.into(),
        }
    }

    async fn battery_path(&self) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(&self.supply_dir).await.ok()?;
        let mut batteries = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with("BAT") {
                batteries.push(entry.path());
            }
        }
        batteries.sort();
        batteries.into_iter().next()
    }

    async fn read_attribute(&self, name: &str) -> Option<String> {
        let battery = self.battery_path().await?;
        read_trimmed(&battery.join(name)).await
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(content.trim().to_owned()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot read power-supply attribute");
            None
        }
    }
}

#[async_trait]
impl PowerSensor for SysfsPowerSupply {
    async fn battery_level(&self) -> Result<u8> {
        let level = self
            .read_attribute("capacity")
            .await
            .and_then(|raw| raw.parse::<u8>().ok())
            .map(|level| level.min(100))
            .unwrap_or(NO_BATTERY_LEVEL);
        Ok(level)
    }

    async fn is_charging(&self) -> Result<bool> {
        Ok(self
            .read_attribute("status")
            .await
            .is_none_or(|status| status != "Discharging"))
    }
}
