//! Configuration for the update orchestrator.
//!
//! [`UpdateConfig`] is persisted as TOML. [`ConfigStore`] wraps it with the
//! key/value surface the rest of the crate uses: `get`, `set` and
//! `subscribe`. Every accepted `set` is written back to disk and broadcast to
//! subscribers through a `tokio::sync::watch` channel.

use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Default schedule: every day at 04:00 local time.
pub const DEFAULT_CRON: &str = "0 4 * * *";

/// Default minimum battery percentage required to update while discharging.
pub const DEFAULT_MIN_BATTERY: u8 = 20;

/// Default bound on an open check cycle, the watchdog's [`UPDATE_TIMEOUT`](crate::watchdog::UPDATE_TIMEOUT).
pub const DEFAULT_WATCHDOG_TIMEOUT_SECS: u64 = crate::watchdog::UPDATE_TIMEOUT.as_secs();

/// Which mechanism performs operating-system level updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsUpdateHandler {
    /// Ask the platform update service to apply the OS update.
    #[default]
    PlatformNative,
    /// Run the package manager (`rpm-ostree`) directly.
    PackageManager,
}

impl OsUpdateHandler {
    /// Wire name used in the config file and host bridge.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlatformNative => "platform_native",
            Self::PackageManager => "package_manager",
        }
    }

    /// Parse a handler name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "platform_native" | "native" => Some(Self::PlatformNative),
            "package_manager" | "rpm-ostree" | "rpm_ostree" => Some(Self::PackageManager),
            _ => None,
        }
    }
}

impl std::fmt::Display for OsUpdateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Cron expression for scheduled checks. Empty disables scheduling.
    pub cron: String,
    /// Minimum battery percentage (0-100) to update while not charging.
    pub min_battery: u8,
    /// How OS-level updates are executed.
    pub os_update_handler: OsUpdateHandler,
    /// Seconds an open check cycle may run before it is abandoned.
    pub watchdog_timeout_secs: u64,
    /// Battery sensor settings.
    pub power: PowerConfig,
    /// Loader self-update settings.
    pub loader: LoaderConfig,
    /// Package-manager OS update settings.
    pub package_manager: PackageManagerConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            cron: DEFAULT_CRON.to_owned(),
            min_battery: DEFAULT_MIN_BATTERY,
            os_update_handler: OsUpdateHandler::default(),
            watchdog_timeout_secs: DEFAULT_WATCHDOG_TIMEOUT_SECS,
            power: PowerConfig::default(),
            loader: LoaderConfig::default(),
            package_manager: PackageManagerConfig::default(),
        }
    }
}

/// Battery sensor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Directory holding `BAT*` power-supply entries.
    pub supply_dir: PathBuf,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

/// Loader self-update configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Whether the loader pipeline runs at all.
    pub enabled: bool,
    /// GitHub releases API endpoint listing loader releases (newest first).
    pub releases_url: String,
    /// Release asset holding the loader binary.
    pub asset_name: String,
    /// Where the loader binary is installed.
    pub install_path: PathBuf,
    /// File containing the installed loader version.
    pub version_file: PathBuf,
    /// Track pre-releases as well as stable releases.
    pub pre_release: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            enabled: true,
            releases_url: "https://api.github.com/repos/SteamDeckHomebrew/decky-loader/releases"
                .to_owned(),
            asset_name: "PluginLoader".to_owned(),
            install_path: home.join("homebrew").join("services").join("PluginLoader"),
            version_file: home.join("homebrew").join("services").join(".loader.version"),
            pre_release: false,
        }
    }
}

/// Package-manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManagerConfig {
    /// Program invoked to upgrade the OS image.
    pub program: String,
}

impl Default for PackageManagerConfig {
    fn default() -> Self {
        Self {
            program: "rpm-ostree".to_owned(),
        }
    }
}

impl UpdateConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.min_battery > 100 {
            return Err(UpdateError::Config(format!(
                "min_battery must be within 0-100, got {}",
                self.min_battery
            )));
        }
        if self.watchdog_timeout_secs == 0 {
            return Err(UpdateError::Config(
                "watchdog_timeout_secs must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as TOML, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/auto-update/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("auto-update").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("auto-update")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/auto-update/config.toml")
        }
    }
}

/// Keys exposed through the key/value surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    Cron,
    MinBattery,
    OsUpdateHandler,
}

impl ConfigKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::MinBattery => "min_battery",
            Self::OsUpdateHandler => "os_update_handler",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cron" => Some(Self::Cron),
            "min_battery" => Some(Self::MinBattery),
            "os_update_handler" => Some(Self::OsUpdateHandler),
            _ => None,
        }
    }
}

/// A typed value for one [`ConfigKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Cron(String),
    MinBattery(u8),
    OsUpdateHandler(OsUpdateHandler),
}

impl ConfigValue {
    /// The key this value belongs to.
    #[must_use]
    pub fn key(&self) -> ConfigKey {
        match self {
            Self::Cron(_) => ConfigKey::Cron,
            Self::MinBattery(_) => ConfigKey::MinBattery,
            Self::OsUpdateHandler(_) => ConfigKey::OsUpdateHandler,
        }
    }

    /// Write this value into `config`, reporting whether it changed.
    fn apply_to(&self, config: &mut UpdateConfig) -> bool {
        match self {
            Self::Cron(cron) if config.cron != *cron => {
                config.cron.clone_from(cron);
                true
            }
            Self::MinBattery(level) if config.min_battery != *level => {
                config.min_battery = *level;
                true
            }
            Self::OsUpdateHandler(handler) if config.os_update_handler != *handler => {
                config.os_update_handler = *handler;
                true
            }
            _ => false,
        }
    }

    /// Decode a JSON value for `key`, as sent by the host bridge.
    pub fn from_json(key: ConfigKey, value: &serde_json::Value) -> Result<Self> {
        match key {
            ConfigKey::Cron => value
                .as_str()
                .map(|s| Self::Cron(s.trim().to_owned()))
                .ok_or_else(|| UpdateError::Config("cron must be a string".to_owned())),
            ConfigKey::MinBattery => value
                .as_u64()
                .filter(|v| *v <= 100)
                .map(|v| Self::MinBattery(v as u8))
                .ok_or_else(|| {
                    UpdateError::Config(format!("min_battery must be 0-100, got {value}"))
                }),
            ConfigKey::OsUpdateHandler => value
                .as_str()
                .and_then(OsUpdateHandler::parse)
                .map(Self::OsUpdateHandler)
                .ok_or_else(|| {
                    UpdateError::Config(format!("unknown os_update_handler {value}"))
                }),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Cron(cron) => serde_json::json!(cron),
            Self::MinBattery(level) => serde_json::json!(level),
            Self::OsUpdateHandler(handler) => serde_json::json!(handler.as_str()),
        }
    }
}

/// Shared, observable configuration store.
///
/// Cloning is cheap; all clones see the same configuration.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<UpdateConfig>>,
    path: Option<Arc<PathBuf>>,
    write: Arc<Mutex<()>>,
}

impl ConfigStore {
    /// A store that never touches disk.
    #[must_use]
    pub fn in_memory(config: UpdateConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self {
            tx: Arc::new(tx),
            path: None,
            write: Arc::default(),
        }
    }

    /// Open the store backed by `path`. A missing file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            UpdateConfig::from_file(&path)?
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            UpdateConfig::default()
        };
        let (tx, _rx) = watch::channel(config);
        Ok(Self {
            tx: Arc::new(tx),
            path: Some(Arc::new(path)),
            write: Arc::default(),
        })
    }

    /// Current configuration.
    #[must_use]
    pub fn snapshot(&self) -> UpdateConfig {
        self.tx.borrow().clone()
    }

    /// Read one key.
    #[must_use]
    pub fn get(&self, key: ConfigKey) -> ConfigValue {
        let config = self.tx.borrow();
        match key {
            ConfigKey::Cron => ConfigValue::Cron(config.cron.clone()),
            ConfigKey::MinBattery => ConfigValue::MinBattery(config.min_battery),
            ConfigKey::OsUpdateHandler => ConfigValue::OsUpdateHandler(config.os_update_handler),
        }
    }

    #[must_use]
    pub fn cron(&self) -> String {
        self.tx.borrow().cron.clone()
    }

    #[must_use]
    pub fn min_battery(&self) -> u8 {
        self.tx.borrow().min_battery
    }

    #[must_use]
    pub fn os_update_handler(&self) -> OsUpdateHandler {
        self.tx.borrow().os_update_handler
    }

    /// Write one key. A changed value is persisted first; subscribers only
    /// see it once the write succeeded.
    pub fn set(&self, value: ConfigValue) -> Result<()> {
        if let ConfigValue::MinBattery(level) = &value
            && *level > 100
        {
            return Err(UpdateError::Config(format!(
                "min_battery must be within 0-100, got {level}"
            )));
        }

        let _writer = self
            .write
            .lock()
            .map_err(|_| UpdateError::Config("config writer poisoned".to_owned()))?;
        let key = value.key();
        let mut next = self.snapshot();
        if !value.apply_to(&mut next) {
            tracing::debug!(key = key.as_str(), "config value unchanged");
            return Ok(());
        }

        if let Some(path) = &self.path {
            next.save_to_file(path)?;
        }
        tracing::info!(key = key.as_str(), value = %value.to_json(), "config updated");
        self.tx.send_replace(next);
        Ok(())
    }

    /// Observe configuration changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpdateConfig> {
        self.tx.subscribe()
    }
}
