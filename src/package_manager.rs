//! OS image updates through the system package manager.
//!
//! An alternative to the platform's native apply call, selected with
//! `os_update_handler = "package_manager"`. The coordinator treats an
//! [`UpdateResult::Updated`] outcome as a pending system restart.

use crate::config::PackageManagerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Exit code `rpm-ostree upgrade --unchanged-exit-77` uses for "nothing to do".
pub const UNCHANGED_EXIT_CODE: i32 = 77;

/// Outcome of an out-of-band update (package manager or loader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateResult {
    Fail,
    Updated,
    NotUpdated,
}

impl UpdateResult {
    /// Numeric return code: `-1` fail, `0` updated, `1` not updated.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Fail => -1,
            Self::Updated => 0,
            Self::NotUpdated => 1,
        }
    }
}

impl std::fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => f.write_str("failed"),
            Self::Updated => f.write_str("updated"),
            Self::NotUpdated => f.write_str("not updated"),
        }
    }
}

/// Runs one OS update through a package manager.
#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn run_update(&self) -> UpdateResult;
}

/// `rpm-ostree` based image upgrades.
#[derive(Debug, Clone)]
pub struct RpmOstree {
    program: String,
}

impl RpmOstree {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &PackageManagerConfig) -> Self {
        Self::new(config.program.clone())
    }
}

/// Map an exit status code to an update result. `None` means the process
/// was killed by a signal.
#[must_use]
pub fn classify_exit(code: Option<i32>) -> UpdateResult {
    match code {
        Some(0) => UpdateResult::Updated,
        Some(UNCHANGED_EXIT_CODE) => UpdateResult::NotUpdated,
        _ => UpdateResult::Fail,
    }
}

#[async_trait]
impl PackageManager for RpmOstree {
    async fn run_update(&self) -> UpdateResult {
        info!(program = %self.program, "running package-manager upgrade");
        let output = match Command::new(&self.program)
            .args(["upgrade", "--unchanged-exit-77"])
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(program = %self.program, error = %e, "cannot run package manager");
                return UpdateResult::Fail;
            }
        };

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "package-manager output"
        );
        let result = classify_exit(output.status.code());
        if result == UpdateResult::Fail {
            error!(
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "package-manager upgrade failed"
            );
        } else {
            info!(%result, "package-manager upgrade finished");
        }
        result
    }
}
