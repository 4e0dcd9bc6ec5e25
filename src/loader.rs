//! Loader self-update pipeline.
//!
//! Looks up the newest loader release on GitHub, compares it with the
//! installed version using semver, and replaces the installed binary when a
//! newer one exists. A replaced loader only takes effect after a client
//! restart, which the coordinator reports to the arbiter.

use crate::config::LoaderConfig;
use crate::error::{Result, UpdateError};
use crate::package_manager::UpdateResult;
use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

const USER_AGENT: &str = concat!("auto-update/", env!("CARGO_PKG_VERSION"));

/// Runs one loader update attempt.
#[async_trait]
pub trait LoaderUpdater: Send + Sync {
    async fn update(&self) -> UpdateResult;
}

/// A release as listed by the GitHub releases API.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

impl Release {
    /// Semver of the tag, with an optional leading `v` stripped.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        Version::parse(self.tag_name.trim_start_matches('v')).ok()
    }

    fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

/// First release in listing order, skipping pre-releases unless tracked.
#[must_use]
pub fn select_release(releases: &[Release], pre_release: bool) -> Option<&Release> {
    releases
        .iter()
        .find(|release| pre_release || !release.prerelease)
}

/// Loader updater backed by GitHub releases.
pub struct GithubLoaderUpdater {
    client: reqwest::Client,
    config: LoaderConfig,
}

impl GithubLoaderUpdater {
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| UpdateError::Loader(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn latest_release(&self) -> Result<Option<Release>> {
        let response = self
            .client
            .get(&self.config.releases_url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| UpdateError::Loader(format!("release lookup failed: {e}")))?;
        if !response.status().is_success() {
            return Err(UpdateError::Loader(format!(
                "release lookup returned HTTP {}",
                response.status()
            )));
        }
        let releases: Vec<Release> = response
            .json()
            .await
            .map_err(|e| UpdateError::Loader(format!("cannot decode release list: {e}")))?;
        Ok(select_release(&releases, self.config.pre_release).cloned())
    }

    async fn installed_version(&self) -> Version {
        let path = &self.config.version_file;
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match Version::parse(raw.trim().trim_start_matches('v')) {
                Ok(version) => version,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unparsable loader version");
                    Version::new(0, 0, 0)
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read loader version");
                Version::new(0, 0, 0)
            }
        }
    }

    async fn install(&self, url: &str, version: &Version) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Loader(format!("download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(UpdateError::Loader(format!(
                "download returned HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Loader(format!("download interrupted: {e}")))?;

        let target = &self.config.install_path;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = target.with_extension("download");
        tokio::fs::write(&staged, &bytes).await?;
        set_executable(&staged).await?;
        tokio::fs::rename(&staged, target).await?;

        // The new binary is live from here on.
        let version_file = &self.config.version_file;
        if let Err(e) = tokio::fs::write(version_file, format!("{version}\n")).await {
            warn!(path = %version_file.display(), error = %e, "cannot record loader version");
        }
        Ok(())
    }

    async fn try_update(&self) -> Result<UpdateResult> {
        let Some(release) = self.latest_release().await? else {
            info!("no loader release available");
            return Ok(UpdateResult::NotUpdated);
        };
        let latest = release.version().ok_or_else(|| {
            UpdateError::Loader(format!("release tag {} is not a version", release.tag_name))
        })?;
        let current = self.installed_version().await;
        info!(%latest, %current, "loader versions");

        if latest <= current {
            return Ok(UpdateResult::NotUpdated);
        }
        let asset = release.asset(&self.config.asset_name).ok_or_else(|| {
            UpdateError::Loader(format!(
                "release {} has no asset named {}",
                release.tag_name, self.config.asset_name
            ))
        })?;

        info!(url = %asset.browser_download_url, "installing loader update");
        self.install(&asset.browser_download_url, &latest).await?;
        Ok(UpdateResult::Updated)
    }
}

async fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    let _ = path;
    Ok(())
}

#[async_trait]
impl LoaderUpdater for GithubLoaderUpdater {
    async fn update(&self) -> UpdateResult {
        match self.try_update().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "loader update failed");
                UpdateResult::Fail
            }
        }
    }
}

/// Loader pipeline switched off in configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLoader;

#[async_trait]
impl LoaderUpdater for DisabledLoader {
    async fn update(&self) -> UpdateResult {
        UpdateResult::NotUpdated
    }
}
