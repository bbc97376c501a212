//! Install orchestration: runtime, patch tool, version resolution, patching.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult, ErrorKind, ResultExt};
use crate::layout::InstallLayout;
use crate::online_fix::{apply_online_fix, needs_online_fix};
use crate::oracle::{DiscoveryError, OracleKey, ProbeError, VersionOracle, VersionProbeResult};
use crate::patch::{PatchJob, apply_patch, download_patch};
use crate::progress::{ProgressBus, Stage};
use crate::runtime::ensure_runtime;
use crate::state::InstallState;
use crate::tool::ensure_patch_tool;
use crate::transfer::Downloader;

/// What the caller wants installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub channel: String,
    /// `None` follows the newest version into the `latest` directory.
    pub target_version: Option<u32>,
    pub online_fix: bool,
}

impl InstallRequest {
    pub fn latest(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            target_version: None,
            online_fix: true,
        }
    }

    #[must_use]
    pub fn pinned(mut self, version: u32) -> Self {
        self.target_version = Some(version);
        self
    }

    #[must_use]
    pub fn with_online_fix(mut self, online_fix: bool) -> Self {
        self.online_fix = online_fix;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstallOutcome {
    AlreadyUpToDate { version: u32 },
    Installed { from: u32, to: u32 },
}

/// Local and remote versions of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableVersions {
    pub current: u32,
    pub latest: u32,
    pub available: Vec<u32>,
}

/// Keeps one game installation current.
///
/// Only one [`Installer::ensure_installed`] runs at a time per instance; a
/// second concurrent call fails immediately with [`ErrorKind::Busy`].
#[derive(Debug)]
pub struct Installer {
    downloader: Downloader,
    oracle: Arc<VersionOracle>,
    layout: InstallLayout,
    progress: ProgressBus,
    installing: Mutex<bool>,
}

struct InstallGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

impl Installer {
    pub fn new(
        downloader: Downloader,
        oracle: Arc<VersionOracle>,
        layout: InstallLayout,
        progress: ProgressBus,
    ) -> Self {
        Self {
            downloader,
            oracle,
            layout,
            progress,
            installing: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressBus {
        &self.progress
    }

    #[must_use]
    pub fn is_installing(&self) -> bool {
        *self
            .installing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> CoreResult<InstallGuard<'_>> {
        let mut installing = self
            .installing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *installing {
            return Err(CoreError::busy());
        }
        *installing = true;
        Ok(InstallGuard {
            flag: &self.installing,
        })
    }

    /// Bring the requested game version onto disk.
    ///
    /// # Errors
    /// Returns [`ErrorKind::Busy`] if another installation is running;
    /// otherwise the failing step's error, prefixed with the step name.
    pub async fn ensure_installed(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<InstallOutcome> {
        let _guard = self.begin()?;
        let endpoints = self.oracle.endpoints();
        let platform = self.layout.platform();

        ensure_runtime(
            &self.downloader,
            &endpoints.runtime_manifest,
            &self.layout,
            &self.progress,
            cancel,
        )
        .await
        .context("failed to download Java Runtime")?;

        ensure_patch_tool(
            &self.downloader,
            &endpoints.tool_url(platform.os),
            &self.layout,
            &self.progress,
            cancel,
        )
        .await
        .context("failed to install Butler tool")?;

        let game_dir = self.layout.game_dir(&request.channel, request.target_version);
        let marker = self.layout.client_marker(&game_dir);

        // A pinned directory only ever holds its own version.
        if let Some(version) = request.target_version
            && marker.is_file()
        {
            return Ok(self.up_to_date(&request.channel, version));
        }

        let target = self.resolve_target(request, cancel).await?;
        // Only the `latest` tree changes version, so only it has a state file.
        let state_file = request
            .target_version
            .is_none()
            .then(|| self.layout.state_file(&request.channel));
        let local = state_file
            .as_deref()
            .map_or(0, |path| InstallState::load(path).version);
        let complete = marker.is_file();

        if local == target && complete {
            return Ok(self.up_to_date(&request.channel, target));
        }

        let from = if complete {
            self.progress.report(
                Stage::Pwr,
                0.0,
                format!("Updating from version {local} to {target}..."),
            );
            local
        } else {
            if local != 0 {
                warn!("State says version {local} but {} is missing", marker.display());
            }
            self.progress
                .report(Stage::Pwr, 0.0, format!("Installing game version {target}..."));
            0
        };

        let patch_file = download_patch(
            &self.downloader,
            endpoints,
            &self.layout,
            &request.channel,
            from,
            target,
            &self.progress,
            cancel,
        )
        .await
        .context("failed to download game patch")?;

        self.progress
            .report(Stage::Patch, 0.0, "Applying game patch...");
        let tool = self.layout.tool_bin();
        let staging = self.layout.staging_dir(&request.channel);
        let log_file = self.layout.patch_log();
        apply_patch(
            &PatchJob {
                tool: &tool,
                patch_file: &patch_file,
                game_dir: &game_dir,
                staging_dir: &staging,
                log_file: &log_file,
            },
            &self.progress,
            cancel,
        )
        .await
        .context("failed to apply game patch")?;

        if !marker.is_file() {
            return Err(CoreError::install(format!(
                "game installation incomplete: client executable not found at {}",
                marker.display()
            )));
        }

        if let Some(state_file) = &state_file {
            InstallState { version: target }
                .save(state_file)
                .context("failed to save version info")?;
        }

        if request.online_fix && needs_online_fix(&self.layout, &game_dir) {
            self.apply_online_fix(&game_dir, cancel)
                .await
                .context("failed to apply online fix")?;
        }

        info!("Installed {} version {target} (from {from})", request.channel);
        self.progress
            .report(Stage::Complete, 100.0, "Game installed successfully");
        Ok(InstallOutcome::Installed { from, to: target })
    }

    fn up_to_date(&self, channel: &str, version: u32) -> InstallOutcome {
        info!("Game {channel} is up to date at version {version}");
        self.progress
            .report(Stage::Complete, 100.0, "Game is up to date");
        InstallOutcome::AlreadyUpToDate { version }
    }

    async fn apply_online_fix(&self, game_dir: &Path, cancel: &CancellationToken) -> CoreResult<()> {
        apply_online_fix(
            &self.downloader,
            &self.oracle.endpoints().online_fix,
            &self.layout,
            game_dir,
            &self.progress,
            cancel,
        )
        .await
    }

    async fn resolve_target(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<u32> {
        self.progress
            .report(Stage::Verify, 0.0, "Checking for game updates");

        let target = if let Some(version) = request.target_version {
            self.oracle
                .verify_version_exists(self.layout.platform(), &request.channel, version)
                .await
                .map_err(|error| {
                    unavailable_version(error)
                        .context(format!("requested version {version} is not available"))
                })?;
            version
        } else {
            let key = OracleKey::new(self.layout.platform(), request.channel.as_str());
            let result = self.oracle.find_latest(&key, cancel).await;
            if !result.is_found() {
                return Err(discovery_failure(&key, &result));
            }
            if let Some(url) = &result.success_url {
                debug!("Latest version confirmed at {url}");
            }
            result.latest_version
        };

        self.progress.report(Stage::Verify, 100.0, "Checking complete");
        self.progress
            .report(Stage::Complete, 0.0, format!("Found version {target}"));
        Ok(target)
    }

    /// Installed version, newest remote version and every version in between.
    ///
    /// A failed discovery is logged and reported as `latest == 0`.
    pub async fn available_versions(
        &self,
        channel: &str,
        cancel: &CancellationToken,
    ) -> AvailableVersions {
        let current = InstallState::load(&self.layout.state_file(channel)).version;
        let key = OracleKey::new(self.layout.platform(), channel);
        let result = self.oracle.find_latest(&key, cancel).await;
        if let Some(error) = &result.error {
            warn!("Version discovery for {key} failed: {error}");
        }
        let latest = if result.is_found() {
            result.latest_version
        } else {
            0
        };
        AvailableVersions {
            current,
            latest,
            available: (1..=latest).collect(),
        }
    }
}

fn unavailable_version(error: ProbeError) -> CoreError {
    let kind = match error {
        ProbeError::VersionNotFound { .. } => ErrorKind::Validation,
        ProbeError::Unreachable(_) | ProbeError::ServerError { .. } => ErrorKind::Network,
    };
    CoreError::new(kind, error.to_string())
}

fn discovery_failure(key: &OracleKey, result: &VersionProbeResult) -> CoreError {
    let platform = key.platform;
    match &result.error {
        Some(DiscoveryError::Cancelled) => CoreError::cancelled("version discovery"),
        Some(error) => {
            let sample = result.checked_urls.first().map_or("none", String::as_str);
            let cause = match error {
                DiscoveryError::NoVersions {
                    last_error: Some(last),
                    ..
                } => format!("{error} ({last})"),
                _ => error.to_string(),
            };
            CoreError::network(format!(
                "cannot find game versions on server\n\n\
                 Platform: {} {}\n\
                 Channel: {}\n\
                 Error: {cause}\n\n\
                 Troubleshooting:\n\
                 • Ensure your system is supported (Windows/Linux/macOS)\n\
                 • Check if game is available for your architecture\n\
                 • Verify firewall allows connections to game-patches.hytale.com\n\
                 • Try disabling VPN temporarily\n\n\
                 Checked URLs: {}\n\
                 Sample: {sample}",
                platform.os.as_str(),
                platform.arch.as_str(),
                key.channel,
                result.checked_urls.len(),
            ))
        }
        None => CoreError::validation(format!(
            "no game versions found for your platform\n\n\
             Platform: {platform}\n\
             Version type: {}\n\n\
             This usually means:\n\
             • The game is not yet available for your platform\n\
             • Your system architecture is not supported\n\
             • Server configuration has changed",
            key.channel
        )),
    }
}
