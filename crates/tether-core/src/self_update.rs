//! Launcher self-update, primary-process side.
//!
//! The launcher checks its release feed, downloads and verifies the new build,
//! makes sure the update helper sits next to the executable, then hands both
//! paths to the helper and exits. The helper performs the swap (see
//! [`crate::replace`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use semver::Version;
use tether_platform::Platform;
use tokio_util::sync::CancellationToken;

use crate::checksum;
use crate::error::{CoreError, CoreResult, ResultExt};
use crate::fsutil;
use crate::metadata::{ReleaseFeed, RemoteAsset, fetch_json};
use crate::progress::{ProgressBus, Stage};
use crate::replace::backup_path;
use crate::transfer::{DownloadRequest, Downloader};

pub const HELPER_STEM: &str = "tether-update-helper";

/// Time given to the helper to start before the launcher exits.
pub const HAND_OFF_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub current_version: String,
    pub latest_version: String,
    pub asset: RemoteAsset,
}

/// Compare the release feed against `current_version`.
///
/// # Errors
/// Returns a network or validation error if the feed cannot be fetched or
/// decoded, and a validation error if a newer version has no build for
/// `platform`.
pub async fn check_for_update(
    client: &reqwest::Client,
    feed_url: &str,
    current_version: &str,
    platform: Platform,
) -> CoreResult<Option<AvailableUpdate>> {
    let feed: ReleaseFeed = fetch_json(client, feed_url, "launcher release feed").await?;

    let latest = feed.version.strip_prefix('v').unwrap_or(&feed.version);
    let current = current_version.strip_prefix('v').unwrap_or(current_version);
    if !is_newer_version(latest, current) {
        debug!("Launcher {current} is current (feed has {latest})");
        return Ok(None);
    }

    let asset = feed.platforms.require(platform, "launcher build")?.clone();
    info!("Launcher update available: {current} -> {latest}");
    Ok(Some(AvailableUpdate {
        current_version: current.to_string(),
        latest_version: latest.to_string(),
        asset,
    }))
}

/// Download the new build into `cache_dir` and verify it.
///
/// # Errors
/// Returns the transfer error, or a validation error on checksum mismatch
/// (the downloaded file is deleted).
pub async fn download_update(
    downloader: &Downloader,
    update: &AvailableUpdate,
    cache_dir: &Path,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> CoreResult<PathBuf> {
    let destination = cache_dir.join(format!("tether-update-{}", update.latest_version));

    progress.report(Stage::Update, 0.0, "Downloading launcher update...");
    downloader
        .download(
            &destination,
            &update.asset.url,
            &DownloadRequest::new(Stage::Update, "launcher"),
            progress,
            cancel,
        )
        .await
        .context("downloading launcher update")?;

    match update.asset.checksum() {
        Some(expected) => {
            progress.report(Stage::Update, 100.0, "Verifying checksum...");
            verify_or_discard(&destination, expected)
                .await
                .context("update file verification failed")?;
            info!("Launcher update checksum verified");
        }
        None => warn!("No checksum provided for launcher update, skipping verification"),
    }

    progress.report(Stage::Update, 100.0, "Download complete");
    Ok(destination)
}

/// Path of the update helper next to the executable, installing it if absent.
///
/// # Errors
/// Returns an error if the helper feed cannot be read, the download fails or
/// fails verification, or the helper cannot be moved into place.
pub async fn ensure_update_helper(
    downloader: &Downloader,
    feed_url: &str,
    exe_dir: &Path,
    platform: Platform,
    cancel: &CancellationToken,
) -> CoreResult<PathBuf> {
    let helper = exe_dir.join(platform.exe_name(HELPER_STEM));
    if helper.is_file() {
        return Ok(helper);
    }

    info!("Update helper not found, downloading...");
    let feed: ReleaseFeed = fetch_json(downloader.client(), feed_url, "update helper feed")
        .await
        .context("failed to get helper asset info")?;
    let asset = feed.platforms.require(platform, "update helper")?;

    let download = helper.with_extension("download");
    downloader
        .download(
            &download,
            &asset.url,
            &DownloadRequest::new(Stage::Update, HELPER_STEM),
            &ProgressBus::new(),
            cancel,
        )
        .await
        .context("failed to download helper")?;

    if let Some(expected) = asset.checksum() {
        verify_or_discard(&download, expected)
            .await
            .context("helper verification failed")?;
    }

    fsutil::move_file(&download, &helper)
        .map_err(|error| CoreError::io_at("failed to install helper", &helper, error))?;
    fsutil::set_executable(&helper)
        .map_err(|error| CoreError::io_at("failed to set helper permissions", &helper, error))?;

    info!("Update helper installed: {}", helper.display());
    Ok(helper)
}

/// Start the helper on `exe` and `new_binary`, then give it a moment.
///
/// The caller is expected to exit right after this returns.
///
/// # Errors
/// Returns a filesystem error if the helper cannot be spawned.
pub async fn hand_off(helper: &Path, exe: &Path, new_binary: &Path) -> CoreResult<()> {
    tether_platform::launch_detached(helper, [exe.as_os_str(), new_binary.as_os_str()])
        .map_err(|error| CoreError::io_at("failed to start update helper", helper, error))?;
    info!("Update helper started, exiting launcher");
    tokio::time::sleep(HAND_OFF_DELAY).await;
    Ok(())
}

/// Remove the backup a previous self-update left behind. Best-effort.
pub fn cleanup_stale_backup(exe: &Path) -> bool {
    let backup = backup_path(exe);
    if !backup.exists() {
        return false;
    }
    match fsutil::remove_file_if_exists(&backup) {
        Ok(()) => {
            info!("Removed previous launcher build {}", backup.display());
            true
        }
        Err(error) => {
            warn!("Failed to remove {}: {error}", backup.display());
            false
        }
    }
}

async fn verify_or_discard(path: &Path, expected: &str) -> CoreResult<()> {
    checksum::verify_sha256_in_background(path.to_path_buf(), expected.to_string())
        .await
        .inspect_err(|_| {
            if let Err(error) = fsutil::remove_file_if_exists(path) {
                warn!("Failed to delete {}: {error}", path.display());
            }
        })
}

#[must_use]
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    match (parse_semver(latest), parse_semver(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => latest != current,
    }
}

fn parse_semver(version: &str) -> Option<Version> {
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let (core, suffix) = split_semver_core_and_suffix(version);
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next().and_then(|part| part.parse::<u64>().ok());
    let patch = parts.next().and_then(|part| part.parse::<u64>().ok());

    if parts.next().is_some() {
        return None;
    }

    let normalized = match (minor, patch) {
        (None, None) => format!("{major}.0.0{suffix}"),
        (Some(minor), None) => format!("{major}.{minor}.0{suffix}"),
        (Some(minor), Some(patch)) => format!("{major}.{minor}.{patch}{suffix}"),
        (None, Some(_)) => return None,
    };

    Version::parse(&normalized).ok()
}

fn split_semver_core_and_suffix(version: &str) -> (&str, &str) {
    let suffix_idx = version.find(['-', '+']).unwrap_or(version.len());
    (&version[..suffix_idx], &version[suffix_idx..])
}
