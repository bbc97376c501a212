//! Windows-only overlay that makes a game tree playable online.

use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveFormat};
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::layout::InstallLayout;
use crate::progress::{ProgressBus, Stage};
use crate::transfer::{DownloadRequest, Downloader};

const ARCHIVE_NAME: &str = "online-fix.zip";
const EXTRACT_DIR_NAME: &str = "temp_extract";

/// Files copied from the overlay into the game tree, relative to both roots.
const OVERLAY_FILES: [&str; 3] = [
    "Client/HytaleClient.exe",
    "Server/HytaleServer.jar",
    "Server/start-server.bat",
];

/// The overlay only applies to Windows trees that lack the server launcher.
#[must_use]
pub fn needs_online_fix(layout: &InstallLayout, game_dir: &Path) -> bool {
    layout.platform().is_windows() && !layout.server_launcher(game_dir).is_file()
}

/// Download the overlay archive and copy its files into `game_dir`.
///
/// Progress: download fills `0..70`, extraction reports `70`, done is `100`.
/// The archive and the scratch directory are removed whatever the outcome.
///
/// # Errors
/// Returns a network error if the archive cannot be downloaded and a
/// filesystem error if any overlay file is missing or cannot be copied.
pub async fn apply_online_fix(
    downloader: &Downloader,
    url: &str,
    layout: &InstallLayout,
    game_dir: &Path,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    let archive_path = layout.cache_dir().join(ARCHIVE_NAME);
    let extract_dir = layout.cache_dir().join(EXTRACT_DIR_NAME);

    info!("Applying online fix to {}", game_dir.display());
    progress.report(Stage::OnlineFix, 0.0, "Downloading online-fix from GitHub...");
    downloader
        .download(
            &archive_path,
            url,
            &DownloadRequest::new(Stage::OnlineFix, ARCHIVE_NAME).weighted(0.7),
            progress,
            cancel,
        )
        .await?;

    progress.report(Stage::OnlineFix, 70.0, "Extracting archive...");
    let outcome = overlay(&archive_path, &extract_dir, game_dir).await;

    if let Err(error) = fsutil::remove_dir_if_exists(&extract_dir) {
        warn!("Failed to remove {}: {error}", extract_dir.display());
    }
    if let Err(error) = fsutil::remove_file_if_exists(&archive_path) {
        warn!("Failed to remove {}: {error}", archive_path.display());
    }
    outcome?;

    info!("Online fix applied to {}", game_dir.display());
    progress.report(Stage::OnlineFix, 100.0, "Online fix applied successfully");
    Ok(())
}

async fn overlay(archive_path: &Path, extract_dir: &Path, game_dir: &Path) -> CoreResult<()> {
    fsutil::remove_dir_if_exists(extract_dir)
        .map_err(|error| CoreError::io_at("failed to clean temp directory", extract_dir, error))?;
    archive::extract_in_background(
        archive_path.to_path_buf(),
        ArchiveFormat::Zip,
        extract_dir.to_path_buf(),
    )
    .await?;

    for relative in OVERLAY_FILES {
        let source = extract_dir.join(relative);
        let target: PathBuf = game_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| CoreError::io_at("failed to create directory", parent, error))?;
        }
        std::fs::copy(&source, &target)
            .map_err(|error| CoreError::io_at("failed to copy overlay file", &source, error))?;
    }
    Ok(())
}
