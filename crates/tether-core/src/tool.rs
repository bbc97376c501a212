//! The external binary-patch tool (`butler`).

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveFormat};
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::layout::InstallLayout;
use crate::progress::{ProgressBus, Stage};
use crate::runtime::DependencyStatus;
use crate::transfer::{DownloadRequest, Downloader};

const ARCHIVE_NAME: &str = "butler.zip";

/// Install the patch tool unless its binary already exists.
///
/// Progress: download fills `0..70`, extraction reports `80`, done is `100`.
///
/// # Errors
/// Returns a network error if the archive cannot be downloaded and an install
/// error if the extracted archive does not contain the tool.
pub async fn ensure_patch_tool(
    downloader: &Downloader,
    url: &str,
    layout: &InstallLayout,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> CoreResult<DependencyStatus> {
    let tool = layout.tool_bin();
    if tool.is_file() {
        progress.report(Stage::Butler, 100.0, "Butler already installed");
        return Ok(DependencyStatus::AlreadyPresent);
    }

    let tool_dir = layout.tool_dir();
    let archive_path = layout.cache_dir().join(ARCHIVE_NAME);

    info!("Downloading patch tool from {url}");
    progress.report(Stage::Butler, 0.0, format!("Downloading {ARCHIVE_NAME}..."));
    downloader
        .download(
            &archive_path,
            url,
            &DownloadRequest::new(Stage::Butler, ARCHIVE_NAME).weighted(0.7),
            progress,
            cancel,
        )
        .await?;

    progress.report(Stage::Butler, 80.0, format!("Extracting {ARCHIVE_NAME}"));
    let partial_dir = tool_dir.with_extension("partial");
    fsutil::remove_dir_if_exists(&partial_dir)
        .map_err(|error| CoreError::io_at("failed to clear patch tool staging", &partial_dir, error))?;
    archive::extract_in_background(archive_path.clone(), ArchiveFormat::Zip, partial_dir.clone())
        .await?;

    let Some(tool_name) = tool.file_name() else {
        return Err(CoreError::install("patch tool path has no file name"));
    };
    if !partial_dir.join(tool_name).is_file() {
        if let Err(error) = fsutil::remove_dir_if_exists(&partial_dir) {
            warn!("Failed to remove {}: {error}", partial_dir.display());
        }
        return Err(CoreError::install(format!(
            "patch tool archive did not contain {}",
            tool.display()
        )));
    }

    fsutil::remove_dir_if_exists(&tool_dir)
        .map_err(|error| CoreError::io_at("failed to remove old patch tool", &tool_dir, error))?;
    std::fs::rename(&partial_dir, &tool_dir).map_err(|error| {
        CoreError::io_at("failed to move patch tool into place", &tool_dir, error)
    })?;
    fsutil::set_executable(&tool)
        .map_err(|error| CoreError::io_at("failed to mark patch tool executable", &tool, error))?;

    if let Err(error) = fsutil::remove_file_if_exists(&archive_path) {
        warn!("Failed to remove {}: {error}", archive_path.display());
    }

    info!("Patch tool installed at {}", tool.display());
    progress.report(Stage::Butler, 100.0, "Butler successfully installed!");
    Ok(DependencyStatus::Installed { path: tool })
}
