//! Java runtime dependency.

use std::path::PathBuf;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveFormat};
use crate::checksum;
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::layout::InstallLayout;
use crate::metadata::{RuntimeManifest, fetch_json};
use crate::progress::{ProgressBus, ProgressEvent, Stage};
use crate::transfer::{DownloadRequest, Downloader};

/// Whether an `ensure_*` step had anything to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    AlreadyPresent,
    Installed { path: PathBuf },
}

/// Install the Java runtime unless `jre/latest/bin/java` already exists.
///
/// # Errors
/// Returns a network error if the manifest or archive cannot be fetched, a
/// validation error on checksum mismatch (the cached archive is deleted) and a
/// filesystem or install error if extraction does not yield a runtime.
pub async fn ensure_runtime(
    downloader: &Downloader,
    manifest_url: &str,
    layout: &InstallLayout,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> CoreResult<DependencyStatus> {
    let java = layout.java_bin();
    if java.is_file() {
        info!("Java runtime already installed, skipping");
        progress.report(Stage::Jre, 100.0, "Java runtime already installed");
        return Ok(DependencyStatus::AlreadyPresent);
    }

    progress.report(Stage::Jre, 0.0, "Fetching Java runtime manifest...");
    let manifest: RuntimeManifest =
        fetch_json(downloader.client(), manifest_url, "Java runtime manifest").await?;
    let asset = manifest
        .download_url
        .require(layout.platform(), "Java runtime")?;

    let file_name = asset.file_name().to_string();
    let archive_path = layout.cache_dir().join(&file_name);
    let format = ArchiveFormat::detect(&file_name).unwrap_or(if layout.platform().is_windows() {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::TarGz
    });

    info!("Downloading Java runtime {} from {}", manifest.version, asset.url);
    downloader
        .download(
            &archive_path,
            &asset.url,
            &DownloadRequest::new(Stage::Jre, file_name.clone()).weighted(0.9),
            progress,
            cancel,
        )
        .await?;

    progress.emit(
        ProgressEvent::new(Stage::Jre, 90.0, "Verifying Java runtime...")
            .with_file(file_name.clone()),
    );
    match asset.checksum() {
        Some(expected) => {
            if let Err(error) =
                checksum::verify_sha256_in_background(archive_path.clone(), expected.to_string())
                    .await
            {
                if let Err(remove_error) = fsutil::remove_file_if_exists(&archive_path) {
                    warn!("Failed to delete corrupt runtime archive: {remove_error}");
                }
                return Err(error);
            }
        }
        None => warn!("No checksum published for {file_name}; skipping verification"),
    }

    progress.emit(
        ProgressEvent::new(Stage::Jre, 95.0, "Extracting Java runtime...")
            .with_file(file_name),
    );
    let runtime_dir = layout.runtime_dir();
    let partial_dir = runtime_dir.with_extension("partial");
    fsutil::remove_dir_if_exists(&partial_dir)
        .map_err(|error| CoreError::io_at("failed to clear runtime staging", &partial_dir, error))?;
    archive::extract_in_background(archive_path.clone(), format, partial_dir.clone()).await?;
    archive::flatten_single_root(&partial_dir)?;

    fsutil::remove_dir_if_exists(&runtime_dir)
        .map_err(|error| CoreError::io_at("failed to remove old runtime", &runtime_dir, error))?;
    std::fs::rename(&partial_dir, &runtime_dir)
        .map_err(|error| CoreError::io_at("failed to move runtime into place", &runtime_dir, error))?;

    if !java.is_file() {
        return Err(CoreError::install(format!(
            "runtime archive did not contain {}",
            java.display()
        )));
    }
    fsutil::set_executable(&java)
        .map_err(|error| CoreError::io_at("failed to mark java executable", &java, error))?;

    if let Err(error) = fsutil::remove_file_if_exists(&archive_path) {
        warn!("Failed to remove cached runtime archive: {error}");
    }

    info!("Java runtime {} installed", manifest.version);
    progress.report(Stage::Jre, 100.0, "Java runtime installed");
    Ok(DependencyStatus::Installed { path: java })
}
