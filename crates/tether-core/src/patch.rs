//! Patch download and application through the external patch tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info, warn};
use tether_platform::HideWindow;
use tokio_util::sync::CancellationToken;

use crate::endpoints::Endpoints;
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::layout::InstallLayout;
use crate::progress::{ProgressBus, Stage};
use crate::transfer::{DownloadRequest, Downloader};

/// Fetch the `from -> to` patch into the cache, reusing a completed file.
///
/// # Errors
/// Returns the transfer error if the download fails.
#[allow(clippy::too_many_arguments)]
pub async fn download_patch(
    downloader: &Downloader,
    endpoints: &Endpoints,
    layout: &InstallLayout,
    channel: &str,
    from: u32,
    to: u32,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> CoreResult<PathBuf> {
    let dest = layout.patch_cache_file(from, to);
    if dest.is_file() {
        debug!("Reusing cached patch {}", dest.display());
        progress.report(Stage::Pwr, 100.0, "Patch file cached");
        return Ok(dest);
    }

    let url = endpoints.patch_url(layout.platform(), channel, from, to);
    downloader
        .download(
            &dest,
            &url,
            &DownloadRequest::new(Stage::Pwr, format!("{to}.pwr")),
            progress,
            cancel,
        )
        .await?;

    progress.report(Stage::Pwr, 100.0, "Patch file downloaded");
    Ok(dest)
}

/// Paths for one run of the patch tool.
#[derive(Debug, Clone)]
pub struct PatchJob<'a> {
    pub tool: &'a Path,
    pub patch_file: &'a Path,
    pub game_dir: &'a Path,
    pub staging_dir: &'a Path,
    pub log_file: &'a Path,
}

/// Run `<tool> apply --staging-dir <staging> <patch> <game-dir>`.
///
/// The staging directory is wiped before the run and removed afterwards
/// whatever the outcome. Tool output goes to `log_file`.
///
/// # Errors
/// Returns an install error if the tool exits unsuccessfully, a cancelled
/// error if `cancel` fires (the child is killed) and a filesystem error if the
/// directories cannot be prepared or the tool cannot be started.
pub async fn apply_patch(
    job: &PatchJob<'_>,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    std::fs::create_dir_all(job.game_dir)
        .map_err(|error| CoreError::io_at("failed to create game directory", job.game_dir, error))?;
    fsutil::remove_dir_if_exists(job.staging_dir)
        .map_err(|error| CoreError::io_at("failed to clear staging directory", job.staging_dir, error))?;
    std::fs::create_dir_all(job.staging_dir).map_err(|error| {
        CoreError::io_at("failed to create staging directory", job.staging_dir, error)
    })?;
    if let Err(error) = fsutil::set_executable(job.tool) {
        warn!("Failed to mark {} executable: {error}", job.tool.display());
    }

    let (stdout, stderr) = open_log(job);
    let mut command = tokio::process::Command::new(job.tool);
    command
        .arg("apply")
        .arg("--staging-dir")
        .arg(job.staging_dir)
        .arg(job.patch_file)
        .arg(job.game_dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .hide_window();

    progress.report(Stage::Patch, 60.0, "Applying game patch...");
    info!(
        "Applying {} to {}",
        job.patch_file.display(),
        job.game_dir.display()
    );

    let outcome = run_to_completion(&mut command, job, cancel).await;
    if let Err(error) = fsutil::remove_dir_if_exists(job.staging_dir) {
        warn!("Failed to remove staging directory: {error}");
    }
    outcome?;

    progress.report(Stage::Patch, 100.0, "Game patched!");
    Ok(())
}

async fn run_to_completion(
    command: &mut tokio::process::Command,
    job: &PatchJob<'_>,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    let mut child = command
        .spawn()
        .map_err(|error| CoreError::io_at("failed to start patch tool", job.tool, error))?;

    let status = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            if let Err(error) = child.kill().await {
                warn!("Failed to stop patch tool: {error}");
            }
            return Err(CoreError::cancelled("patch application"));
        }
        status = child.wait() => status
            .map_err(|error| CoreError::io("failed to wait for patch tool", error))?,
    };

    if status.success() {
        Ok(())
    } else {
        Err(CoreError::install(format!(
            "patch tool failed (see {})",
            job.log_file.display()
        ))
        .with_detail(format!("patch tool exited with {status}")))
    }
}

fn open_log(job: &PatchJob<'_>) -> (Stdio, Stdio) {
    let opened = job
        .log_file
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::File::create(job.log_file))
        .and_then(|mut file| {
            writeln!(
                file,
                "Starting patch apply for {} to {}",
                job.patch_file.display(),
                job.game_dir.display()
            )?;
            let copy = file.try_clone()?;
            Ok((file, copy))
        });

    match opened {
        Ok((stdout, stderr)) => (Stdio::from(stdout), Stdio::from(stderr)),
        Err(error) => {
            warn!(
                "Failed to open patch log {}: {error}; discarding tool output",
                job.log_file.display()
            );
            (Stdio::null(), Stdio::null())
        }
    }
}
