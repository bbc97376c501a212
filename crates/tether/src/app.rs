use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tether_core::self_update::{
    AvailableUpdate, check_for_update, download_update, ensure_update_helper, hand_off,
};
use tether_core::{
    AvailableVersions, CoreError, DiagnosticReport, Downloader, ERROR_CHANNEL, ErrorKind,
    ErrorReport, InstallLayout, InstallOutcome, InstallRequest, Installer, PROGRESS_CHANNEL,
    ProgressBus, ProgressEvent, VersionOracle, build_client, cleanup_launcher, launch_game,
    run_diagnostics, validate_player_name,
};
use tether_platform::{AppPaths, Platform};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Structured form for the `install-error` channel.
    pub fn report(&self) -> ErrorReport {
        match self {
            Self::Core(error) => error.report(),
            Self::Io { context, source } => ErrorReport {
                kind: ErrorKind::FileSystem,
                message: (*context).to_string(),
                technical: Some(source.to_string()),
            },
        }
    }
}

/// How progress events reach the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStyle {
    Text,
    /// One `{"channel": .., "payload": ..}` object per line, named after the
    /// channels the GUI shell listens on.
    Json,
}

#[derive(Serialize)]
struct JsonLine<'a, T> {
    channel: &'static str,
    payload: &'a T,
}

fn json_line<T: Serialize>(channel: &'static str, payload: &T) -> Option<String> {
    serde_json::to_string(&JsonLine { channel, payload })
        .inspect_err(|error| debug!("Failed to serialize {channel} event: {error}"))
        .ok()
}

/// The `install-error` line for a failed command.
pub fn error_line(error: &AppError) -> Option<String> {
    json_line(ERROR_CHANNEL, &error.report())
}

/// Everything a command needs, built once from settings.
pub struct Launcher {
    settings: Settings,
    platform: Platform,
    downloader: Downloader,
    oracle: Arc<VersionOracle>,
    installer: Installer,
}

impl Launcher {
    pub fn new(paths: &AppPaths, settings: Settings) -> Result<Self, AppError> {
        let platform = Platform::current();
        let client = build_client(settings.connect_timeout(), settings.http_timeout())?;
        let downloader = Downloader::new(client).with_retry_delay(settings.retry_delay());
        let oracle = Arc::new(VersionOracle::http(settings.endpoints.clone())?);
        let installer = Installer::new(
            downloader.clone(),
            Arc::clone(&oracle),
            InstallLayout::new(paths, platform),
            ProgressBus::new(),
        );

        Ok(Self {
            settings,
            platform,
            downloader,
            oracle,
            installer,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Best-effort removal of leftovers from interrupted runs.
    pub fn startup_cleanup(&self) {
        let exe = std::env::current_exe().ok();
        cleanup_launcher(
            self.installer.layout(),
            &[self.settings.channel.as_str()],
            exe.as_deref(),
        );
    }

    /// Logs whether a newer launcher is published. Never fails.
    pub async fn silent_update_check(&self) {
        match self.check_update().await {
            Ok(Some(update)) => info!(
                "Launcher {} is available (running {}), run `tether update` to install it",
                update.latest_version, update.current_version
            ),
            Ok(None) => debug!("Launcher is up to date"),
            Err(error) => warn!("Silent update check failed: {error}"),
        }
    }

    pub async fn check_update(&self) -> Result<Option<AvailableUpdate>, AppError> {
        let update = check_for_update(
            self.downloader.client(),
            &self.settings.endpoints.release_feed,
            CURRENT_VERSION,
            self.platform,
        )
        .await?;
        Ok(update)
    }

    pub async fn install(
        &self,
        request: &InstallRequest,
        style: ProgressStyle,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, AppError> {
        let printer = ProgressPrinter::stdout(self.installer.progress().subscribe(), style);
        let outcome = self.installer.ensure_installed(request, cancel).await;
        printer.finish().await;
        Ok(outcome?)
    }

    /// Install or update per `request`, then run the client until it exits.
    ///
    /// The nickname is checked before anything is downloaded. Cancelling
    /// while the game runs stops it.
    pub async fn launch(
        &self,
        request: &InstallRequest,
        player_name: &str,
        style: ProgressStyle,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, AppError> {
        let player_name = validate_player_name(player_name)?;
        let outcome = self.install(request, style, cancel).await?;

        let progress = self.installer.progress();
        let printer = ProgressPrinter::stdout(progress.subscribe(), style);
        let started = launch_game(
            self.installer.layout(),
            &request.channel,
            request.target_version,
            player_name,
            progress,
        );
        printer.finish().await;
        let mut child = started?;
        info!("Game started (pid {:?})", child.id());

        tokio::select! {
            status = child.wait() => {
                let status =
                    status.map_err(|error| AppError::io("failed to wait for the game", error))?;
                info!("Game exited with {status}");
            }
            () = cancel.cancelled() => {
                info!("Stopping the game");
                if let Err(error) = child.kill().await {
                    warn!("Failed to stop the game: {error}");
                }
            }
        }
        Ok(outcome)
    }

    pub async fn versions(&self, channel: &str, cancel: &CancellationToken) -> AvailableVersions {
        self.installer.available_versions(channel, cancel).await
    }

    pub async fn diagnose(&self, cancel: &CancellationToken) -> DiagnosticReport {
        run_diagnostics(
            self.downloader.client(),
            &self.oracle,
            self.installer.layout(),
            &self.settings.channel,
            cancel,
        )
        .await
    }

    /// Download the newest launcher and hand over to the update helper.
    ///
    /// Returns `false` when already current. After `true` the caller must
    /// exit so the helper can replace the executable.
    pub async fn self_update(
        &self,
        style: ProgressStyle,
        cancel: &CancellationToken,
    ) -> Result<bool, AppError> {
        let Some(update) = self.check_update().await? else {
            return Ok(false);
        };

        let exe = std::env::current_exe()
            .map_err(|error| AppError::io("failed to locate the running executable", error))?;
        let exe_dir = executable_dir(&exe)?;

        let helper = ensure_update_helper(
            &self.downloader,
            &self.settings.endpoints.helper_feed,
            &exe_dir,
            self.platform,
            cancel,
        )
        .await?;

        let progress = self.installer.progress();
        let printer = ProgressPrinter::stdout(progress.subscribe(), style);
        let downloaded = download_update(
            &self.downloader,
            &update,
            self.installer.layout().cache_dir(),
            progress,
            cancel,
        )
        .await;
        printer.finish().await;
        let new_binary = downloaded?;

        info!(
            "Handing off {} -> {} to {}",
            update.current_version,
            update.latest_version,
            helper.display()
        );
        hand_off(&helper, &exe, &new_binary).await?;
        Ok(true)
    }
}

fn executable_dir(exe: &Path) -> Result<PathBuf, AppError> {
    exe.parent().map(Path::to_path_buf).ok_or_else(|| {
        AppError::io(
            "failed to locate the executable directory",
            std::io::Error::new(std::io::ErrorKind::NotFound, exe.display().to_string()),
        )
    })
}

/// Forwards progress events to a sink until [`finish`](Self::finish), which
/// flushes whatever is still queued.
struct ProgressPrinter {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressPrinter {
    fn stdout(events: broadcast::Receiver<ProgressEvent>, style: ProgressStyle) -> Self {
        Self::spawn(events, style, |line| println!("{line}"))
    }

    fn spawn(
        mut events: broadcast::Receiver<ProgressEvent>,
        style: ProgressStyle,
        mut sink: impl FnMut(String) + Send + 'static,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => sink_event(&mut sink, &event, style),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Progress printer skipped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    () = stopped.cancelled() => break,
                }
            }
            loop {
                match events.try_recv() {
                    Ok(event) => sink_event(&mut sink, &event, style),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        });
        Self { stop, task }
    }

    async fn finish(self) {
        self.stop.cancel();
        if let Err(error) = self.task.await {
            debug!("Progress printer ended abnormally: {error}");
        }
    }
}

fn sink_event(sink: &mut impl FnMut(String), event: &ProgressEvent, style: ProgressStyle) {
    if let Some(line) = format_progress(event, style) {
        sink(line);
    }
}

fn format_progress(event: &ProgressEvent, style: ProgressStyle) -> Option<String> {
    match style {
        ProgressStyle::Json => json_line(PROGRESS_CHANNEL, event),
        ProgressStyle::Text => {
            let speed = event
                .speed
                .as_deref()
                .map(|speed| format!(" ({speed})"))
                .unwrap_or_default();
            Some(format!("{:>5.1}% {}{speed}", event.progress, event.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex, PoisonError};

    use tether_core::{CoreError, ProgressBus, ProgressEvent, Stage};

    use super::{
        AppError, ProgressPrinter, ProgressStyle, error_line, executable_dir, format_progress,
    };

    #[test]
    fn executable_dir_is_parent_of_exe() {
        let dir = executable_dir(Path::new("/opt/tether/tether"))
            .expect("absolute exe should have a parent");
        assert_eq!(dir, Path::new("/opt/tether"));
    }

    #[test]
    fn bare_root_has_no_executable_dir() {
        assert!(executable_dir(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn finishing_printer_flushes_queued_events() {
        let bus = ProgressBus::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let printer = ProgressPrinter::spawn(bus.subscribe(), ProgressStyle::Text, move |line| {
            sink_lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line);
        });

        bus.report(Stage::Patch, 100.0, "Game patched!");
        bus.report(Stage::Complete, 100.0, "Game installed successfully");
        printer.finish().await;

        let lines = lines.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("Game installed successfully"));
    }

    #[test]
    fn json_progress_is_tagged_with_its_channel() {
        let event = ProgressEvent::new(Stage::Jre, 50.0, "Downloading")
            .with_transfer(Some("1.0 MB/s".to_string()), 5, 10);

        let line = format_progress(&event, ProgressStyle::Json).expect("event should serialize");
        let value: serde_json::Value = serde_json::from_str(&line).expect("line should be JSON");

        assert_eq!(value["channel"], "progress-update");
        assert_eq!(value["payload"]["stage"], "jre");
        assert_eq!(value["payload"]["downloaded"], 5);
    }

    #[test]
    fn text_progress_shows_speed() {
        let event = ProgressEvent::new(Stage::Pwr, 12.5, "Downloading 0-3.pwr")
            .with_transfer(Some("2.0 MB/s".to_string()), 1, 8);

        let line = format_progress(&event, ProgressStyle::Text).expect("text always formats");
        assert_eq!(line, " 12.5% Downloading 0-3.pwr (2.0 MB/s)");
    }

    #[test]
    fn failed_command_becomes_structured_error_line() {
        let error = AppError::from(
            CoreError::network("failed to download game patch").with_detail("HTTP 503"),
        );

        let line = error_line(&error).expect("report should serialize");
        let value: serde_json::Value = serde_json::from_str(&line).expect("line should be JSON");

        assert_eq!(value["channel"], "install-error");
        assert_eq!(value["payload"]["message"], "failed to download game patch");
        assert_eq!(value["payload"]["technical"], "HTTP 503");
    }

    #[test]
    fn io_failure_reports_context_and_cause() {
        let error = AppError::io(
            "failed to save settings",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        );

        let report = error.report();
        assert_eq!(report.message, "failed to save settings");
        assert_eq!(report.technical.as_deref(), Some("read-only"));
    }
}
