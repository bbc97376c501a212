//! Startup housekeeping. Everything here is best-effort: failures are logged
//! and skipped.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::fsutil;
use crate::layout::InstallLayout;
use crate::self_update::cleanup_stale_backup;

/// Paths removed by [`cleanup_launcher`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
}

impl CleanupReport {
    fn remove_dir(&mut self, path: &Path) {
        match fsutil::remove_dir_if_exists(path) {
            Ok(()) => self.removed.push(path.to_path_buf()),
            Err(error) => warn!("Failed to remove {}: {error}", path.display()),
        }
    }
}

/// Remove what interrupted runs leave behind.
///
/// - game trees under each channel that lack the client executable
/// - each channel's staging directory
/// - `<exe>.old` from a previous self-update, when `exe` is given
///
/// Partial downloads (`*.tmp`) are kept; the next download resumes them.
/// Must not run while an installation is in progress.
pub fn cleanup_launcher(layout: &InstallLayout, channels: &[&str], exe: Option<&Path>) -> CleanupReport {
    let mut report = CleanupReport::default();

    for channel in channels {
        let staging = layout.staging_dir(channel);
        if staging.exists() {
            report.remove_dir(&staging);
        }
        remove_incomplete_games(layout, channel, &mut report);
    }

    if let Some(exe) = exe
        && cleanup_stale_backup(exe)
    {
        report.removed.push(crate::replace::backup_path(exe));
    }

    if !report.removed.is_empty() {
        info!("Startup cleanup removed {} item(s)", report.removed.len());
    }
    report
}

fn remove_incomplete_games(layout: &InstallLayout, channel: &str, report: &mut CleanupReport) {
    let games_root = layout.games_root(channel);
    let Ok(entries) = std::fs::read_dir(&games_root) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let game_dir = entry.path();
        if !game_dir.is_dir() || layout.client_marker(&game_dir).is_file() {
            continue;
        }
        info!(
            "Incomplete game installation detected, cleaning up {}",
            game_dir.display()
        );
        report.remove_dir(&game_dir);
    }
}
