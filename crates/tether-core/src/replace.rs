//! Swap a running executable for a new build and relaunch it.
//!
//! Runs inside the update helper process after the launcher has exited (or is
//! about to). Every step is synchronous: the helper has nothing else to do.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::fsutil;

/// Timings of the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacePolicy {
    /// Wait before the first rename so the launcher can exit.
    pub grace: Duration,
    pub backup_attempts: u32,
    pub retry_delay: Duration,
    /// Wait between the swap and the relaunch.
    pub settle: Duration,
}

impl Default for ReplacePolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1500),
            backup_attempts: 20,
            retry_delay: Duration::from_millis(200),
            settle: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("new executable not found: {}", .0.display())]
    MissingUpdate(PathBuf),
    #[error("failed to backup old executable after {attempts} attempts: {source}")]
    Backup {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install update: {source}")]
    Install {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install update ({source}) and to restore the backup ({rollback})")]
    RollbackFailed {
        #[source]
        source: std::io::Error,
        rollback: std::io::Error,
    },
    #[error("failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),
    #[error("failed to restart launcher: {0}")]
    Relaunch(#[source] std::io::Error),
}

/// Starts the freshly installed executable.
pub trait Relauncher {
    /// # Errors
    /// Returns the spawn error.
    fn relaunch(&self, exe: &Path) -> std::io::Result<()>;
}

/// Relaunch as a fully detached process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedRelauncher;

impl Relauncher for DetachedRelauncher {
    fn relaunch(&self, exe: &Path) -> std::io::Result<()> {
        tether_platform::launch_detached(exe, std::iter::empty::<&str>())
    }
}

impl<F> Relauncher for F
where
    F: Fn(&Path) -> std::io::Result<()>,
{
    fn relaunch(&self, exe: &Path) -> std::io::Result<()> {
        self(exe)
    }
}

/// `<exe>.old`, where the previous build is kept until the next start.
#[must_use]
pub fn backup_path(exe: &Path) -> PathBuf {
    let mut name = OsString::from(exe.as_os_str());
    name.push(".old");
    PathBuf::from(name)
}

/// Replace `old` with `new`, keeping `old` as `<old>.old`, then relaunch it.
///
/// If `old` cannot be moved aside within the retry budget nothing is touched.
/// If `new` cannot be moved into place the backup is restored.
///
/// # Errors
/// Returns the step that failed; see [`ReplaceError`].
pub fn perform_replace(
    old: &Path,
    new: &Path,
    policy: &ReplacePolicy,
    relauncher: &impl Relauncher,
) -> Result<(), ReplaceError> {
    if !new.is_file() {
        return Err(ReplaceError::MissingUpdate(new.to_path_buf()));
    }
    let backup = backup_path(old);

    info!("Waiting for launcher to exit...");
    sleep(policy.grace);

    info!("Creating backup...");
    move_aside(old, &backup, policy)?;

    info!("Installing update...");
    install_new(old, new, &backup)?;

    if !cfg!(windows) {
        fsutil::set_executable(old).map_err(ReplaceError::Permissions)?;
        if let Err(error) = std::fs::File::open(old).and_then(|file| file.sync_all()) {
            warn!("Failed to sync {}: {error}", old.display());
        }
        if let Some(dir) = old.parent()
            && let Err(error) = fsutil::sync_dir(dir)
        {
            warn!("Failed to sync {}: {error}", dir.display());
        }
    }

    sleep(policy.settle);

    info!("Restarting launcher...");
    relauncher.relaunch(old).map_err(ReplaceError::Relaunch)?;

    info!("Update complete!");
    Ok(())
}

fn move_aside(old: &Path, backup: &Path, policy: &ReplacePolicy) -> Result<(), ReplaceError> {
    let attempts = policy.backup_attempts.max(1);
    let mut attempt = 1;
    loop {
        if let Err(error) = fsutil::remove_file_if_exists(backup) {
            debug!("Could not remove stale backup {}: {error}", backup.display());
        }
        match std::fs::rename(old, backup) {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= attempts => {
                return Err(ReplaceError::Backup { attempts, source });
            }
            Err(error) => {
                debug!("Backup attempt {attempt}/{attempts} failed: {error}");
                attempt += 1;
                sleep(policy.retry_delay);
            }
        }
    }
}

fn install_new(old: &Path, new: &Path, backup: &Path) -> Result<(), ReplaceError> {
    let Err(source) = fsutil::move_file(new, old) else {
        return Ok(());
    };
    warn!("Failed to install update, restoring backup: {source}");
    match std::fs::rename(backup, old) {
        Ok(()) => Err(ReplaceError::Install { source }),
        Err(rollback) => Err(ReplaceError::RollbackFailed { source, rollback }),
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::{ReplaceError, ReplacePolicy, backup_path, install_new, perform_replace};

    fn quick(attempts: u32, retry_delay: Duration) -> ReplacePolicy {
        ReplacePolicy {
            grace: Duration::ZERO,
            backup_attempts: attempts,
            retry_delay,
            settle: Duration::ZERO,
        }
    }

    fn builds(dir: &Path) -> (PathBuf, PathBuf) {
        let old = dir.join("tether");
        let new = dir.join("download").join("tether-new");
        std::fs::create_dir_all(new.parent().expect("download dir")).expect("download dir");
        std::fs::write(&old, b"v1").expect("old build written");
        std::fs::write(&new, b"v2").expect("new build written");
        (old, new)
    }

    #[test]
    fn backup_path_appends_old_suffix() {
        assert_eq!(
            backup_path(Path::new("/opt/tether/tether.exe")),
            PathBuf::from("/opt/tether/tether.exe.old")
        );
    }

    #[test]
    fn swaps_builds_and_relaunches() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (old, new) = builds(temp.path());
        std::fs::write(backup_path(&old), b"v0").expect("stale backup written");
        let relaunched = Mutex::new(Vec::new());

        perform_replace(&old, &new, &quick(3, Duration::ZERO), &|exe: &Path| {
            relaunched
                .lock()
                .expect("relaunch log lock")
                .push(exe.to_path_buf());
            Ok(())
        })
        .expect("replace should succeed");

        assert_eq!(std::fs::read(&old).expect("old readable"), b"v2");
        assert_eq!(std::fs::read(backup_path(&old)).expect("backup readable"), b"v1");
        assert!(!new.exists());
        assert_eq!(*relaunched.lock().expect("relaunch log lock"), vec![old]);
    }

    #[test]
    fn missing_update_touches_nothing() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let old = temp.path().join("tether");
        std::fs::write(&old, b"v1").expect("old build written");

        let error = perform_replace(
            &old,
            &temp.path().join("absent"),
            &quick(3, Duration::ZERO),
            &|_: &Path| Ok(()),
        )
        .expect_err("missing update should fail");

        assert!(matches!(error, ReplaceError::MissingUpdate(_)));
        assert_eq!(std::fs::read(&old).expect("old readable"), b"v1");
    }

    /// A non-empty directory at the backup path blocks the rename, standing in
    /// for an executable that is still locked by the exiting launcher.
    #[cfg(unix)]
    #[test]
    fn succeeds_once_lock_releases_within_budget() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (old, new) = builds(temp.path());
        let blocker = backup_path(&old);
        std::fs::create_dir_all(blocker.join("held")).expect("blocker created");

        let release = blocker.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::remove_dir_all(release).expect("blocker removed");
        });

        perform_replace(&old, &new, &quick(50, Duration::from_millis(20)), &|_: &Path| {
            Ok(())
        })
        .expect("replace should succeed after the lock releases");
        releaser.join().expect("releaser thread");

        assert_eq!(std::fs::read(&old).expect("old readable"), b"v2");
    }

    #[cfg(unix)]
    #[test]
    fn exhausted_backup_budget_leaves_both_builds_alone() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (old, new) = builds(temp.path());
        std::fs::create_dir_all(backup_path(&old).join("held")).expect("blocker created");

        let error = perform_replace(&old, &new, &quick(3, Duration::from_millis(5)), &|_: &Path| {
            Ok(())
        })
        .expect_err("locked executable should fail");

        assert!(matches!(error, ReplaceError::Backup { attempts: 3, .. }));
        assert_eq!(std::fs::read(&old).expect("old readable"), b"v1");
        assert_eq!(std::fs::read(&new).expect("new readable"), b"v2");
    }

    #[test]
    fn failed_install_restores_backup() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let old = temp.path().join("tether");
        let backup = backup_path(&old);
        std::fs::write(&backup, b"v1").expect("backup written");

        let error = install_new(&old, &temp.path().join("vanished"), &backup)
            .expect_err("missing new build should fail");

        assert!(matches!(error, ReplaceError::Install { .. }));
        assert_eq!(std::fs::read(&old).expect("old restored"), b"v1");
        assert!(!backup.exists());
    }

    #[test]
    fn relaunch_failure_is_reported_after_swap() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let (old, new) = builds(temp.path());

        let error = perform_replace(&old, &new, &quick(1, Duration::ZERO), &|_: &Path| {
            Err(std::io::Error::other("spawn refused"))
        })
        .expect_err("relaunch failure should surface");

        assert!(matches!(error, ReplaceError::Relaunch(_)));
        assert_eq!(std::fs::read(&old).expect("old readable"), b"v2");
    }
}
