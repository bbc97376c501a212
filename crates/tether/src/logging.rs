//! The launcher's log file and the `tether logs` reader.
//!
//! The launcher writes `debug.log` under the data directory; the patch tool
//! writes its own output next to the other install logs. Both are readable
//! through [`read_log_tail`].

#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tether_core::InstallLayout;
use tether_platform::AppPaths;

/// Suffix of the single previous log kept after rotation.
const ROTATED_SUFFIX: &str = "old";

/// Which log `tether logs` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogSource {
    /// The launcher's own `debug.log`.
    Launcher,
    /// Output of the last patch tool run.
    Patch,
}

impl LogSource {
    pub fn path(self, paths: &AppPaths, layout: &InstallLayout) -> PathBuf {
        match self {
            Self::Launcher => paths.log_file(),
            Self::Patch => layout.patch_log(),
        }
    }
}

/// Append-only log file that is recreated when something removes it while
/// the launcher runs, e.g. a user clearing the data directory.
struct LauncherLogFile {
    path: PathBuf,
    file: File,
}

impl LauncherLogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = open_append(&path)?;
        Ok(Self { path, file })
    }

    fn reopen_if_removed(&mut self) -> io::Result<()> {
        if !self.path.exists() {
            self.file = open_append(&self.path)?;
        }
        Ok(())
    }
}

impl Write for LauncherLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reopen_if_removed()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ROTATED_SUFFIX);
    log_path.with_file_name(name)
}

/// Moves an oversized log to `<name>.old`, replacing the previous one, so the
/// new run starts with an empty file.
fn rotate_if_oversized(log_path: &Path, max_log_size: u64) -> io::Result<bool> {
    match std::fs::metadata(log_path) {
        Ok(metadata) if metadata.len() > max_log_size => {
            std::fs::rename(log_path, rotated_path(log_path))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// `info` always reaches the file so install and update history survives;
/// `debug` is opt-in.
fn level_for(debug_enabled: bool) -> LevelFilter {
    if debug_enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the global logger: `debug.log` under the data directory, plus
/// stderr in debug builds. A log file that cannot be opened leaves only the
/// terminal logger.
pub fn init_logging(paths: &AppPaths, debug_enabled: bool, max_log_size: u64) {
    let log_path = paths.log_file();
    let rotated = rotate_if_oversized(&log_path, max_log_size);

    let level = level_for(debug_enabled);
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("tether")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));
    let file_error = match LauncherLogFile::open(log_path.clone()) {
        Ok(file) => {
            loggers.push(WriteLogger::new(level, config, file));
            None
        }
        Err(error) => Some(error),
    };

    if CombinedLogger::init(loggers).is_err() {
        return;
    }

    match rotated {
        Ok(true) => log::info!("Rotated {} (over {max_log_size} bytes)", log_path.display()),
        Ok(false) => {}
        Err(error) => log::warn!("Failed to rotate {}: {error}", log_path.display()),
    }
    if let Some(error) = file_error {
        log::warn!("Logging to {} is disabled: {error}", log_path.display());
    }
    log::debug!("Debug logging enabled, log file: {}", log_path.display());
}

/// The last `max_lines` lines of a log, or `None` if it was never written.
///
/// # Errors
/// Returns any read error other than a missing file.
pub fn read_log_tail(path: &Path, max_lines: usize) -> io::Result<Option<String>> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };
    let text = String::from_utf8_lossy(&contents);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let mut tail = lines[start..].join("\n");
    if !tail.is_empty() {
        tail.push('\n');
    }
    Ok(Some(tail))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tether_core::InstallLayout;
    use tether_platform::{AppPaths, Platform};

    use super::{
        LauncherLogFile, LevelFilter, LogSource, level_for, read_log_tail, rotate_if_oversized,
        rotated_path,
    };

    #[test]
    fn log_file_is_recreated_after_removal() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("logs").join("debug.log");
        let mut file =
            LauncherLogFile::open(log_path.clone()).expect("log file should open with its parent");

        file.write_all(b"before\n").expect("first write should succeed");
        std::fs::remove_file(&log_path).expect("log file should be removable");
        file.write_all(b"after\n").expect("write should recreate the file");

        let contents = std::fs::read_to_string(&log_path).expect("log should be readable");
        assert_eq!(contents, "after\n");
    }

    #[test]
    fn oversized_log_is_rotated_once() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("debug.log");
        std::fs::write(&log_path, "line-1\nline-2\n").expect("log should be written");
        std::fs::write(rotated_path(&log_path), "ancient\n").expect("old log should be written");

        assert!(rotate_if_oversized(&log_path, 4).expect("rotation should succeed"));

        assert!(!log_path.exists());
        let rotated =
            std::fs::read_to_string(temp_dir.path().join("debug.log.old")).expect("rotated log");
        assert_eq!(rotated, "line-1\nline-2\n");
    }

    #[test]
    fn small_or_missing_log_is_not_rotated() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("debug.log");
        assert!(!rotate_if_oversized(&log_path, 4).expect("missing log is fine"));

        std::fs::write(&log_path, "ok\n").expect("log should be written");
        assert!(!rotate_if_oversized(&log_path, 1024).expect("small log is fine"));
        assert!(log_path.is_file());
    }

    #[test]
    fn tail_returns_last_lines() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("butler_apply.log");
        std::fs::write(&log_path, "a\nb\nc\nd\n").expect("log should be written");

        let tail = read_log_tail(&log_path, 2).expect("log should be readable");
        assert_eq!(tail.as_deref(), Some("c\nd\n"));

        let all = read_log_tail(&log_path, 100).expect("log should be readable");
        assert_eq!(all.as_deref(), Some("a\nb\nc\nd\n"));
    }

    #[test]
    fn tail_of_missing_log_is_none() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let tail = read_log_tail(&temp_dir.path().join("absent.log"), 10)
            .expect("missing log is not an error");
        assert!(tail.is_none());
    }

    #[test]
    fn sources_resolve_to_launcher_and_patch_logs() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = AppPaths::rooted_at(temp_dir.path());
        let layout = InstallLayout::new(&paths, Platform::current());

        assert_eq!(LogSource::Launcher.path(&paths, &layout), paths.log_file());
        assert!(
            LogSource::Patch
                .path(&paths, &layout)
                .ends_with("logs/butler_apply.log")
        );
    }

    #[test]
    fn debug_level_is_opt_in() {
        assert_eq!(level_for(true), LevelFilter::Debug);
        assert_eq!(level_for(false), LevelFilter::Info);
    }
}
