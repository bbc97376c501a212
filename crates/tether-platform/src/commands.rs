use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use log::debug;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

pub trait HideWindow {
    fn hide_window(&mut self) -> &mut Self;
}

impl HideWindow for tokio::process::Command {
    #[cfg(windows)]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW)
    }

    #[cfg(not(windows))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

impl HideWindow for std::process::Command {
    #[cfg(windows)]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW)
    }

    #[cfg(not(windows))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

/// Start `program` so that its lifetime is independent of the caller.
///
/// The child gets its own process group, no inherited standard streams, the
/// program's directory as working directory and, on Windows, no console
/// window. The child handle is released immediately: the caller never waits
/// on it.
///
/// # Errors
/// Returns an error if the process cannot be spawned.
pub fn launch_detached<I, S>(program: &Path, args: I) -> std::io::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if let Some(dir) = program.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }

    detach(&mut command);

    let child = command.spawn()?;
    debug!("Launched detached process {} ({})", child.id(), program.display());
    // Dropping a std Child neither waits for nor kills it.
    drop(child);
    Ok(())
}

#[cfg(unix)]
fn detach(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut std::process::Command) {
    command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut std::process::Command) {}

#[cfg(test)]
mod tests {
    use super::HideWindow;

    #[test]
    fn std_command_hide_window_is_chainable() {
        let mut cmd = std::process::Command::new("echo");
        let before = &raw mut cmd;
        let after = cmd.hide_window() as *mut std::process::Command;
        assert_eq!(before, after);
    }

    #[test]
    fn tokio_command_hide_window_is_chainable() {
        let mut cmd = tokio::process::Command::new("echo");
        let before = &raw mut cmd;
        let after = cmd.hide_window() as *mut tokio::process::Command;
        assert_eq!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn launch_detached_runs_program_without_waiting() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let marker = temp.path().join("launched");
        let script = temp.path().join("touch.sh");
        std::fs::write(&script, format!("#!/bin/sh\ntouch '{}'\n", marker.display()))
            .expect("script should be written");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("script should be executable");
        }

        super::launch_detached(&script, std::iter::empty::<&str>())
            .expect("detached launch should spawn");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(marker.exists(), "detached child should have run");
    }

    #[test]
    fn launch_detached_reports_missing_program() {
        let result = super::launch_detached(
            std::path::Path::new("/definitely/not/a/real/program"),
            ["--flag"],
        );
        assert!(result.is_err());
    }
}
