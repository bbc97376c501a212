use std::io::Write;
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// Replace `path` with `data` so readers never observe a partial file.
///
/// The data goes to a uniquely named sibling, is synced, then renamed over
/// the destination.
///
/// # Errors
/// Returns a filesystem error if the temp file cannot be written or renamed.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    let parent = path.parent().ok_or_else(|| {
        CoreError::io_at(
            "path has no parent directory",
            path,
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    std::fs::create_dir_all(parent)
        .map_err(|error| CoreError::io_at("failed to create directory", parent, error))?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("state");
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let pid = std::process::id();

    let mut tmp_path = None;
    for attempt in 0..16_u8 {
        let candidate = parent.join(format!(".{file_name}.{pid}.{timestamp}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(data)
                    .and_then(|()| file.sync_all())
                    .map_err(|error| CoreError::io_at("failed to write", &candidate, error))?;
                tmp_path = Some(candidate);
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(CoreError::io_at("failed to create", &candidate, error)),
        }
    }

    let Some(tmp_path) = tmp_path else {
        return Err(CoreError::io_at(
            "failed to create unique temp file next to",
            path,
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        ));
    };

    // std::fs::rename replaces an existing destination on every platform.
    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(CoreError::io_at("failed to replace", path, error));
    }

    Ok(())
}

/// Move a file, falling back to copy + delete across filesystems.
pub(crate) fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(error) if is_cross_device(&error) => {
            let mut reader = std::fs::File::open(src)?;
            let mut writer = std::fs::File::create(dst)?;
            std::io::copy(&mut reader, &mut writer)?;
            writer.sync_all()?;
            drop(reader);
            std::fs::remove_file(src)
        }
        Err(error) => Err(error),
    }
}

fn is_cross_device(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::CrossesDevices
}

/// Make a directory entry change durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
pub(crate) fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub(crate) fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
