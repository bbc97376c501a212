use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{CoreError, CoreResult, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Guess the format from a file name or URL.
    #[must_use]
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest`, creating `dest` if needed.
///
/// # Errors
/// Returns an error when the archive cannot be read or an entry cannot be
/// written.
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> CoreResult<()> {
    std::fs::create_dir_all(dest)
        .map_err(|error| CoreError::io_at("failed to create extraction directory", dest, error))?;
    match format {
        ArchiveFormat::Zip => extract_zip(archive, dest),
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
    }
}

/// [`extract`] on the blocking thread pool.
///
/// # Errors
/// Same as [`extract`], plus an error if the worker task panics.
pub async fn extract_in_background(
    archive: PathBuf,
    format: ArchiveFormat,
    dest: PathBuf,
) -> CoreResult<()> {
    tokio::task::spawn_blocking(move || extract(&archive, format, &dest))
        .await
        .map_err(|error| {
            CoreError::new(ErrorKind::Unknown, "extraction task failed").with_source(error)
        })?
}

pub(crate) fn extract_zip(zip_path: &Path, dest: &Path) -> CoreResult<()> {
    let file = std::fs::File::open(zip_path)
        .map_err(|error| CoreError::io_at("failed to open zip file", zip_path, error))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| CoreError::zip("failed to read zip archive", error))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|error| CoreError::zip("failed to read zip entry", error))?;
        let Some(name) = entry.enclosed_name() else {
            warn!("Skipping zip entry with unsafe path");
            continue;
        };
        let out_path = dest.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|error| {
                CoreError::io_at("failed to create extraction directory", &out_path, error)
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                CoreError::io_at("failed to create extraction parent directory", parent, error)
            })?;
        }
        let mut outfile = std::fs::File::create(&out_path)
            .map_err(|error| CoreError::io_at("failed to create extracted file", &out_path, error))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|error| CoreError::io_at("failed to extract archive entry", &out_path, error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                if let Err(error) =
                    std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))
                {
                    warn!("Failed to set mode {mode:o} on {}: {error}", out_path.display());
                }
            }
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}

pub(crate) fn extract_tar_gz(tar_path: &Path, dest: &Path) -> CoreResult<()> {
    let file = std::fs::File::open(tar_path)
        .map_err(|error| CoreError::io_at("failed to open tar.gz file", tar_path, error))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|error| CoreError::io_at("failed to read tar archive", tar_path, error))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|error| CoreError::io_at("failed to read tar entry", tar_path, error))?;
        // unpack_in refuses entries that would escape `dest`.
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|error| CoreError::io_at("failed to extract tar entry", dest, error))?;
        if !unpacked {
            warn!("Skipping tar entry with unsafe path");
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}

/// Hoist the contents of a lone top-level directory into `dir`.
///
/// Runtime archives usually wrap everything in `jdk-<version>/`; after
/// flattening, `dir/bin/java` is where callers expect it. Does nothing when
/// `dir` holds anything other than exactly one directory.
///
/// # Errors
/// Returns an error if entries cannot be listed or moved.
pub fn flatten_single_root(dir: &Path) -> CoreResult<()> {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|error| CoreError::io_at("failed to list directory", dir, error))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();

    let [root] = entries.as_slice() else {
        return Ok(());
    };
    if !root.is_dir() {
        return Ok(());
    }

    let children = std::fs::read_dir(root)
        .map_err(|error| CoreError::io_at("failed to list directory", root, error))?;
    for child in children {
        let child = child.map_err(|error| CoreError::io_at("failed to read entry", root, error))?;
        let target = dir.join(child.file_name());
        std::fs::rename(child.path(), &target)
            .map_err(|error| CoreError::io_at("failed to hoist entry", &target, error))?;
    }
    std::fs::remove_dir(root)
        .map_err(|error| CoreError::io_at("failed to remove wrapper directory", root, error))?;
    debug!("Flattened {} into {}", root.display(), dir.display());
    Ok(())
}
