use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult, ErrorKind};

/// Hex SHA-256 of a file's contents.
///
/// # Errors
/// Returns a filesystem error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> CoreResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|error| CoreError::io_at("failed to open file for checksum", path, error))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| CoreError::io_at("failed to read file for checksum", path, error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file against a published digest.
///
/// Accepts bare hex or `sha256:<hex>`. The file is left in place either way;
/// deleting a corrupt download is the caller's decision.
///
/// # Errors
/// Returns a validation error on mismatch or malformed digest, and a
/// filesystem error if the file cannot be read.
pub fn verify_sha256(path: &Path, expected: &str) -> CoreResult<()> {
    let expected = normalize_sha256(expected).ok_or_else(|| {
        CoreError::validation(format!("published checksum is not a SHA-256 digest: {expected}"))
    })?;
    let actual = sha256_file(path)?;

    if actual == expected {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "SHA256 mismatch for {}",
            path.file_name()
                .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
        ))
        .with_detail(format!("expected {expected} got {actual}")))
    }
}

/// [`verify_sha256`] on the blocking pool, for archives large enough to stall
/// the runtime while hashing.
///
/// # Errors
/// As [`verify_sha256`].
pub async fn verify_sha256_in_background(path: PathBuf, expected: String) -> CoreResult<()> {
    tokio::task::spawn_blocking(move || verify_sha256(&path, &expected))
        .await
        .map_err(|error| {
            CoreError::new(ErrorKind::Unknown, "checksum task failed").with_source(error)
        })?
}

pub(crate) fn normalize_sha256(digest: &str) -> Option<String> {
    let digest = digest.trim();
    let hash = match digest.split_once(':') {
        Some((algorithm, hash)) if algorithm.eq_ignore_ascii_case("sha256") => hash,
        Some(_) => return None,
        None => digest,
    };
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}
