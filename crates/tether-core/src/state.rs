use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::fsutil;

/// Installed game version for one channel, persisted as `{"version": N}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    pub version: u32,
}

impl InstallState {
    /// Read the state file; a missing or unreadable file means version 0.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read install state {}: {error}", path.display());
                }
                return Self::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|error| {
            warn!("Ignoring corrupt install state {}: {error}", path.display());
            Self::default()
        })
    }

    /// Persist atomically so a crash never leaves a truncated file behind.
    ///
    /// # Errors
    /// Returns a filesystem error if the file cannot be written.
    pub fn save(self, path: &Path) -> CoreResult<()> {
        let json = serde_json::to_vec(&self)
            .map_err(|error| CoreError::json("failed to serialize install state", error))?;
        fsutil::write_atomic(path, &json)?;
        debug!("Saved install state {} -> {}", self.version, path.display());
        Ok(())
    }
}
