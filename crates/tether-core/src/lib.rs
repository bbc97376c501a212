//! Update and install orchestration for the Tether launcher.
//!
//! This crate is independent of any front end:
//! - Remote version discovery against the index-less patch origin.
//! - Resumable, retried downloads with progress events.
//! - Runtime, patch tool and game installation under a single-flight guard.
//! - Offline launch of an installed client.
//! - Launcher self-update and the executable swap run by the update helper.
//! - Diagnostics and startup cleanup.

mod archive;
mod checksum;
mod cleanup;
mod diagnostics;
mod endpoints;
mod error;
mod fsutil;
mod installer;
mod launch;
mod layout;
mod metadata;
mod online_fix;
mod oracle;
mod patch;
pub mod progress;
mod replace;
mod runtime;
pub mod self_update;
mod state;
mod tool;
mod transfer;

/// Archive extraction for runtime, tool and overlay downloads.
pub use archive::{ArchiveFormat, extract, flatten_single_root};
/// SHA-256 helpers for published digests.
pub use checksum::{sha256_file, verify_sha256, verify_sha256_in_background};
/// Best-effort removal of what interrupted runs leave behind.
pub use cleanup::{CleanupReport, cleanup_launcher};
/// Troubleshooting report.
pub use diagnostics::{DiagnosticReport, run_diagnostics};
/// Remote locations, overridable from settings.
pub use endpoints::Endpoints;
/// Tagged error carried across the core.
pub use error::{CoreError, CoreResult, ErrorKind, ErrorReport, ResultExt};
/// The install sequence and its request/outcome types.
pub use installer::{AvailableVersions, InstallOutcome, InstallRequest, Installer};
/// Starting an installed client.
pub use launch::{
    MAX_PLAYER_NAME_CHARS, client_command, is_wayland_session, launch_game, offline_uuid,
    validate_player_name,
};
/// On-disk layout of everything the launcher installs.
pub use layout::InstallLayout;
/// Remote metadata documents.
pub use metadata::{PlatformAssets, ReleaseFeed, RemoteAsset, RuntimeManifest, fetch_json};
pub use online_fix::{apply_online_fix, needs_online_fix};
/// Version discovery and origin probing.
pub use oracle::{
    DiscoveryError, ExistenceProbe, HttpProbe, OracleKey, ProbeError, VersionOracle,
    VersionProbeResult, test_connection,
};
pub use patch::{PatchJob, apply_patch, download_patch};
pub use progress::{ERROR_CHANNEL, PROGRESS_CHANNEL, ProgressBus, ProgressEvent, Stage};
/// Executable swap performed by the update helper.
pub use replace::{
    DetachedRelauncher, ReplaceError, ReplacePolicy, Relauncher, backup_path, perform_replace,
};
pub use runtime::{DependencyStatus, ensure_runtime};
pub use state::InstallState;
pub use tool::ensure_patch_tool;
/// Resumable downloads.
pub use transfer::{DownloadRequest, Downloader, build_client, temp_path};
