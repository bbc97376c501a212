//! Self-contained troubleshooting report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::layout::InstallLayout;
use crate::oracle::{OracleKey, VersionOracle, test_connection};
use crate::state::InstallState;

const MAX_REPORTED_URLS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    pub app_version: String,
    pub platform: PlatformInfo,
    pub connectivity: ConnectivityInfo,
    pub local_installation: InstallationInfo,
    pub server_versions: ServerVersionInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub num_cpu: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectivityInfo {
    pub can_reach_game_server: bool,
    pub can_reach_tool_server: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_server_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_server_error: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallationInfo {
    pub game_installed: bool,
    pub current_version: u32,
    pub install_path: String,
    pub runtime_installed: bool,
    pub tool_installed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerVersionInfo {
    pub latest_version: u32,
    pub found_versions: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checked_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collect connectivity, local install and remote version information for
/// `channel`. Never fails: every problem ends up inside the report.
pub async fn run_diagnostics(
    client: &reqwest::Client,
    oracle: &VersionOracle,
    layout: &InstallLayout,
    channel: &str,
    cancel: &CancellationToken,
) -> DiagnosticReport {
    let platform = layout.platform();
    DiagnosticReport {
        timestamp: Utc::now(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: PlatformInfo {
            os: platform.os.as_str().to_string(),
            arch: platform.arch.as_str().to_string(),
            num_cpu: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        },
        connectivity: check_connectivity(client, oracle).await,
        local_installation: check_local_installation(layout, channel),
        server_versions: check_server_versions(oracle, layout, channel, cancel).await,
    }
}

async fn check_connectivity(client: &reqwest::Client, oracle: &VersionOracle) -> ConnectivityInfo {
    let endpoints = oracle.endpoints();
    let started = std::time::Instant::now();
    let game = test_connection(client, &endpoints.patch_origin).await;
    let tool = test_connection(client, &endpoints.tool_base).await;

    ConnectivityInfo {
        can_reach_game_server: game.is_ok(),
        can_reach_tool_server: tool.is_ok(),
        game_server_error: game.err().map(|error| error.to_string()),
        tool_server_error: tool.err().map(|error| error.to_string()),
        response_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

fn check_local_installation(layout: &InstallLayout, channel: &str) -> InstallationInfo {
    let game_dir = layout.game_dir(channel, None);
    InstallationInfo {
        game_installed: layout.client_marker(&game_dir).is_file(),
        current_version: InstallState::load(&layout.state_file(channel)).version,
        install_path: game_dir.display().to_string(),
        runtime_installed: layout.java_bin().is_file(),
        tool_installed: layout.tool_bin().is_file(),
    }
}

async fn check_server_versions(
    oracle: &VersionOracle,
    layout: &InstallLayout,
    channel: &str,
    cancel: &CancellationToken,
) -> ServerVersionInfo {
    let result = oracle
        .find_latest(&OracleKey::new(layout.platform(), channel), cancel)
        .await;
    ServerVersionInfo {
        latest_version: result.latest_version,
        found_versions: result.is_found(),
        checked_urls: result
            .checked_urls
            .into_iter()
            .take(MAX_REPORTED_URLS)
            .collect(),
        error: result.error.map(|error| error.to_string()),
    }
}

impl DiagnosticReport {
    /// # Errors
    /// Returns a validation error if serialization fails.
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|error| CoreError::json("failed to serialize diagnostic report", error))
    }
}

impl std::fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Tether Diagnostic Report ===")?;
        writeln!(f, "Generated: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "App Version: {}", self.app_version)?;

        writeln!(f, "\n--- Platform Information ---")?;
        writeln!(f, "OS: {}", self.platform.os)?;
        writeln!(f, "Architecture: {}", self.platform.arch)?;
        writeln!(f, "CPUs: {}", self.platform.num_cpu)?;

        let connectivity = &self.connectivity;
        writeln!(f, "\n--- Connectivity ---")?;
        writeln!(f, "Game Server Reachable: {}", connectivity.can_reach_game_server)?;
        writeln!(f, "Tool Server Reachable: {}", connectivity.can_reach_tool_server)?;
        writeln!(f, "Response Time: {}ms", connectivity.response_time_ms)?;
        if let Some(error) = &connectivity.game_server_error {
            writeln!(f, "Game Server Error: {error}")?;
        }
        if let Some(error) = &connectivity.tool_server_error {
            writeln!(f, "Tool Server Error: {error}")?;
        }

        let local = &self.local_installation;
        writeln!(f, "\n--- Local Installation ---")?;
        writeln!(f, "Install Path: {}", local.install_path)?;
        writeln!(f, "Game Installed: {}", local.game_installed)?;
        writeln!(f, "Current Version: {}", local.current_version)?;
        writeln!(f, "Runtime Installed: {}", local.runtime_installed)?;
        writeln!(f, "Patch Tool Installed: {}", local.tool_installed)?;

        let server = &self.server_versions;
        writeln!(f, "\n--- Server Versions ---")?;
        writeln!(f, "Latest Version Found: {}", server.latest_version)?;
        writeln!(f, "Versions Available: {}", server.found_versions)?;
        if let Some(error) = &server.error {
            writeln!(f, "Error: {error}")?;
        }
        if !server.checked_urls.is_empty() {
            writeln!(f, "Sample URLs checked:")?;
            for url in &server.checked_urls {
                writeln!(f, "  - {url}")?;
            }
        }

        Ok(())
    }
}
