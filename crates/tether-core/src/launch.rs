//! Starting an installed game client in offline mode.

use std::path::Path;
use std::process::Stdio;

use log::info;
use tether_platform::Os;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::layout::InstallLayout;
use crate::progress::{ProgressBus, Stage};

pub const MAX_PLAYER_NAME_CHARS: usize = 16;

/// Trimmed nickname, or a validation error the user can act on.
///
/// # Errors
/// Returns [`ErrorKind::Validation`](crate::ErrorKind::Validation) for an
/// empty or overlong name.
pub fn validate_player_name(name: &str) -> CoreResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::validation("Please enter a nickname"));
    }
    if name.chars().count() > MAX_PLAYER_NAME_CHARS {
        return Err(CoreError::validation(format!(
            "Nickname is too long (max {MAX_PLAYER_NAME_CHARS} characters)"
        )));
    }
    Ok(name)
}

/// Name-based (MD5, nil namespace) id over `OfflinePlayer:<name>`, so a
/// nickname keeps its saves across launches.
#[must_use]
pub fn offline_uuid(player_name: &str) -> Uuid {
    let name = format!("OfflinePlayer:{}", player_name.trim());
    Uuid::new_v3(&Uuid::nil(), name.as_bytes())
}

/// Whether the desktop session runs Wayland, read through `var`.
pub fn is_wayland_session(var: impl Fn(&str) -> Option<String>) -> bool {
    var("WAYLAND_DISPLAY").is_some_and(|display| !display.is_empty())
        || var("XDG_SESSION_TYPE").as_deref() == Some("wayland")
}

/// The client invocation for `game_dir`. `wayland` only matters on Linux,
/// where it selects SDL's Wayland backend.
#[must_use]
pub fn client_command(
    layout: &InstallLayout,
    game_dir: &Path,
    player_name: &str,
    wayland: bool,
) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(layout.client_marker(game_dir));
    command
        .arg("--app-dir")
        .arg(game_dir)
        .arg("--user-dir")
        .arg(layout.user_data_dir())
        .arg("--java-exec")
        .arg(layout.java_bin())
        .arg("--auth-mode")
        .arg("offline")
        .arg("--uuid")
        .arg(offline_uuid(player_name).to_string())
        .arg("--name")
        .arg(player_name)
        .stdin(Stdio::null());
    if wayland && layout.platform().os == Os::Linux {
        command.env("SDL_VIDEODRIVER", "wayland");
    }
    command
}

/// Start the client installed for `channel` and return its process.
///
/// # Errors
/// Returns a validation error for a bad nickname, an install error when the
/// selected tree has no client and a filesystem error if it cannot start.
pub fn launch_game(
    layout: &InstallLayout,
    channel: &str,
    target_version: Option<u32>,
    player_name: &str,
    progress: &ProgressBus,
) -> CoreResult<tokio::process::Child> {
    let player_name = validate_player_name(player_name)?;
    let game_dir = layout.game_dir(channel, target_version);
    let client = layout.client_marker(&game_dir);
    if !client.is_file() {
        return Err(CoreError::install(format!(
            "game is not installed: {} not found",
            client.display()
        )));
    }

    let user_dir = layout.user_data_dir();
    std::fs::create_dir_all(&user_dir)
        .map_err(|error| CoreError::io_at("failed to create user data directory", &user_dir, error))?;

    let wayland = is_wayland_session(|name| std::env::var(name).ok());
    if wayland && layout.platform().os == Os::Linux {
        info!("Wayland session detected, setting SDL_VIDEODRIVER=wayland");
    }

    progress.report(Stage::Launch, 100.0, "Launching game...");
    info!(
        "Launching {player_name} from {} with user data at {}",
        game_dir.display(),
        user_dir.display()
    );
    client_command(layout, &game_dir, player_name, wayland)
        .spawn()
        .map_err(|error| CoreError::io_at("failed to start game client", &client, error))
}
