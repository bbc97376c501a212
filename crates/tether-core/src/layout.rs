use std::path::{Path, PathBuf};

use tether_platform::{AppPaths, Platform};

pub const LATEST_DIR_NAME: &str = "latest";
const STAGING_DIR_NAME: &str = "staging-temp";
const CLIENT_STEM: &str = "HytaleClient";

/// On-disk layout of the runtime, the patch tool and the game trees.
///
/// ```text
/// <data>/jre/latest/bin/java[.exe]
/// <data>/tools/butler/butler[.exe]
/// <data>/<channel>/version.json
/// <data>/<channel>/package/game/<latest|N>/Client/HytaleClient[.exe]
/// <data>/<channel>/package/game/staging-temp/
/// <data>/logs/butler_apply.log
/// <data>/UserData/
/// <cache>/...
/// ```
#[derive(Debug, Clone)]
pub struct InstallLayout {
    data_dir: PathBuf,
    cache_dir: PathBuf,
    platform: Platform,
}

impl InstallLayout {
    #[must_use]
    pub fn new(paths: &AppPaths, platform: Platform) -> Self {
        Self {
            data_dir: paths.data_dir.clone(),
            cache_dir: paths.cache_dir.clone(),
            platform,
        }
    }

    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("jre").join(LATEST_DIR_NAME)
    }

    #[must_use]
    pub fn java_bin(&self) -> PathBuf {
        self.runtime_dir()
            .join("bin")
            .join(self.platform.exe_name("java"))
    }

    #[must_use]
    pub fn tool_dir(&self) -> PathBuf {
        self.data_dir.join("tools").join("butler")
    }

    #[must_use]
    pub fn tool_bin(&self) -> PathBuf {
        self.tool_dir().join(self.platform.exe_name("butler"))
    }

    /// Saves and settings the game client keeps between versions.
    #[must_use]
    pub fn user_data_dir(&self) -> PathBuf {
        self.data_dir.join("UserData")
    }

    #[must_use]
    pub fn patch_log(&self) -> PathBuf {
        self.logs_dir().join("butler_apply.log")
    }

    #[must_use]
    pub fn state_file(&self, channel: &str) -> PathBuf {
        self.data_dir.join(channel).join("version.json")
    }

    #[must_use]
    pub fn games_root(&self, channel: &str) -> PathBuf {
        self.data_dir.join(channel).join("package").join("game")
    }

    /// `latest` when following the newest version, otherwise the pinned number.
    #[must_use]
    pub fn game_dir(&self, channel: &str, pinned: Option<u32>) -> PathBuf {
        let name = pinned.map_or_else(|| LATEST_DIR_NAME.to_string(), |version| version.to_string());
        self.games_root(channel).join(name)
    }

    #[must_use]
    pub fn staging_dir(&self, channel: &str) -> PathBuf {
        self.games_root(channel).join(STAGING_DIR_NAME)
    }

    /// File whose presence proves a game tree is complete.
    #[must_use]
    pub fn client_marker(&self, game_dir: &Path) -> PathBuf {
        game_dir
            .join("Client")
            .join(self.platform.exe_name(CLIENT_STEM))
    }

    #[must_use]
    pub fn server_launcher(&self, game_dir: &Path) -> PathBuf {
        game_dir.join("Server").join("start-server.bat")
    }

    #[must_use]
    pub fn patch_cache_file(&self, from: u32, to: u32) -> PathBuf {
        self.cache_dir.join(format!("{from}-{to}.pwr"))
    }
}
