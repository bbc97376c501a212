use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{Endpoints, InstallRequest};
use tether_platform::AppPaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_channel")]
    pub channel: String,
    /// `0` follows the newest published version.
    #[serde(default)]
    pub game_version: u32,
    #[serde(default = "default_online_fix")]
    pub online_fix: bool,
    /// Nickname passed to the client on `launch`.
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub endpoints: Endpoints,
}

fn default_channel() -> String {
    "release".to_string()
}

fn default_online_fix() -> bool {
    true
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_http_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_delay() -> u64 {
    2000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            game_version: 0,
            online_fix: default_online_fix(),
            player_name: String::new(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
            http_timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry_delay_ms: default_retry_delay(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Settings {
    /// Read `settings.json`; a missing or unreadable file yields the defaults.
    pub fn load(paths: &AppPaths) -> Self {
        let settings_path = paths.settings_file();
        if !settings_path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&settings_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!(
                    "Ignoring corrupt settings file {}: {error}",
                    settings_path.display()
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), std::io::Error> {
        paths.ensure_dirs()?;

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.settings_file(), content)?;
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The install request these settings describe.
    pub fn install_request(&self) -> InstallRequest {
        let request =
            InstallRequest::latest(self.channel.clone()).with_online_fix(self.online_fix);
        if self.game_version == 0 {
            request
        } else {
            request.pinned(self.game_version)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether_core::Endpoints;
    use tether_platform::AppPaths;

    use super::Settings;

    #[test]
    fn settings_defaults_match_expected_values() {
        let settings = Settings::default();

        assert_eq!(settings.channel, "release");
        assert_eq!(settings.game_version, 0);
        assert!(settings.online_fix);
        assert!(settings.player_name.is_empty());
        assert!(!settings.debug_logging);
        assert_eq!(settings.max_log_size_bytes, 5 * 1024 * 1024);
        assert_eq!(settings.http_timeout_secs, 60);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.retry_delay_ms, 2000);
        assert_eq!(settings.endpoints, Endpoints::default());
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let value = json!({
            "channel": "beta",
            "endpoints": { "patch_origin": "http://127.0.0.1:8080/patches" }
        });

        let settings: Settings =
            serde_json::from_value(value).expect("settings JSON should deserialize");

        assert_eq!(settings.channel, "beta");
        assert!(settings.online_fix);
        assert_eq!(settings.endpoints.patch_origin, "http://127.0.0.1:8080/patches");
        assert_eq!(
            settings.endpoints.runtime_manifest,
            Endpoints::default().runtime_manifest
        );
    }

    #[test]
    fn load_falls_back_to_defaults_for_missing_or_corrupt_file() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = AppPaths::rooted_at(temp.path());

        assert_eq!(Settings::load(&paths).channel, "release");

        paths.ensure_dirs().expect("dirs should be created");
        std::fs::write(paths.settings_file(), "{ not json").expect("settings written");
        assert_eq!(Settings::load(&paths).channel, "release");
    }

    #[test]
    fn save_then_load_preserves_values() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = AppPaths::rooted_at(temp.path());
        let settings = Settings {
            channel: "beta".to_string(),
            game_version: 4,
            online_fix: false,
            player_name: "Steve".to_string(),
            ..Settings::default()
        };

        settings.save(&paths).expect("settings should save");
        let loaded = Settings::load(&paths);

        assert_eq!(loaded.channel, "beta");
        assert_eq!(loaded.game_version, 4);
        assert!(!loaded.online_fix);
        assert_eq!(loaded.player_name, "Steve");
    }

    #[test]
    fn install_request_pins_non_zero_version() {
        let latest = Settings::default().install_request();
        assert_eq!(latest.target_version, None);
        assert!(latest.online_fix);

        let pinned = Settings {
            game_version: 12,
            online_fix: false,
            ..Settings::default()
        }
        .install_request();
        assert_eq!(pinned.target_version, Some(12));
        assert!(!pinned.online_fix);
    }
}
