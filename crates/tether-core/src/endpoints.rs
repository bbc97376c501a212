use serde::{Deserialize, Serialize};
use tether_platform::{Os, Platform};

const RELEASES_BASE: &str = "https://github.com/tether-launcher/tether/releases/latest/download";

/// Every remote location the core talks to.
///
/// Defaults point at the production origins; settings may override any of
/// them, which is also how tests aim the core at a local mock server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub patch_origin: String,
    pub runtime_manifest: String,
    pub tool_base: String,
    pub release_feed: String,
    pub helper_feed: String,
    pub online_fix: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            patch_origin: "https://game-patches.hytale.com/patches".to_string(),
            runtime_manifest: "https://launcher.hytale.com/version/release/jre.json".to_string(),
            tool_base: "https://broth.itch.zone/butler".to_string(),
            release_feed: format!("{RELEASES_BASE}/version.json"),
            helper_feed: format!("{RELEASES_BASE}/helper.json"),
            online_fix: format!("{RELEASES_BASE}/online-fix.zip"),
        }
    }
}

impl Endpoints {
    /// `{origin}/{os}/{arch}/{channel}/{from}/{to}.pwr`
    #[must_use]
    pub fn patch_url(&self, platform: Platform, channel: &str, from: u32, to: u32) -> String {
        format!(
            "{}/{}/{}/{channel}/{from}/{to}.pwr",
            self.patch_origin.trim_end_matches('/'),
            platform.os.as_str(),
            platform.arch.as_str(),
        )
    }

    /// Full-install patch URL used by version discovery.
    #[must_use]
    pub fn probe_url(&self, platform: Platform, channel: &str, version: u32) -> String {
        self.patch_url(platform, channel, 0, version)
    }

    /// The tool is only published for amd64; arm64 hosts run it under emulation.
    #[must_use]
    pub fn tool_url(&self, os: Os) -> String {
        format!(
            "{}/{}-amd64/LATEST/archive/default",
            self.tool_base.trim_end_matches('/'),
            os.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use tether_platform::{Arch, Os, Platform};

    use super::Endpoints;

    #[test]
    fn patch_url_follows_origin_layout() {
        let endpoints = Endpoints::default();
        let platform = Platform::new(Os::Windows, Arch::Amd64);

        assert_eq!(
            endpoints.patch_url(platform, "release", 3, 7),
            "https://game-patches.hytale.com/patches/windows/amd64/release/3/7.pwr"
        );
        assert_eq!(
            endpoints.probe_url(platform, "pre-release", 25),
            "https://game-patches.hytale.com/patches/windows/amd64/pre-release/0/25.pwr"
        );
    }

    #[test]
    fn trailing_slash_in_override_is_ignored() {
        let endpoints = Endpoints {
            tool_base: "http://127.0.0.1:9000/butler/".to_string(),
            ..Endpoints::default()
        };
        assert_eq!(
            endpoints.tool_url(Os::Linux),
            "http://127.0.0.1:9000/butler/linux-amd64/LATEST/archive/default"
        );
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let endpoints: Endpoints =
            serde_json::from_str(r#"{"patch_origin":"http://localhost/patches"}"#)
                .expect("partial endpoints should parse");
        assert_eq!(endpoints.patch_origin, "http://localhost/patches");
        assert_eq!(endpoints.runtime_manifest, Endpoints::default().runtime_manifest);
    }
}
