use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_platform::Platform;

use crate::error::{CoreError, CoreResult};

/// A downloadable file published by a metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl RemoteAsset {
    /// Published digest, treating an empty string as "not published".
    #[must_use]
    pub fn checksum(&self) -> Option<&str> {
        self.sha256.as_deref().filter(|digest| !digest.trim().is_empty())
    }

    /// Last path segment of the URL, for display and cache file names.
    #[must_use]
    pub fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or("download")
    }
}

/// `{os: {arch: asset}}` lookup table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformAssets(HashMap<String, HashMap<String, RemoteAsset>>);

impl PlatformAssets {
    #[must_use]
    pub fn get(&self, platform: Platform) -> Option<&RemoteAsset> {
        self.0
            .get(platform.os.as_str())?
            .get(platform.arch.as_str())
    }

    /// Like [`get`](Self::get), but an error names the missing platform.
    ///
    /// # Errors
    /// Returns a validation error when no asset is published for `platform`.
    pub fn require(&self, platform: Platform, what: &str) -> CoreResult<&RemoteAsset> {
        self.get(platform).ok_or_else(|| {
            CoreError::validation(format!("no {what} published for {platform}"))
        })
    }
}

impl FromIterator<(Platform, RemoteAsset)> for PlatformAssets {
    fn from_iter<I: IntoIterator<Item = (Platform, RemoteAsset)>>(iter: I) -> Self {
        let mut table: HashMap<String, HashMap<String, RemoteAsset>> = HashMap::new();
        for (platform, asset) in iter {
            table
                .entry(platform.os.as_str().to_string())
                .or_default()
                .insert(platform.arch.as_str().to_string(), asset);
        }
        Self(table)
    }
}

/// Runtime dependency feed: `{"version": "...", "download_url": {os: {arch: asset}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeManifest {
    pub version: String,
    pub download_url: PlatformAssets,
}

/// Launcher and helper release feed: `{"version": "...", os: {arch: asset}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFeed {
    pub version: String,
    #[serde(flatten)]
    pub platforms: PlatformAssets,
}

/// GET `url` and decode its JSON body.
///
/// # Errors
/// Returns a network error on transport failure or non-success status, and a
/// validation error when the body does not decode as `T`.
pub async fn fetch_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    what: &str,
) -> CoreResult<T> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|error| CoreError::http(&format!("failed to fetch {what}"), error))?;

    let status = response.status();
    if !status.is_success() {
        let body_snippet = response
            .text()
            .await
            .ok()
            .map(|body| response_snippet(&body, 160))
            .unwrap_or_default();
        return Err(CoreError::network(format!("failed to fetch {what}: HTTP {status}"))
            .with_detail(format!("{url}{body_snippet}")));
    }

    response
        .json()
        .await
        .map_err(|error| CoreError::http(&format!("failed to parse {what}"), error))
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

#[cfg(test)]
mod tests {
    use tether_platform::{Arch, Os, Platform};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{PlatformAssets, ReleaseFeed, RemoteAsset, RuntimeManifest, fetch_json};
    use crate::error::ErrorKind;

    const JRE_JSON: &str = r#"{
        "version": "21.0.5",
        "download_url": {
            "linux": {"amd64": {"url": "https://cdn.example/jre-linux.tar.gz", "sha256": "abc"}},
            "windows": {"amd64": {"url": "https://cdn.example/jre-win.zip"}}
        }
    }"#;

    #[test]
    fn runtime_manifest_looks_up_platform_asset() {
        let manifest: RuntimeManifest =
            serde_json::from_str(JRE_JSON).expect("manifest should parse");

        let linux = manifest
            .download_url
            .get(Platform::new(Os::Linux, Arch::Amd64))
            .expect("linux asset should exist");
        assert_eq!(linux.file_name(), "jre-linux.tar.gz");
        assert_eq!(linux.checksum(), Some("abc"));

        let windows = manifest
            .download_url
            .get(Platform::new(Os::Windows, Arch::Amd64))
            .expect("windows asset should exist");
        assert_eq!(windows.checksum(), None);

        let error = manifest
            .download_url
            .require(Platform::new(Os::Darwin, Arch::Arm64), "Java runtime")
            .expect_err("darwin is not published");
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(error.user_message().contains("darwin/arm64"));
    }

    #[test]
    fn release_feed_flattens_platform_keys() {
        let feed: ReleaseFeed = serde_json::from_str(
            r#"{"version":"0.5.0","linux":{"amd64":{"url":"https://x/tether","sha256":""}}}"#,
        )
        .expect("feed should parse");

        assert_eq!(feed.version, "0.5.0");
        let asset = feed
            .platforms
            .get(Platform::new(Os::Linux, Arch::Amd64))
            .expect("linux asset");
        assert_eq!(asset.checksum(), None, "empty digest means unpublished");
    }

    #[test]
    fn platform_assets_collect_from_pairs() {
        let assets: PlatformAssets = [(
            Platform::new(Os::Windows, Arch::Amd64),
            RemoteAsset {
                url: "https://x/a.zip?sig=1".to_string(),
                sha256: None,
            },
        )]
        .into_iter()
        .collect();

        let asset = assets
            .get(Platform::new(Os::Windows, Arch::Amd64))
            .expect("asset should be present");
        assert_eq!(asset.file_name(), "a.zip");
    }

    #[tokio::test]
    async fn fetch_json_reports_status_failures_as_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jre.json"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let error = fetch_json::<RuntimeManifest>(
            &reqwest::Client::new(),
            &format!("{}/jre.json", server.uri()),
            "runtime manifest",
        )
        .await
        .expect_err("503 should fail");

        assert_eq!(error.kind(), ErrorKind::Network);
        assert!(error.technical_detail().unwrap_or_default().contains("maintenance"));
    }

    #[tokio::test]
    async fn fetch_json_reports_bad_body_as_validation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let error = fetch_json::<RuntimeManifest>(&reqwest::Client::new(), &server.uri(), "feed")
            .await
            .expect_err("garbage should fail");

        assert_eq!(error.kind(), ErrorKind::Validation);
    }
}
