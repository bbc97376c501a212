//! Remote version discovery.
//!
//! The patch origin has no index, so the newest version is found by probing
//! `.../0/{v}.pwr` with HEAD requests: a fixed baseline, then either a short
//! linear scan or an exponential scan followed by a binary search. The origin
//! is assumed monotonic (if `v` exists, every `u < v` exists).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use tether_platform::Platform;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::endpoints::Endpoints;
use crate::error::{CoreError, CoreResult};

const BASELINE_VERSIONS: [u32; 6] = [100, 50, 25, 10, 5, 1];
const LINEAR_SCAN_THRESHOLD: u32 = 10;
const LINEAR_SCAN_SPAN: u32 = 50;
const LINEAR_SCAN_CEILING: u32 = 200;
pub const VERSION_CEILING: u32 = 500;

pub const DEFAULT_PROBE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("cannot reach server: {0}")]
    Unreachable(String),
    #[error("version {version} not found (HTTP {status})")]
    VersionNotFound { version: u32, status: u16 },
    #[error("server error (HTTP {status})")]
    ServerError { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("cannot reach game server or no versions available for {platform}")]
    NoVersions {
        platform: Platform,
        last_error: Option<String>,
    },
    #[error("version discovery was cancelled")]
    Cancelled,
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionProbeResult {
    pub latest_version: u32,
    pub checked_urls: Vec<String>,
    pub success_url: Option<String>,
    pub error: Option<DiscoveryError>,
}

impl VersionProbeResult {
    fn empty() -> Self {
        Self {
            latest_version: 0,
            checked_urls: Vec::new(),
            success_url: None,
            error: None,
        }
    }

    #[must_use]
    pub fn is_found(&self) -> bool {
        self.error.is_none() && self.latest_version > 0
    }
}

/// Cache key: one discovery per platform and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OracleKey {
    pub platform: Platform,
    pub channel: String,
}

impl OracleKey {
    pub fn new(platform: Platform, channel: impl Into<String>) -> Self {
        Self {
            platform,
            channel: channel.into(),
        }
    }
}

impl std::fmt::Display for OracleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.platform.os.as_str(),
            self.platform.arch.as_str(),
            self.channel
        )
    }
}

/// Answers "does this URL exist?" for the discovery algorithm.
#[async_trait]
pub trait ExistenceProbe: Send + Sync {
    /// HTTP status of a HEAD request for `url`, without following redirects.
    async fn status(&self, url: &str) -> Result<u16, ProbeError>;
}

/// [`ExistenceProbe`] backed by real HEAD requests.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// # Errors
    /// Returns a network error if the HTTP client cannot be built.
    pub fn new() -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("tether/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| CoreError::http("failed to build probe client", error))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ExistenceProbe for HttpProbe {
    async fn status(&self, url: &str) -> Result<u16, ProbeError> {
        self.client
            .head(url)
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|error| ProbeError::Unreachable(error.to_string()))
    }
}

struct CachedProbe {
    result: VersionProbeResult,
    stored_at: Instant,
}

pub struct VersionOracle {
    probe: Arc<dyn ExistenceProbe>,
    endpoints: Endpoints,
    probe_delay: Duration,
    ttl: Duration,
    cache: RwLock<HashMap<OracleKey, CachedProbe>>,
    probe_locks: std::sync::Mutex<HashMap<OracleKey, Arc<Mutex<()>>>>,
}

impl VersionOracle {
    pub fn new(probe: Arc<dyn ExistenceProbe>, endpoints: Endpoints) -> Self {
        Self {
            probe,
            endpoints,
            probe_delay: DEFAULT_PROBE_DELAY,
            ttl: DEFAULT_CACHE_TTL,
            cache: RwLock::new(HashMap::new()),
            probe_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Oracle probing the real origin over HTTP.
    ///
    /// # Errors
    /// Returns a network error if the probe client cannot be built.
    pub fn http(endpoints: Endpoints) -> CoreResult<Self> {
        Ok(Self::new(Arc::new(HttpProbe::new()?), endpoints))
    }

    #[must_use]
    pub fn with_probe_delay(mut self, probe_delay: Duration) -> Self {
        self.probe_delay = probe_delay;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Latest version for `key`, probing at most once per key per TTL.
    ///
    /// Failures are reported in [`VersionProbeResult::error`]; only successful
    /// results are cached so a transient outage does not pin a failure for the
    /// whole TTL.
    pub async fn find_latest(
        &self,
        key: &OracleKey,
        cancel: &CancellationToken,
    ) -> VersionProbeResult {
        if let Some(result) = self.cached(key).await {
            debug!("Using cached version for {key}: {}", result.latest_version);
            return result;
        }

        let lock = self.probe_lock(key);
        let _probing = lock.lock().await;

        if let Some(result) = self.cached(key).await {
            debug!("Using cached version for {key} (after lock): {}", result.latest_version);
            return result;
        }

        info!("Performing version check for {key}");
        let result = self.discover(key, cancel).await;
        if result.error.is_none() {
            self.cache.write().await.insert(
                key.clone(),
                CachedProbe {
                    result: result.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
        result
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        info!("Version cache cleared");
    }

    /// Check that one specific full-install patch exists.
    ///
    /// # Errors
    /// Returns [`ProbeError::VersionNotFound`] for any status but 200 and
    /// [`ProbeError::Unreachable`] on transport failure.
    pub async fn verify_version_exists(
        &self,
        platform: Platform,
        channel: &str,
        version: u32,
    ) -> Result<(), ProbeError> {
        let url = self.endpoints.probe_url(platform, channel, version);
        match self.probe.status(&url).await? {
            200 => Ok(()),
            status => Err(ProbeError::VersionNotFound { version, status }),
        }
    }

    async fn cached(&self, key: &OracleKey) -> Option<VersionProbeResult> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.result.clone())
    }

    fn probe_lock(&self, key: &OracleKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .probe_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    async fn discover(&self, key: &OracleKey, cancel: &CancellationToken) -> VersionProbeResult {
        let mut run = Discovery {
            oracle: self,
            key,
            cancel,
            result: VersionProbeResult::empty(),
            last_error: None,
        };
        if let Err(error) = run.search().await {
            run.result.error = Some(error);
        }
        info!("Latest version found for {key}: {}", run.result.latest_version);
        run.result
    }
}

impl std::fmt::Debug for VersionOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionOracle")
            .field("endpoints", &self.endpoints)
            .field("probe_delay", &self.probe_delay)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

struct Discovery<'a> {
    oracle: &'a VersionOracle,
    key: &'a OracleKey,
    cancel: &'a CancellationToken,
    result: VersionProbeResult,
    last_error: Option<String>,
}

impl Discovery<'_> {
    async fn search(&mut self) -> Result<(), DiscoveryError> {
        let Some(base) = self.find_base().await? else {
            return Err(DiscoveryError::NoVersions {
                platform: self.key.platform,
                last_error: self.last_error.take(),
            });
        };

        if base <= LINEAR_SCAN_THRESHOLD {
            self.linear_scan(base).await
        } else {
            self.exponential_then_binary(base).await
        }
    }

    async fn find_base(&mut self) -> Result<Option<u32>, DiscoveryError> {
        for version in BASELINE_VERSIONS {
            if self.exists(version).await? {
                debug!("Found base version {version}");
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    async fn linear_scan(&mut self, base: u32) -> Result<(), DiscoveryError> {
        let max = (base + LINEAR_SCAN_SPAN).min(LINEAR_SCAN_CEILING);
        for version in base + 1..=max {
            if !self.exists(version).await? {
                break;
            }
        }
        Ok(())
    }

    async fn exponential_then_binary(&mut self, base: u32) -> Result<(), DiscoveryError> {
        let mut current = base;
        let mut step = base;
        while current < VERSION_CEILING {
            let next = (current + step).min(VERSION_CEILING);
            if !self.exists(next).await? {
                break;
            }
            current = next;
            step = step.saturating_mul(2);
        }

        let mut low = self.result.latest_version;
        let mut high = current.saturating_add(step).min(VERSION_CEILING);
        if high > low {
            debug!("Binary search between {low} and {high}");
        }
        while low < high {
            let mid = (low + high).div_ceil(2);
            if self.exists(mid).await? {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        Ok(())
    }

    /// Probe one version, record the attempt and wait out the inter-request delay.
    async fn exists(&mut self, version: u32) -> Result<bool, DiscoveryError> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }

        let url = self
            .oracle
            .endpoints
            .probe_url(self.key.platform, &self.key.channel, version);
        self.result.checked_urls.push(url.clone());

        let found = match self.oracle.probe.status(&url).await {
            Ok(200) => true,
            Ok(_) => false,
            Err(error) => {
                warn!("Probe for version {version} failed: {error}");
                self.last_error = Some(error.to_string());
                false
            }
        };
        if found {
            self.result.latest_version = version;
            self.result.success_url = Some(url);
        }

        if !self.oracle.probe_delay.is_zero() {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(DiscoveryError::Cancelled),
                () = tokio::time::sleep(self.oracle.probe_delay) => {}
            }
        }
        Ok(found)
    }
}

/// HEAD `url` following redirects and report the round-trip time.
///
/// 4xx still proves the host is reachable; only 5xx and transport failures
/// are errors.
///
/// # Errors
/// Returns [`ProbeError::Unreachable`] or [`ProbeError::ServerError`].
pub async fn test_connection(client: &reqwest::Client, url: &str) -> Result<Duration, ProbeError> {
    let started = Instant::now();
    let response = client
        .head(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|error| ProbeError::Unreachable(error.to_string()))?;
    let status = response.status();
    if status.is_server_error() {
        return Err(ProbeError::ServerError {
            status: status.as_u16(),
        });
    }
    Ok(started.elapsed())
}
