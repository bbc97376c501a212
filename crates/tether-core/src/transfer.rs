//! Resumable HTTP downloads.
//!
//! A download streams into `<destination>.tmp` and is renamed into place only
//! once the body has been fully received. Retries within one call resume from
//! the partial file with a `Range` request.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::fsutil;
use crate::progress::{PROGRESS_INTERVAL, ProgressBus, ProgressEvent, Stage, Throttle, format_speed};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Suffix of a download that has not finished yet.
const TEMP_SUFFIX: &str = ".tmp";

/// Build the shared HTTP client.
///
/// There is no overall request timeout: patch files are large, so a stalled
/// transfer is caught by the per-read timeout instead.
///
/// # Errors
/// Returns a network error if the TLS backend cannot be initialised.
pub fn build_client(connect_timeout: Duration, read_timeout: Duration) -> CoreResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .user_agent(format!("tether/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| CoreError::http("failed to build HTTP client", error))
}

/// What a download is for, as shown to progress subscribers.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub stage: Stage,
    pub label: String,
    /// Share of the stage's 0..=100 range this download occupies.
    pub weight: f64,
}

impl DownloadRequest {
    pub fn new(stage: Stage, label: impl Into<String>) -> Self {
        Self {
            stage,
            label: label.into(),
            weight: 1.0,
        }
    }

    #[must_use]
    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight.clamp(0.0, 1.0);
        self
    }

    fn percent(&self, downloaded: u64, total: Option<u64>) -> f64 {
        match total {
            Some(total) if total > 0 => ratio(downloaded, total) * 100.0 * self.weight,
            _ => 0.0,
        }
    }
}

/// State of one in-flight download attempt.
#[derive(Debug)]
struct TransferJob<'a> {
    destination: &'a Path,
    source_url: &'a str,
    resume_offset: u64,
    total_size: Option<u64>,
    attempt: u32,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
}

impl Downloader {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Download `url` to `destination`, returning the number of bytes on disk.
    ///
    /// A partial file left by an earlier call or run is resumed with a range
    /// request. The server's answer decides whether it is still usable: `206`
    /// appends, `200` restarts from zero and `416` discards it.
    ///
    /// # Errors
    /// Returns the last attempt's error once every attempt has failed, or
    /// [`ErrorKind::Cancelled`] as soon as `cancel` fires. On cancellation the
    /// partial file is kept.
    pub async fn download(
        &self,
        destination: &Path,
        url: &str,
        request: &DownloadRequest,
        progress: &ProgressBus,
        cancel: &CancellationToken,
    ) -> CoreResult<u64> {
        let tmp = temp_path(destination);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| CoreError::io_at("failed to create directory", parent, error))?;
        }

        info!("Downloading {url}");
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                let delay = self.retry_delay * (attempt - 1);
                progress.emit(
                    ProgressEvent::new(
                        request.stage,
                        0.0,
                        format!("Retrying download (attempt {attempt}/{})...", self.attempts),
                    )
                    .with_file(request.label.clone()),
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(CoreError::cancelled("download")),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let mut job = TransferJob {
                destination,
                source_url: url,
                resume_offset: 0,
                total_size: None,
                attempt,
            };
            match self.run_attempt(&mut job, &tmp, request, progress, cancel).await {
                Ok(downloaded) => {
                    tokio::fs::rename(&tmp, destination).await.map_err(|error| {
                        CoreError::io_at("failed to move download into place", destination, error)
                    })?;
                    progress.emit(
                        ProgressEvent::new(
                            request.stage,
                            100.0 * request.weight,
                            format!("Downloaded {}", request.label),
                        )
                        .with_file(request.label.clone())
                        .with_transfer(None, downloaded, job.total_size.unwrap_or(downloaded)),
                    );
                    info!("Download complete: {downloaded} bytes -> {}", destination.display());
                    return Ok(downloaded);
                }
                Err(error) if error.kind() == ErrorKind::Cancelled => return Err(error),
                Err(error) => {
                    warn!(
                        "Download attempt {}/{} for {} failed: {error}",
                        job.attempt, self.attempts, job.source_url
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CoreError::network("download was not attempted"))
            .context(format!("failed to download {}", request.label)))
    }

    async fn run_attempt(
        &self,
        job: &mut TransferJob<'_>,
        tmp: &Path,
        request: &DownloadRequest,
        progress: &ProgressBus,
        cancel: &CancellationToken,
    ) -> CoreResult<u64> {
        job.resume_offset = tokio::fs::metadata(tmp).await.map_or(0, |meta| meta.len());

        let mut builder = self.client.get(job.source_url);
        if job.resume_offset > 0 {
            debug!("Resuming {} from byte {}", job.source_url, job.resume_offset);
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", job.resume_offset));
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CoreError::cancelled("download")),
            response = builder.send() => {
                response.map_err(|error| CoreError::http("download request failed", error))?
            }
        };

        let status = response.status();
        let content_length = response.content_length();
        let mut file = match status {
            StatusCode::PARTIAL_CONTENT if job.resume_offset > 0 => {
                job.total_size = content_length.map(|len| len + job.resume_offset);
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(tmp)
                    .await
                    .map_err(|error| CoreError::io_at("failed to reopen partial download", tmp, error))?
            }
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                if job.resume_offset > 0 {
                    debug!("Server ignored range request; restarting from zero");
                }
                job.resume_offset = 0;
                job.total_size = content_length;
                tokio::fs::File::create(tmp)
                    .await
                    .map_err(|error| CoreError::io_at("failed to create download file", tmp, error))?
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The partial file no longer matches the remote object.
                fsutil::remove_file_if_exists(tmp)
                    .map_err(|error| CoreError::io_at("failed to discard partial download", tmp, error))?;
                return Err(CoreError::network(format!("download failed with status {status}")));
            }
            _ => {
                return Err(CoreError::network(format!("download failed with status {status}")));
            }
        };

        let started = Instant::now();
        let mut throttle = Throttle::new(PROGRESS_INTERVAL);
        let mut downloaded = job.resume_offset;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(CoreError::cancelled("download"));
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|error| CoreError::http("download stream error", error))?;
            file.write_all(&chunk)
                .await
                .map_err(|error| CoreError::io_at("failed to write download data", tmp, error))?;
            downloaded += chunk.len() as u64;

            if throttle.ready(Instant::now()) {
                let attempt_bytes = downloaded - job.resume_offset;
                let speed = rate(attempt_bytes, started.elapsed()).map(format_speed);
                progress.emit(
                    ProgressEvent::new(
                        request.stage,
                        request.percent(downloaded, job.total_size),
                        format!("Downloading {}...", request.label),
                    )
                    .with_file(request.label.clone())
                    .with_transfer(speed, downloaded, job.total_size.unwrap_or(0)),
                );
            }
        }

        file.flush()
            .await
            .map_err(|error| CoreError::io_at("failed to flush download file", tmp, error))?;
        file.sync_all()
            .await
            .map_err(|error| CoreError::io_at("failed to sync download file", tmp, error))?;

        if let Some(total) = job.total_size
            && downloaded < total
        {
            return Err(CoreError::network(format!(
                "download ended early ({downloaded} of {total} bytes)"
            )));
        }

        debug!(
            "Attempt {} wrote {} bytes for {}",
            job.attempt,
            downloaded,
            job.destination.display()
        );
        Ok(downloaded)
    }
}

/// Where a download lives until it is complete.
#[must_use]
pub fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    part as f64 / whole as f64
}

#[allow(clippy::cast_precision_loss)]
fn rate(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.0).then(|| bytes as f64 / secs)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{DownloadRequest, Downloader, temp_path};
    use crate::error::ErrorKind;
    use crate::progress::{ProgressBus, Stage};

    fn downloader() -> Downloader {
        Downloader::new(reqwest::Client::new()).with_retry_delay(Duration::ZERO)
    }

    fn payload() -> Vec<u8> {
        (0..64_u8).cycle().take(16 * 1024).collect()
    }

    #[tokio::test]
    async fn download_writes_destination_and_removes_temp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/4.pwr"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("cache").join("0-4.pwr");
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();

        let written = downloader()
            .download(
                &dest,
                &format!("{}/files/4.pwr", server.uri()),
                &DownloadRequest::new(Stage::Pwr, "4.pwr"),
                &bus,
                &CancellationToken::new(),
            )
            .await
            .expect("download should succeed");

        assert_eq!(written, payload().len() as u64);
        assert_eq!(std::fs::read(&dest).expect("dest readable"), payload());
        assert!(!temp_path(&dest).exists());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        let last = last.expect("a completion event should be emitted");
        assert!((last.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(last.downloaded, payload().len() as u64);
    }

    #[tokio::test]
    async fn weighted_request_caps_completion_percent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip".to_vec()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();

        downloader()
            .download(
                &temp.path().join("online-fix.zip"),
                &server.uri(),
                &DownloadRequest::new(Stage::OnlineFix, "online-fix.zip").weighted(0.7),
                &bus,
                &CancellationToken::new(),
            )
            .await
            .expect("download should succeed");

        let mut max = 0.0_f64;
        while let Ok(event) = rx.try_recv() {
            max = max.max(event.progress);
        }
        assert!((max - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn resume_appends_on_partial_content() {
        let server = MockServer::start().await;
        let body = payload();
        let split = 5000;
        Mock::given(method("GET"))
            .and(header("range", format!("bytes={split}-").as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body[split..].to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("7.pwr");
        let tmp = temp_path(&dest);
        std::fs::write(&tmp, &body[..split]).expect("partial should be seeded");

        downloader()
            .download(
                &dest,
                &server.uri(),
                &DownloadRequest::new(Stage::Pwr, "7.pwr"),
                &ProgressBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("resumed download should succeed");

        assert_eq!(std::fs::read(&dest).expect("dest readable"), body);
    }

    #[tokio::test]
    async fn full_response_to_range_request_truncates_partial() {
        let server = MockServer::start().await;
        let body = payload();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("7.pwr");
        let tmp = temp_path(&dest);
        std::fs::write(&tmp, b"stale bytes that are not a prefix").expect("partial should be seeded");

        downloader()
            .download(
                &dest,
                &server.uri(),
                &DownloadRequest::new(Stage::Pwr, "7.pwr"),
                &ProgressBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("restarted download should succeed");

        assert_eq!(std::fs::read(&dest).expect("dest readable"), body);
    }

    #[tokio::test]
    async fn cancelled_download_resumes_on_next_call() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..=255_u8).cycle().take(10_000).collect();
        let split = 4000;
        Mock::given(method("GET"))
            .and(header("range", format!("bytes={split}-").as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body[split..].to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("cache").join("0-1.pwr");
        let url = format!("{}/linux/amd64/release/0/1.pwr", server.uri());
        let request = DownloadRequest::new(Stage::Pwr, "1.pwr");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = downloader()
            .download(&dest, &url, &request, &ProgressBus::new(), &cancel)
            .await
            .expect_err("cancelled download should fail");
        assert_eq!(error.kind(), ErrorKind::Cancelled);

        // What an interrupted transfer leaves behind.
        std::fs::write(temp_path(&dest), &body[..split]).expect("partial should be seeded");

        let written = downloader()
            .download(&dest, &url, &request, &ProgressBus::new(), &CancellationToken::new())
            .await
            .expect("second call should resume");

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).expect("dest readable"), body);
        assert!(!temp_path(&dest).exists());
        let ranged = server
            .received_requests()
            .await
            .expect("request recording is enabled")
            .iter()
            .filter(|request| request.headers.contains_key("range"))
            .count();
        assert_eq!(ranged, 1);
    }

    #[tokio::test]
    async fn unsatisfiable_range_discards_partial_and_refetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=9-"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("jre.tar.gz");
        std::fs::write(temp_path(&dest), b"too long!").expect("stale partial should be seeded");

        downloader()
            .download(
                &dest,
                &server.uri(),
                &DownloadRequest::new(Stage::Jre, "jre.tar.gz"),
                &ProgressBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("download should succeed after discarding the partial");

        assert_eq!(std::fs::read(&dest).expect("dest readable"), b"fresh");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("butler.zip");
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe();

        downloader()
            .download(
                &dest,
                &server.uri(),
                &DownloadRequest::new(Stage::Butler, "butler.zip"),
                &bus,
                &CancellationToken::new(),
            )
            .await
            .expect("third attempt should succeed");

        let mut retries = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.message.starts_with("Retrying download") {
                retries.push(event.message);
            }
        }
        assert_eq!(
            retries,
            vec![
                "Retrying download (attempt 2/3)...".to_string(),
                "Retrying download (attempt 3/3)...".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_report_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let dest = temp.path().join("3.pwr");

        let error = downloader()
            .download(
                &dest,
                &server.uri(),
                &DownloadRequest::new(Stage::Pwr, "3.pwr"),
                &ProgressBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("every attempt fails");

        assert_eq!(error.kind(), ErrorKind::Network);
        assert!(error.user_message().contains("3.pwr"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"never".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = downloader()
            .download(
                &temp.path().join("x.pwr"),
                &server.uri(),
                &DownloadRequest::new(Stage::Pwr, "x.pwr"),
                &ProgressBus::new(),
                &cancel,
            )
            .await
            .expect_err("cancelled download should fail");

        assert_eq!(error.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn temp_path_appends_suffix() {
        let dest = std::path::Path::new("/cache/0-3.pwr");
        assert_eq!(temp_path(dest), std::path::PathBuf::from("/cache/0-3.pwr.tmp"));
    }
}
