//! Payload downloader.
//!
//! Streams a payload into a temp file in the staging directory with:
//! - resume through `Range` requests when the server advertises support
//! - bounded exponential backoff for transient failures
//! - cooperative cancellation between chunks
//! - progress reporting
//!
//! The temp file is deleted whenever `fetch` returns an error, so a
//! cancelled or failed transfer leaves nothing behind.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, TransportError};
use crate::transport::{HttpTransport, PayloadRequest};

/// Default attempt ceiling per download.
const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default delay before the first retry.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default upper bound on the retry delay.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

const RANGE_NOT_SATISFIABLE: u16 = 416;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Ceiling for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Configuration for the downloader.
#[derive(Debug, Clone, Default)]
pub struct DownloaderConfig {
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// Accept plain `http` URLs.
    pub allow_insecure_http: bool,
}

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download, 0 if unknown.
    pub total: u64,
}

impl DownloadProgress {
    /// Create a new progress instance.
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    /// Get download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }

    /// Check if the download is complete.
    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }

    /// Get remaining bytes to download.
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.total == 0 {
            return write!(f, "{} bytes", self.downloaded);
        }
        write!(
            f,
            "{}/{} bytes ({:.1}%)",
            self.downloaded,
            self.total,
            self.percentage()
        )
    }
}

/// Reject URLs that are not `https`, or `http` when `allow_insecure` is set.
pub(crate) fn require_secure_url(url: &str, allow_insecure: bool) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| DownloadError::Transport(TransportError::InvalidRequest(e.to_string())))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if allow_insecure => {
            warn!(url = %url, "Using insecure HTTP");
            Ok(())
        }
        _ => Err(DownloadError::InsecureUrl(url.to_string())),
    }
}

/// Outcome of a single failed attempt.
enum Failure {
    Transient(TransportError),
    Terminal(DownloadError),
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::Terminal(DownloadError::Io(err))
    }
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        if err.is_transient() {
            return Failure::Transient(err);
        }
        Failure::Terminal(match err {
            TransportError::Certificate(msg) => DownloadError::Certificate(msg),
            TransportError::Status { status } => DownloadError::HttpStatus { status },
            other => DownloadError::Transport(other),
        })
    }
}

/// Bytes already on disk for the current download.
struct Partial {
    file: NamedTempFile,
    written: u64,
    resumable: bool,
}

impl Partial {
    fn restart(&mut self) -> std::io::Result<()> {
        self.file.as_file().set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.written = 0;
        Ok(())
    }
}

/// Payload downloader with resume, retry and cancellation.
pub struct Downloader {
    transport: Arc<dyn HttpTransport>,
    config: DownloaderConfig,
    progress_callback: Option<ProgressCallback>,
}

impl Downloader {
    /// Create a downloader over `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>, config: DownloaderConfig) -> Self {
        Self {
            transport,
            config,
            progress_callback: None,
        }
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Download `url` into a new temp file inside `staging_dir`.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InsecureUrl`] for a non-HTTPS URL unless allowed
    /// - [`DownloadError::HttpStatus`] / [`DownloadError::Certificate`] for
    ///   terminal failures, which are never retried
    /// - [`DownloadError::RetriesExhausted`] when transient failures outlast
    ///   the retry policy
    /// - [`DownloadError::LengthMismatch`] when `expected_length` is given and
    ///   the byte count differs
    /// - [`DownloadError::Cancelled`] when `cancel` fires
    pub async fn fetch(
        &self,
        url: &str,
        expected_length: Option<u64>,
        cancel: &CancellationToken,
        staging_dir: &Path,
    ) -> Result<NamedTempFile, DownloadError> {
        require_secure_url(url, self.config.allow_insecure_http)?;
        info!(url = %url, expected_length = ?expected_length, "Starting download");

        let mut partial = Partial {
            file: NamedTempFile::new_in(staging_dir)?,
            written: 0,
            resumable: false,
        };

        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            match self
                .transfer(url, &mut partial, expected_length, cancel)
                .await
            {
                Ok(()) => break,
                Err(Failure::Terminal(DownloadError::Cancelled)) => {
                    info!(url = %url, written = partial.written, "Download cancelled");
                    return Err(DownloadError::Cancelled);
                }
                Err(Failure::Terminal(err)) => {
                    warn!(url = %url, error = %err, "Download failed");
                    return Err(err);
                }
                Err(Failure::Transient(err)) if attempt >= policy.attempts() => {
                    warn!(url = %url, attempts = attempt, error = %err, "Download retries exhausted");
                    return Err(DownloadError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(Failure::Transient(err)) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient download failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }

        partial.file.flush()?;
        partial.file.as_file().sync_all()?;

        if let Some(expected) = expected_length {
            if partial.written != expected {
                warn!(expected, actual = partial.written, "Download size mismatch");
                return Err(DownloadError::LengthMismatch {
                    expected,
                    actual: partial.written,
                });
            }
        }

        info!(url = %url, bytes = partial.written, attempts = attempt, "Download complete");
        Ok(partial.file)
    }

    /// One request, streamed into `partial` until the body ends.
    async fn transfer(
        &self,
        url: &str,
        partial: &mut Partial,
        expected_length: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let range_start = (partial.written > 0 && partial.resumable).then_some(partial.written);
        if range_start.is_none() && partial.written > 0 {
            debug!("Server does not support ranges, restarting download");
            partial.restart()?;
        }

        let request = PayloadRequest {
            url: url.to_string(),
            range_start,
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Failure::Terminal(DownloadError::Cancelled)),
            response = self.transport.get(&request) => response?,
        };

        if response.status == RANGE_NOT_SATISFIABLE && range_start.is_some() {
            warn!("Range not satisfiable, restarting download");
            partial.resumable = false;
            partial.restart()?;
            return Err(Failure::Transient(TransportError::Status {
                status: response.status,
            }));
        }
        if !response.is_success() {
            return Err(TransportError::Status {
                status: response.status,
            }
            .into());
        }

        partial.resumable = response.accepts_ranges;
        if range_start.is_some() && !response.is_partial() {
            warn!("Server ignored range request, restarting download");
            partial.restart()?;
        } else if range_start.is_some() {
            debug!(offset = partial.written, "Resuming download");
        }

        let total = expected_length
            .or_else(|| {
                response
                    .content_length
                    .map(|len| len.saturating_add(partial.written))
            })
            .unwrap_or(0);
        self.report_progress(partial.written, total);

        let mut body = response.body;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Failure::Terminal(DownloadError::Cancelled)),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            partial.file.write_all(&chunk)?;
            partial.written += chunk.len() as u64;

            if let Some(expected) = expected_length {
                if partial.written > expected {
                    return Err(Failure::Terminal(DownloadError::LengthMismatch {
                        expected,
                        actual: partial.written,
                    }));
                }
            }
            self.report_progress(partial.written, total);
        }
        Ok(())
    }

    /// Report download progress via the callback if set.
    fn report_progress(&self, downloaded: u64, total: u64) {
        if let Some(callback) = &self.progress_callback {
            callback(DownloadProgress { downloaded, total });
        }
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Scripted, ScriptedTransport};
    use std::sync::Mutex;

    fn fast_config() -> DownloaderConfig {
        DownloaderConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            allow_insecure_http: false,
        }
    }

    fn downloader(transport: &Arc<ScriptedTransport>) -> Downloader {
        Downloader::new(transport.clone(), fast_config())
    }

    const URL: &str = "https://updates.example.com/app-2.0.bin";

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_download_progress() {
        let progress = DownloadProgress::new(50, 200);
        assert_eq!(progress.percentage(), 25.0);
        assert_eq!(progress.remaining(), 150);
        assert!(!progress.is_complete());
        assert_eq!(progress.to_string(), "50/200 bytes (25.0%)");

        assert!(DownloadProgress::new(200, 200).is_complete());
        assert!(!DownloadProgress::new(0, 0).is_complete());
        assert_eq!(DownloadProgress::new(7, 0).to_string(), "7 bytes");
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Fail(TransportError::Timeout),
            Scripted::status(503),
            Scripted::ok(b"payload"),
        ]));

        let file = downloader(&transport)
            .fetch(URL, Some(7), &CancellationToken::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"payload");
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::status(404),
            Scripted::ok(b"payload"),
        ]));

        let err = downloader(&transport)
            .fetch(URL, None, &CancellationToken::new(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404 }));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_certificate_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Fail(
            TransportError::Certificate("unknown issuer".into()),
        )]));

        let err = downloader(&transport)
            .fetch(URL, None, &CancellationToken::new(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Certificate(_)));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Fail(TransportError::Connect("refused".into())),
            Scripted::Fail(TransportError::Connect("refused".into())),
            Scripted::Fail(TransportError::Connect("refused".into())),
            Scripted::ok(b"too late"),
        ]));

        let err = downloader(&transport)
            .fetch(URL, None, &CancellationToken::new(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::RetriesExhausted {
                attempts: 3,
                last: TransportError::Connect(_)
            }
        ));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_resume_uses_range_request() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Respond {
                status: 200,
                accepts_ranges: true,
                chunks: vec![
                    Ok(bytes::Bytes::from_static(b"hello ")),
                    Err(TransportError::Body("connection reset".into())),
                ],
                hang: false,
            },
            Scripted::Respond {
                status: 206,
                accepts_ranges: true,
                chunks: vec![Ok(bytes::Bytes::from_static(b"world"))],
                hang: false,
            },
        ]));

        let file = downloader(&transport)
            .fetch(URL, Some(11), &CancellationToken::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world");

        let requests = transport.requests();
        assert_eq!(requests[0].range_start, None);
        assert_eq!(requests[1].range_start, Some(6));
    }

    #[tokio::test]
    async fn test_huge_content_length_on_resume_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Respond {
                status: 200,
                accepts_ranges: true,
                chunks: vec![
                    Ok(bytes::Bytes::from_static(b"hello")),
                    Err(TransportError::Body("connection reset".into())),
                ],
                hang: false,
            },
            Scripted::Declared {
                status: 206,
                content_length: u64::MAX,
                body: b" world",
            },
        ]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let file = downloader(&transport)
            .with_progress(Arc::new(move |p| sink.lock().unwrap().push(p)))
            .fetch(URL, None, &CancellationToken::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world");
        assert_eq!(seen.lock().unwrap().last().map(|p| p.total), Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_restart_without_range_support() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Respond {
                status: 200,
                accepts_ranges: false,
                chunks: vec![
                    Ok(bytes::Bytes::from_static(b"hello ")),
                    Err(TransportError::Body("connection reset".into())),
                ],
                hang: false,
            },
            Scripted::ok(b"hello world"),
        ]));

        let file = downloader(&transport)
            .fetch(URL, Some(11), &CancellationToken::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world");
        assert_eq!(transport.requests()[1].range_start, None);
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Respond {
                status: 200,
                accepts_ranges: true,
                chunks: vec![
                    Ok(bytes::Bytes::from_static(b"hello ")),
                    Err(TransportError::Body("connection reset".into())),
                ],
                hang: false,
            },
            Scripted::ok(b"hello world"),
        ]));

        let file = downloader(&transport)
            .fetch(URL, Some(11), &CancellationToken::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello world");
        assert_eq!(transport.requests()[1].range_start, Some(6));
    }

    #[tokio::test]
    async fn test_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();

        let short = Arc::new(ScriptedTransport::new(vec![Scripted::ok(b"truncated")]));
        let err = downloader(&short)
            .fetch(URL, Some(20), &CancellationToken::new(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::LengthMismatch {
                expected: 20,
                actual: 9
            }
        ));

        let long = Arc::new(ScriptedTransport::new(vec![Scripted::ok(b"much too long")]));
        let err = downloader(&long)
            .fetch(URL, Some(4), &CancellationToken::new(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::LengthMismatch { expected: 4, .. }));

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Respond {
            status: 200,
            accepts_ranges: true,
            chunks: vec![Ok(bytes::Bytes::from_static(b"first chunk"))],
            hang: true,
        }]));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = downloader(&transport)
            .fetch(URL, None, &cancel, dir.path())
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_insecure_url_rejected_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::ok(b"data")]));

        let err = downloader(&transport)
            .fetch("http://updates.example.com/app.bin", None, &CancellationToken::new(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InsecureUrl(_)));
        assert!(transport.requests().is_empty());

        let mut config = fast_config();
        config.allow_insecure_http = true;
        let file = Downloader::new(transport.clone(), config)
            .fetch("http://updates.example.com/app.bin", None, &CancellationToken::new(), dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_progress_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::ok(b"0123456789")]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let _file = downloader(&transport)
            .with_progress(Arc::new(move |p| sink.lock().unwrap().push(p)))
            .fetch(URL, Some(10), &CancellationToken::new(), dir.path())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&DownloadProgress::new(0, 10)));
        assert!(seen.last().unwrap().is_complete());
    }
}
