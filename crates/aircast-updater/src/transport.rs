//! Transport collaborators.
//!
//! The pipeline never talks HTTP directly. Feed retrieval goes through
//! [`FeedFetcher`] and payload transfers through [`HttpTransport`];
//! [`ReqwestTransport`] implements both over `reqwest` with rustls.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_RANGES, RANGE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Default upper bound on a feed document.
pub const DEFAULT_MAX_FEED_BYTES: u64 = 4 * 1024 * 1024;

/// Streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Supplies raw feed documents.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch the document at `url` with extra query `parameters`.
    async fn fetch_feed(
        &self,
        url: &str,
        parameters: &[(String, String)],
    ) -> Result<Vec<u8>, TransportError>;
}

/// A payload request, optionally resuming from a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRequest {
    /// Payload URL
    pub url: String,
    /// Request bytes from this offset onwards (`Range: bytes=N-`)
    pub range_start: Option<u64>,
}

/// Response head plus streamed body.
pub struct PayloadResponse {
    /// HTTP status code
    pub status: u16,
    /// Server advertised `Accept-Ranges: bytes`
    pub accepts_ranges: bool,
    /// Declared body length
    pub content_length: Option<u64>,
    /// Body chunks
    pub body: BodyStream,
}

impl PayloadResponse {
    /// Whether the body is a partial (206) response.
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT.as_u16()
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for PayloadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadResponse")
            .field("status", &self.status)
            .field("accepts_ranges", &self.accepts_ranges)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Issues payload requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a GET for `request` and return the response head with a body stream.
    ///
    /// Non-2xx statuses are returned as responses, not errors, so the caller
    /// can classify them.
    async fn get(&self, request: &PayloadRequest) -> Result<PayloadResponse, TransportError>;
}

/// Settings for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read timeout for streamed bodies
    pub read_timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Largest feed document accepted
    pub max_feed_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: format!("aircast-updater/{}", env!("CARGO_PKG_VERSION")),
            max_feed_bytes: DEFAULT_MAX_FEED_BYTES,
        }
    }
}

/// `reqwest` implementation of the transport collaborators.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_feed_bytes: u64,
}

impl ReqwestTransport {
    /// Build a client with the given timeouts.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(&config.user_agent)
            .https_only(false)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            client,
            max_feed_bytes: config.max_feed_bytes,
        })
    }
}

#[async_trait]
impl FeedFetcher for ReqwestTransport {
    async fn fetch_feed(
        &self,
        url: &str,
        parameters: &[(String, String)],
    ) -> Result<Vec<u8>, TransportError> {
        debug!(url = %url, parameters = parameters.len(), "Fetching feed");
        let response = self
            .client
            .get(url)
            .query(parameters)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        let declared = response.content_length();
        let body = response.bytes_stream().map_err(classify).boxed();
        let document = read_limited(body, declared, self.max_feed_bytes).await?;
        debug!(bytes = document.len(), "Fetched feed");
        Ok(document)
    }
}

/// Collect a response body, failing once it grows past `limit` bytes.
pub(crate) async fn read_limited<S>(
    mut body: S,
    declared: Option<u64>,
    limit: u64,
) -> Result<Vec<u8>, TransportError>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    if declared.is_some_and(|len| len > limit) {
        warn!(declared = ?declared, limit, "Feed larger than the configured limit");
        return Err(TransportError::TooLarge { limit });
    }

    let mut document = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if document.len() as u64 + chunk.len() as u64 > limit {
            warn!(limit, "Feed body exceeded the configured limit");
            return Err(TransportError::TooLarge { limit });
        }
        document.extend_from_slice(&chunk);
    }
    Ok(document)
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &PayloadRequest) -> Result<PayloadResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        if let Some(start) = request.range_start {
            builder = builder.header(RANGE, format!("bytes={}-", start));
        }

        let response = builder.send().await.map_err(classify)?;
        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(PayloadResponse {
            status: response.status().as_u16(),
            accepts_ranges,
            content_length: response.content_length(),
            body: response.bytes_stream().map_err(classify).boxed(),
        })
    }
}

/// Map a `reqwest` error onto the transport error kinds.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if err.is_builder() || err.is_request() && err.url().is_none() {
        return TransportError::InvalidRequest(err.to_string());
    }
    if let Some(status) = err.status() {
        return TransportError::Status {
            status: status.as_u16(),
        };
    }
    if is_certificate_error(&err) {
        return TransportError::Certificate(error_chain(&err));
    }
    if err.is_connect() {
        return TransportError::Connect(error_chain(&err));
    }
    if err.is_body() || err.is_decode() {
        return TransportError::Body(error_chain(&err));
    }
    TransportError::Connect(error_chain(&err))
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// rustls surfaces certificate problems only through the error chain text.
fn is_certificate_error(err: &reqwest::Error) -> bool {
    let chain = error_chain(err).to_ascii_lowercase();
    chain.contains("certificate") || chain.contains("unknownissuer") || chain.contains("invalid peer")
}
