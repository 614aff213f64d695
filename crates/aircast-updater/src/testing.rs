//! In-memory transport fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};

use crate::error::TransportError;
use crate::transport::{FeedFetcher, HttpTransport, PayloadRequest, PayloadResponse};

/// One scripted reply.
pub(crate) enum Scripted {
    Fail(TransportError),
    Respond {
        status: u16,
        accepts_ranges: bool,
        chunks: Vec<Result<Bytes, TransportError>>,
        /// Never end the body after the chunks
        hang: bool,
    },
    /// A reply whose advertised length is not derived from the body
    Declared {
        status: u16,
        content_length: u64,
        body: &'static [u8],
    },
}

impl Scripted {
    pub(crate) fn ok(body: &[u8]) -> Self {
        Scripted::Respond {
            status: 200,
            accepts_ranges: false,
            chunks: vec![Ok(Bytes::copy_from_slice(body))],
            hang: false,
        }
    }

    pub(crate) fn status(status: u16) -> Self {
        Scripted::Respond {
            status,
            accepts_ranges: false,
            chunks: Vec::new(),
            hang: false,
        }
    }
}

/// Replies to payload requests from a script and records every request.
///
/// Once the script is exhausted, every request gets a 404.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<PayloadRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<PayloadRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, request: &PayloadRequest) -> Result<PayloadResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::status(404));

        match next {
            Scripted::Fail(err) => Err(err),
            Scripted::Respond {
                status,
                accepts_ranges,
                chunks,
                hang,
            } => {
                let content_length = chunks
                    .iter()
                    .map(|c| c.as_ref().map_or(0, |b| b.len() as u64))
                    .sum();
                let body = stream::iter(chunks);
                let body = if hang {
                    body.chain(stream::pending()).boxed()
                } else {
                    body.boxed()
                };
                Ok(PayloadResponse {
                    status,
                    accepts_ranges,
                    content_length: Some(content_length),
                    body,
                })
            }
            Scripted::Declared {
                status,
                content_length,
                body,
            } => Ok(PayloadResponse {
                status,
                accepts_ranges: true,
                content_length: Some(content_length),
                body: stream::iter(vec![Ok(Bytes::from_static(body))]).boxed(),
            }),
        }
    }
}

/// Serves a fixed feed document and records the parameters it was asked for.
pub(crate) struct StaticFeed {
    document: Result<Vec<u8>, TransportError>,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl StaticFeed {
    pub(crate) fn new(document: impl Into<Vec<u8>>) -> Self {
        Self {
            document: Ok(document.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(err: TransportError) -> Self {
        Self {
            document: Err(err),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedFetcher for StaticFeed {
    async fn fetch_feed(
        &self,
        url: &str,
        parameters: &[(String, String)],
    ) -> Result<Vec<u8>, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), parameters.to_vec()));
        self.document.clone()
    }
}
