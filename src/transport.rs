//! HTTP transport for the exchange.
//!
//! The orchestrator only needs "POST these bytes, give me a status and a body
//! stream", which keeps it testable without a network.

use crate::exchange::ExchangeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::io;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Response body as a stream of byte chunks.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Status and body of a sent request.
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: BodyStream,
}

impl TransportResponse {
    /// Drain the whole body.
    pub async fn bytes(self) -> Result<Vec<u8>, ExchangeError> {
        let mut buf = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }
}

/// Sends one encoded request.
#[async_trait]
pub trait Transport {
    /// POST `body`; `streaming` asks for an event-stream response.
    async fn post(
        &self,
        body: Vec<u8>,
        streaming: bool,
    ) -> Result<TransportResponse, ExchangeError>;
}

/// Transport backed by `reqwest`.
pub struct HttpTransport {
    url: String,
    api_key: String,
    headers: HeaderMap,
    client: Client,
}

impl HttpTransport {
    /// Create a new transport. `timeout` bounds the whole request, including
    /// the streamed body.
    pub fn new(
        url: String,
        api_key: String,
        headers: HeaderMap,
        timeout: Option<Duration>,
    ) -> Result<Self, ExchangeError> {
        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(ExchangeError::Transport)?;

        Ok(Self {
            url,
            api_key,
            headers,
            client,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        body: Vec<u8>,
        streaming: bool,
    ) -> Result<TransportResponse, ExchangeError> {
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .bearer_auth(&self.api_key)
            .body(body);
        if streaming {
            request = request.header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        tracing::debug!(url = %self.url, streaming, "sending request");
        let response = request.send().await.map_err(|e| {
            tracing::debug!(url = %self.url, error = %e, "request failed");
            ExchangeError::Transport(e)
        })?;

        let status = response.status();
        tracing::debug!(%status, "response received");
        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(TransportResponse { status, body })
    }
}
