//! Messages-style adapter (`provider = anthropic`).

use super::Frame;
use crate::exchange::ExchangeError;
use crate::request::NormalizedRequest;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const CONTENT_DELTA_EVENT: &str = "content_block_delta";

/// Adapter for the messages wire format.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    max_tokens: u32,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AnthropicAdapter {
    /// Create a new adapter. The messages API requires `max_tokens`, so a
    /// default is always sent.
    pub fn new(max_tokens: Option<u32>) -> Self {
        Self {
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }

    /// Encode a single user message with the system prompt as a sibling field.
    pub fn encode_request(&self, request: &NormalizedRequest) -> Result<Vec<u8>, ExchangeError> {
        let body = AnthropicRequest {
            model: &request.model,
            max_tokens: self.max_tokens,
            system: &request.system_prompt,
            messages: [AnthropicMessage {
                role: "user",
                content: &request.user_text,
            }],
            stream: request.streaming,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Answer is the text of the first content block.
    pub fn decode_buffered(&self, body: &[u8]) -> Result<String, ExchangeError> {
        let response: AnthropicResponse = serde_json::from_slice(body)
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        response
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or(ExchangeError::EmptyResponse)
    }

    /// Only `content_block_delta` events carry text.
    pub fn decode_stream_data(&self, data: &str) -> Frame {
        let event: AnthropicStreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, data, "skipping unparseable stream event");
                return Frame::Ignored;
            }
        };

        if event.event_type != CONTENT_DELTA_EVENT {
            tracing::trace!(event = %event.event_type, "ignoring stream event");
            return Frame::Ignored;
        }
        match event.delta.and_then(|d| d.text) {
            Some(text) if !text.is_empty() => Frame::Delta(text),
            _ => Frame::Ignored,
        }
    }

    /// Vendor auth and version headers.
    pub fn extra_headers(&self, api_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(api_key) {
            Ok(value) => {
                headers.insert("x-api-key", value);
            }
            Err(e) => tracing::warn!(error = %e, "api key is not a valid header value"),
        }
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [AnthropicMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    delta: Option<AnthropicDelta>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    text: Option<String>,
}
