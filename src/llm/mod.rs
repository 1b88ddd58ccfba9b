//! Provider adapters.
//!
//! Each adapter knows one vendor wire format: how to encode a
//! [`NormalizedRequest`], how to pull the answer out of a buffered body and
//! how to read one line of an event stream.

pub mod anthropic;
pub mod openai;

use crate::config::Config;
use crate::exchange::ExchangeError;
use crate::request::NormalizedRequest;
use reqwest::header::HeaderMap;

/// Payload that terminates an event stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Supported wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Chat-completions style (`openai`), also the fallback.
    ChatCompletion,
    /// Messages style (`anthropic`).
    Messages,
}

impl ProviderKind {
    /// Recognized provider names only.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(ProviderKind::Messages),
            "openai" => Some(ProviderKind::ChatCompletion),
            _ => None,
        }
    }

    /// Map a configured provider name to a variant. Unknown names use the
    /// chat-completions protocol.
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or(ProviderKind::ChatCompletion)
    }

    /// Environment variable consulted when the config has no `api_key`.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::ChatCompletion => "OPENAI_API_KEY",
            ProviderKind::Messages => "ANTHROPIC_API_KEY",
        }
    }
}

/// One decoded line of an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A fragment of answer text.
    Delta(String),
    /// Nothing to emit: metadata, other event types, or unparseable data.
    Ignored,
    /// End of stream.
    Done,
}

/// Enum-based dispatch over the provider adapters.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAI(openai::OpenAIAdapter),
    Anthropic(anthropic::AnthropicAdapter),
}

impl Provider {
    /// Encode the request body.
    pub fn encode_request(&self, request: &NormalizedRequest) -> Result<Vec<u8>, ExchangeError> {
        match self {
            Provider::OpenAI(p) => p.encode_request(request),
            Provider::Anthropic(p) => p.encode_request(request),
        }
    }

    /// Extract the answer from a complete response body.
    pub fn decode_buffered(&self, body: &[u8]) -> Result<String, ExchangeError> {
        match self {
            Provider::OpenAI(p) => p.decode_buffered(body),
            Provider::Anthropic(p) => p.decode_buffered(body),
        }
    }

    /// Decode one line of an event stream.
    pub fn decode_stream_frame(&self, line: &str) -> Frame {
        let Some(data) = line.strip_prefix("data: ") else {
            return Frame::Ignored;
        };
        if data.trim() == DONE_SENTINEL {
            return Frame::Done;
        }
        match self {
            Provider::OpenAI(p) => p.decode_stream_data(data),
            Provider::Anthropic(p) => p.decode_stream_data(data),
        }
    }

    /// Headers this provider needs on top of content type and bearer auth.
    pub fn extra_headers(&self, api_key: &str) -> HeaderMap {
        match self {
            Provider::OpenAI(_) => HeaderMap::new(),
            Provider::Anthropic(p) => p.extra_headers(api_key),
        }
    }

    /// Get the provider name.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAI(_) => "openai",
            Provider::Anthropic(_) => "anthropic",
        }
    }
}

/// Create a provider from configuration.
pub fn create_provider(config: &Config) -> Provider {
    if ProviderKind::parse(&config.provider).is_none() {
        tracing::warn!(provider = %config.provider, "unknown provider, using openai protocol");
    }
    match config.provider_kind() {
        ProviderKind::ChatCompletion => {
            Provider::OpenAI(openai::OpenAIAdapter::new(config.max_tokens))
        }
        ProviderKind::Messages => {
            Provider::Anthropic(anthropic::AnthropicAdapter::new(config.max_tokens))
        }
    }
}
