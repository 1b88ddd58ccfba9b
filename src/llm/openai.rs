//! Chat-completions adapter.
//!
//! Used for `provider = openai` and as the fallback for unknown providers.

use super::Frame;
use crate::exchange::ExchangeError;
use crate::request::NormalizedRequest;
use serde::{Deserialize, Serialize};

/// Adapter for the chat-completions wire format.
#[derive(Debug, Clone, Default)]
pub struct OpenAIAdapter {
    max_tokens: Option<u32>,
}

impl OpenAIAdapter {
    /// Create a new adapter.
    pub fn new(max_tokens: Option<u32>) -> Self {
        Self { max_tokens }
    }

    /// Encode `[system, user]` messages plus model and stream flag.
    pub fn encode_request(&self, request: &NormalizedRequest) -> Result<Vec<u8>, ExchangeError> {
        let body = OpenAIRequest {
            model: &request.model,
            messages: [
                OpenAIMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                OpenAIMessage {
                    role: "user",
                    content: &request.user_text,
                },
            ],
            stream: request.streaming,
            max_tokens: self.max_tokens,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Answer is the first choice's message content.
    pub fn decode_buffered(&self, body: &[u8]) -> Result<String, ExchangeError> {
        let response: OpenAIResponse = serde_json::from_slice(body)
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or(ExchangeError::EmptyResponse)
    }

    /// Decode the JSON payload of a `data:` line.
    pub fn decode_stream_data(&self, data: &str) -> Frame {
        let chunk: OpenAIStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, data, "skipping unparseable stream chunk");
                return Frame::Ignored;
            }
        };

        match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
            Some(content) if !content.is_empty() => Frame::Delta(content),
            _ => Frame::Ignored,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: [OpenAIMessage<'a>; 2],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    #[serde(default)]
    message: OpenAIMessageResponse,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIMessageResponse {
    // `null` when the model answers with a tool call only
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}
