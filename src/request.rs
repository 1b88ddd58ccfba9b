//! Provider-agnostic request definition.

use crate::config::Config;
use crate::markup::MARKUP_HINT;

/// What to ask, before any provider-specific encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_text: String,
    pub streaming: bool,
}

impl NormalizedRequest {
    /// Build a request for `question` from configuration.
    ///
    /// Buffered answers are rendered in one piece, so the model is also told
    /// about the markup tags it may use. Streaming sends the template as is.
    pub fn from_config(config: &Config, question: impl Into<String>) -> Self {
        let system_prompt = if config.stream {
            config.prompt_template.clone()
        } else {
            format!("{} {}", config.prompt_template, MARKUP_HINT)
        };

        Self {
            model: config.model.clone(),
            system_prompt,
            user_text: question.into(),
            streaming: config.stream,
        }
    }
}
