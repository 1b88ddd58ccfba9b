//! Configuration management for wen.
//!
//! Configuration is a plain `key = value` file. Without `--config`, the first
//! usable file among `/etc/wen.conf`, `~/.config/wen/wen.conf` and
//! `./test.conf` is used; one that fails to load falls through to the next.

use crate::llm::ProviderKind;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

/// Built-in system prompt: be concise, plain text, suitable for a terminal.
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "回答用户问题，务必做到简洁，不要有任何废话。输出纯文本格式(NO MARKDOWN)，适合在终端显示。";

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_PROVIDER: &str = "openai";

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Model identifier sent with every request.
    pub model: String,
    /// API key from the file; see [`Config::api_key`] for the env fallback.
    pub api_key: Option<String>,
    /// Endpoint the request is POSTed to.
    pub api_url: String,
    /// Provider name as written (`openai`, `anthropic`, anything else).
    pub provider: String,
    /// System prompt.
    pub prompt_template: String,
    /// Whether to use the streaming API.
    pub stream: bool,
    /// Optional completion length cap.
    pub max_tokens: Option<u32>,
    /// Optional whole-request timeout in seconds.
    pub timeout: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            stream: true,
            max_tokens: None,
            timeout: None,
        }
    }
}

impl Config {
    /// Candidate config file locations, in lookup order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/wen.conf")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("wen").join("wen.conf"));
        }
        paths.push(PathBuf::from("./test.conf"));
        paths
    }

    /// Load configuration from `path`, or from the first default location
    /// that yields a usable config when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = |name: &str| std::env::var(name).ok();
        match path {
            Some(path) => Self::load_file(path, &env),
            None => Self::load_first(&Self::search_paths(), &env),
        }
    }

    /// Try each candidate in order. A file that cannot be read, parsed, or
    /// resolve an API key is skipped in favor of the next one.
    fn load_first(paths: &[PathBuf], env: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut last_error = None;
        for path in paths {
            match Self::load_file(path, env) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %format!("{e:#}"),
                        "skipping config file"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("No config file locations to search")))
    }

    fn load_file(path: &Path, env: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "loading config");
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        // Fail early rather than after the request has been built.
        config
            .api_key_with(env)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Parse `key = value` lines on top of the defaults.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config = Self::default();

        for line in contents.lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "model" => config.model = value.to_string(),
                "api_key" => {
                    config.api_key = (!value.is_empty()).then(|| value.to_string());
                }
                "api_url" => config.api_url = value.to_string(),
                "provider" => config.provider = value.to_string(),
                "prompt_template" => config.prompt_template = value.to_string(),
                "stream" => config.stream = value.eq_ignore_ascii_case("true") || value == "1",
                "max_tokens" => {
                    config.max_tokens = Some(
                        value
                            .parse()
                            .with_context(|| format!("Invalid max_tokens: {value}"))?,
                    );
                }
                "timeout" => {
                    config.timeout = Some(
                        value
                            .parse()
                            .with_context(|| format!("Invalid timeout: {value}"))?,
                    );
                }
                other => tracing::debug!(key = other, "ignoring unknown config key"),
            }
        }

        Ok(config)
    }

    /// Resolved provider variant.
    pub fn provider_kind(&self) -> ProviderKind {
        ProviderKind::from_name(&self.provider)
    }

    /// Get the API key from config or environment.
    pub fn api_key(&self) -> Result<String> {
        self.api_key_with(|name| std::env::var(name).ok())
    }

    fn api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<String> {
        let var = self.provider_kind().api_key_env();
        self.api_key
            .clone()
            .or_else(|| env(var).filter(|key| !key.is_empty()))
            .ok_or_else(|| anyhow!("Missing api_key in config file (or set {var})"))
    }
}
