use crate::providers::ProviderKind;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_model_cache_ttl_secs() -> u64 {
    3_600
}

fn default_max_function_rounds() -> u32 {
    5
}

/// Driver-level settings, loadable from TOML. Every field has a default so an
/// empty document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on attempts for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_model_cache_ttl_secs")]
    pub model_cache_ttl_secs: u64,
    /// Function-calling rounds allowed before the loop is aborted.
    #[serde(default = "default_max_function_rounds")]
    pub max_function_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Overrides the backend's well-known endpoint (proxies, local gateways).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            model_cache_ttl_secs: default_model_cache_ttl_secs(),
            max_function_rounds: default_max_function_rounds(),
            default_model: None,
            base_url: None,
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid driver config")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn model_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.model_cache_ttl_secs)
    }
}

/// Look up the conventional API-key environment variable for a backend.
/// Ollama is unauthenticated and always resolves to `None`.
pub fn resolve_api_key(kind: ProviderKind) -> Option<String> {
    let names: &[&str] = match kind {
        ProviderKind::OpenAi => &["OPENAI_API_KEY"],
        ProviderKind::Anthropic => &["ANTHROPIC_API_KEY"],
        ProviderKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        ProviderKind::Ollama => &[],
    };
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
}
