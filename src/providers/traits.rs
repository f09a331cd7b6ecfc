use super::streaming::{EventStream, resp_to_events};
use crate::error::Result;
use crate::model::{Message, Response};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Longest function description forwarded to a backend. Anything longer is
/// truncated with a warning; the limit is public so callers can pre-check.
pub const MAX_FUNCTION_DESCRIPTION_CHARS: usize = 1_024;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

/// Runtime capability flags reported per adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub function_calling: bool,
    pub vision: bool,
}

/// A callable function advertised to the model, JSON-Schema parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Description capped at [`MAX_FUNCTION_DESCRIPTION_CHARS`].
    pub fn sanitized_description(&self) -> String {
        if self.description.chars().count() <= MAX_FUNCTION_DESCRIPTION_CHARS {
            return self.description.clone();
        }
        tracing::warn!(
            function = self.name.as_str(),
            limit = MAX_FUNCTION_DESCRIPTION_CHARS,
            "truncating overlong function description"
        );
        self.description
            .chars()
            .take(MAX_FUNCTION_DESCRIPTION_CHARS)
            .collect()
    }
}

/// Per-call tuning knobs. `extra` is merged into the request body for
/// backends with open JSON schemas (OpenAI, Ollama) and ignored elsewhere.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub functions: Vec<FunctionSpec>,
    pub tool_choice: Option<String>,
    /// Gemini `safetySettings` array, passed through verbatim. Other
    /// backends have no equivalent and ignore it.
    pub safety_settings: Option<serde_json::Value>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionSpec>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_safety_settings(mut self, settings: serde_json::Value) -> Self {
        self.safety_settings = Some(settings);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

impl ModelInfo {
    pub fn id_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            context_window: None,
            owned_by: None,
        }
    }
}

/// One backend behind the unified interface.
///
/// Adapters translate the unified conversation into the backend's wire
/// format, normalize the reply (function calls included) back into a
/// [`Response`], and preserve unmapped backend fields in
/// `Response::metadata`. Implementations hold no per-request state.
pub trait ProviderAdapter: Send + Sync {
    /// Stable lowercase identifier ("openai", "anthropic", ...).
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// Model used when [`ChatOptions::model`] is unset.
    fn default_model(&self) -> &str;

    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a ChatOptions,
    ) -> BoxFuture<'a, Result<Response>>;

    /// Open a native stream. Backends without streaming fall back to a
    /// buffered call replayed as events.
    fn stream<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a ChatOptions,
    ) -> BoxFuture<'a, Result<EventStream>> {
        Box::pin(async move {
            let response = self.complete(messages, options).await?;
            Ok(Box::pin(stream::iter(resp_to_events(response))) as EventStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelInfo>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_kind_round_trips_through_strum() {
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
        assert_eq!(
            ProviderKind::from_str("anthropic").unwrap(),
            ProviderKind::Anthropic
        );
    }

    #[test]
    fn default_capabilities_are_all_false() {
        let caps = AdapterCapabilities::default();
        assert!(!caps.streaming);
        assert!(!caps.function_calling);
        assert!(!caps.vision);
    }

    #[test]
    fn short_descriptions_pass_through_unchanged() {
        let spec = FunctionSpec::new("calc", "adds numbers", serde_json::json!({}));
        assert_eq!(spec.sanitized_description(), "adds numbers");
    }

    #[test]
    fn overlong_descriptions_are_truncated_to_limit() {
        let spec = FunctionSpec::new(
            "calc",
            "x".repeat(MAX_FUNCTION_DESCRIPTION_CHARS + 100),
            serde_json::json!({}),
        );
        assert_eq!(
            spec.sanitized_description().chars().count(),
            MAX_FUNCTION_DESCRIPTION_CHARS
        );
    }

    #[test]
    fn chat_options_builders_compose() {
        let options = ChatOptions::default()
            .with_model("gpt-4o")
            .with_temperature(0.2)
            .with_max_tokens(256);
        assert_eq!(options.model.as_deref(), Some("gpt-4o"));
        assert_eq!(options.max_tokens, Some(256));
    }
}
