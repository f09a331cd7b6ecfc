use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token counts for one exchange. `total` is derived at construction, so a
/// usage where the parts disagree with the sum is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    FunctionCall,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

/// A backend's request that the caller execute a function.
///
/// Parallel-call backends supply a `call_id`; single-call styles leave it
/// empty. `arguments` is always a decoded JSON value, never a raw string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Unified result of a chat call, terminal or streamed chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub model: Option<String>,
    pub provider: String,
    /// `None` only on non-terminal streamed chunks.
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
    /// Backend fields with no unified counterpart are preserved here.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub streamed: bool,
}

impl Response {
    pub fn text(provider: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            provider: provider.into(),
            finish_reason: Some(FinishReason::Stop),
            usage: None,
            function_calls: Vec::new(),
            latency: None,
            metadata: serde_json::Map::new(),
            streamed: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn has_function_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Rebuild the assistant turn for resubmission in a tool loop.
    pub fn to_assistant_message(&self) -> crate::model::Message {
        let mut message = crate::model::Message::assistant(self.content.clone());
        if self.has_function_calls() {
            let calls = serde_json::to_value(&self.function_calls)
                .unwrap_or(serde_json::Value::Null);
            message.metadata.insert("function_calls".to_string(), calls);
        }
        message
    }
}
