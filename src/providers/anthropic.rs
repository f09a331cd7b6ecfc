use super::http::build_client;
use super::sse::{SseBuffer, parse_data_lines};
use super::streaming::{EventStream, StreamEvent};
use super::traits::{
    AdapterCapabilities, BoxFuture, ChatOptions, ModelInfo, ProviderAdapter, ProviderKind,
};
use super::{error_from_response, openai::recorded_calls};
use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{
    ContentPart, FinishReason, FunctionCallRequest, ImageSource, Message, MessageRole, Response,
    TokenUsage,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
/// The Messages API requires an explicit output cap.
const DEFAULT_MAX_TOKENS: u32 = 1_024;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    Image {
        source: ApiImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamFrame {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: StreamBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: StreamDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        delta: StreamMessageDelta,
        usage: Option<StreamUsageDelta>,
    },
    MessageStop,
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    model: Option<String>,
    usage: Option<StreamUsageStart>,
}

#[derive(Debug, Deserialize)]
struct StreamUsageStart {
    input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamBlockStart {
    Text,
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsageDelta {
    output_tokens: Option<u64>,
}

// ─── Mapping ─────────────────────────────────────────────────────────────────

fn map_stop_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn" | "stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        Some(_) | None => FinishReason::Error,
    }
}

fn map_content_parts(message: &Message) -> Vec<ApiBlock> {
    message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => ApiBlock::Text { text: text.clone() },
            ContentPart::Image { source } => ApiBlock::Image {
                source: match source {
                    ImageSource::Base64 { media_type, data } => ApiImageSource::Base64 {
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                    ImageSource::Url { url } => ApiImageSource::Url { url: url.clone() },
                },
            },
        })
        .collect()
}

/// System turns lift into the top-level `system` field; tool results become
/// user-role `tool_result` blocks; assistant turns replay recorded calls as
/// `tool_use` blocks.
fn build_request_parts(messages: &[Message]) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_parts = Vec::new();
    let mut api_messages: Vec<ApiMessage> = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::System => {
                let text = message.text_content();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            MessageRole::User => {
                api_messages.push(ApiMessage {
                    role: "user",
                    content: map_content_parts(message),
                });
            }
            MessageRole::Assistant => {
                let mut content = Vec::new();
                let text = message.text_content();
                if !text.is_empty() {
                    content.push(ApiBlock::Text { text });
                }
                for call in recorded_calls(message) {
                    content.push(ApiBlock::ToolUse {
                        id: call.call_id.unwrap_or_default(),
                        name: call.name,
                        input: call.arguments,
                    });
                }
                if !content.is_empty() {
                    api_messages.push(ApiMessage {
                        role: "assistant",
                        content,
                    });
                }
            }
            MessageRole::Tool => {
                let block = ApiBlock::ToolResult {
                    tool_use_id: message.call_id.clone().unwrap_or_default(),
                    content: message.text_content(),
                    is_error: message.is_error,
                };
                // consecutive tool results share one user turn
                if let Some(last) = api_messages.last_mut()
                    && last.role == "user"
                    && last
                        .content
                        .iter()
                        .all(|b| matches!(b, ApiBlock::ToolResult { .. }))
                {
                    last.content.push(block);
                } else {
                    api_messages.push(ApiMessage {
                        role: "user",
                        content: vec![block],
                    });
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, api_messages)
}

fn build_request(
    messages: &[Message],
    options: &ChatOptions,
    default_model: &str,
    stream: bool,
) -> ApiRequest {
    let (system, api_messages) = build_request_parts(messages);
    let tools = if options.functions.is_empty() {
        None
    } else {
        Some(
            options
                .functions
                .iter()
                .map(|spec| ApiTool {
                    name: spec.name.clone(),
                    description: spec.sanitized_description(),
                    input_schema: spec.parameters.clone(),
                })
                .collect(),
        )
    };

    ApiRequest {
        model: options
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages: api_messages,
        system,
        temperature: options.temperature,
        top_p: options.top_p,
        tools,
        tool_choice: options
            .tool_choice
            .as_deref()
            .map(|choice| serde_json::json!({ "type": choice })),
        stream: stream.then_some(true),
    }
}

const KNOWN_RESPONSE_FIELDS: &[&str] = &["content", "model", "stop_reason", "usage", "role", "type"];

fn parse_response(provider: &str, value: Value) -> Result<Response> {
    let api_response: ApiResponse = serde_json::from_value(value.clone()).map_err(|error| {
        ProviderError::new(
            ErrorKind::UnknownProvider,
            provider,
            format!("response decode failed: {error}"),
        )
    })?;

    let mut content = String::new();
    let mut function_calls = Vec::new();
    for block in api_response.content {
        match block {
            ApiBlock::Text { text } => content.push_str(&text),
            ApiBlock::ToolUse { id, name, input } => {
                function_calls.push(FunctionCallRequest {
                    name,
                    arguments: input,
                    call_id: Some(id),
                });
            }
            ApiBlock::Image { .. } | ApiBlock::ToolResult { .. } => {}
        }
    }

    let mut metadata = serde_json::Map::new();
    if let Some(object) = value.as_object() {
        for (key, field) in object {
            if !KNOWN_RESPONSE_FIELDS.contains(&key.as_str()) && !field.is_null() {
                metadata.insert(key.clone(), field.clone());
            }
        }
    }

    Ok(Response {
        content,
        model: api_response.model,
        provider: provider.to_string(),
        finish_reason: Some(map_stop_reason(api_response.stop_reason.as_deref())),
        usage: api_response
            .usage
            .map(|usage| TokenUsage::new(usage.input_tokens, usage.output_tokens)),
        function_calls,
        latency: None,
        metadata,
        streamed: false,
    })
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(120), Duration::from_secs(10)),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::new(
                ErrorKind::InvalidCredentials,
                self.name(),
                "missing API key (set ANTHROPIC_API_KEY)",
            )
        })
    }

    async fn post_messages(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|error| ProviderError::from_transport(self.name(), &error))?;

        if !response.status().is_success() {
            return Err(error_from_response(self.name(), response).await);
        }
        Ok(response)
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            function_calling: true,
            vision: true,
        }
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a ChatOptions,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let request = build_request(messages, options, &self.default_model, false);
            let response = self.post_messages(&request).await?;
            let value: Value = response.json().await.map_err(|error| {
                ProviderError::new(
                    ErrorKind::UnknownProvider,
                    self.name(),
                    format!("response JSON decode failed: {error}"),
                )
            })?;
            parse_response(self.name(), value)
        })
    }

    fn stream<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a ChatOptions,
    ) -> BoxFuture<'a, Result<EventStream>> {
        Box::pin(async move {
            let request = build_request(messages, options, &self.default_model, true);
            let response = self.post_messages(&request).await?;
            let provider = self.name().to_string();
            let mut byte_stream = response.bytes_stream();

            let stream = async_stream::try_stream! {
                let mut sse_buffer = SseBuffer::new();
                let mut input_tokens: Option<u64> = None;
                let mut output_tokens: Option<u64> = None;
                let mut stop_reason: Option<FinishReason> = None;

                while let Some(chunk_result) = byte_stream.next().await {
                    let bytes = chunk_result.map_err(|error| {
                        ProviderError::new(
                            ErrorKind::ServerError,
                            provider.clone(),
                            format!("stream read failed: {error}"),
                        )
                    })?;
                    sse_buffer.push_chunk(&bytes);

                    while let Some(event_block) = sse_buffer.next_event_block() {
                        for data in parse_data_lines(&event_block) {
                            let Ok(frame) = serde_json::from_str::<StreamFrame>(data) else {
                                continue;
                            };

                            match frame {
                                StreamFrame::MessageStart { message } => {
                                    input_tokens = message
                                        .usage
                                        .and_then(|usage| usage.input_tokens);
                                    yield StreamEvent::Start {
                                        model: message.model,
                                    };
                                }
                                StreamFrame::ContentBlockStart {
                                    index,
                                    content_block: StreamBlockStart::ToolUse { id, name },
                                } => {
                                    yield StreamEvent::FunctionCallDelta {
                                        index,
                                        id: Some(id),
                                        name: Some(name),
                                        arguments_delta: String::new(),
                                    };
                                }
                                StreamFrame::ContentBlockDelta { index, delta } => match delta {
                                    StreamDelta::TextDelta { text } => {
                                        yield StreamEvent::ContentDelta { text };
                                    }
                                    StreamDelta::InputJsonDelta { partial_json } => {
                                        yield StreamEvent::FunctionCallDelta {
                                            index,
                                            id: None,
                                            name: None,
                                            arguments_delta: partial_json,
                                        };
                                    }
                                    StreamDelta::Other => {}
                                },
                                StreamFrame::MessageDelta { delta, usage } => {
                                    if let Some(reason) = delta.stop_reason.as_deref() {
                                        stop_reason = Some(map_stop_reason(Some(reason)));
                                    }
                                    if let Some(tokens) =
                                        usage.and_then(|usage| usage.output_tokens)
                                    {
                                        output_tokens = Some(tokens);
                                    }
                                }
                                StreamFrame::MessageStop => {
                                    let usage = input_tokens.map(|input| {
                                        TokenUsage::new(input, output_tokens.unwrap_or(0))
                                    });
                                    yield StreamEvent::Done {
                                        finish_reason: stop_reason,
                                        usage,
                                    };
                                }
                                StreamFrame::ContentBlockStart { .. }
                                | StreamFrame::ContentBlockStop { .. }
                                | StreamFrame::Ping
                                | StreamFrame::Unknown => {}
                            }
                        }
                    }
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelInfo>>> {
        Box::pin(async move {
            let api_key = self.api_key()?;
            let response = self
                .client
                .get(format!("{}/models", self.base_url))
                .header("x-api-key", api_key)
                .header("anthropic-version", API_VERSION)
                .send()
                .await
                .map_err(|error| ProviderError::from_transport(self.name(), &error))?;

            if !response.status().is_success() {
                return Err(error_from_response(self.name(), response).await);
            }

            #[derive(Deserialize)]
            struct ModelList {
                data: Vec<ModelEntry>,
            }
            #[derive(Deserialize)]
            struct ModelEntry {
                id: String,
                display_name: Option<String>,
            }

            let list: ModelList = response.json().await.map_err(|error| {
                ProviderError::new(
                    ErrorKind::UnknownProvider,
                    self.name(),
                    format!("model list decode failed: {error}"),
                )
            })?;

            Ok(list
                .data
                .into_iter()
                .map(|entry| ModelInfo {
                    id: entry.id,
                    display_name: entry.display_name,
                    context_window: None,
                    owned_by: None,
                })
                .collect())
        })
    }
}
