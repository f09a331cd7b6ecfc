use super::http::build_client;
use super::sse::{SseBuffer, parse_data_lines};
use super::streaming::{EventStream, StreamEvent};
use super::traits::{
    AdapterCapabilities, BoxFuture, ChatOptions, ModelInfo, ProviderAdapter, ProviderKind,
};
use super::error_from_response;
use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{
    ContentPart, FinishReason, FunctionCallRequest, ImageSource, Message, MessageRole, Response,
    TokenUsage,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    r#type: &'static str,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiChunk {
    model: Option<String>,
    choices: Vec<ChunkChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    index: u32,
    id: Option<String>,
    function: Option<ChunkToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCallFunction {
    name: Option<String>,
    arguments: Option<String>,
}

// ─── Mapping ─────────────────────────────────────────────────────────────────

fn map_finish_reason(finish_reason: Option<&str>) -> FinishReason {
    match finish_reason {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("function_call") => FinishReason::FunctionCall,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) | None => FinishReason::Error,
    }
}

fn map_message(message: &Message) -> Vec<ApiMessage> {
    let text = message.text_content();
    match message.role {
        MessageRole::System => vec![ApiMessage {
            role: "system",
            content: Some(ApiContent::Text(text)),
            tool_call_id: None,
            tool_calls: None,
        }],
        MessageRole::User => {
            if message.has_images() {
                let parts = message
                    .content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => ApiContentPart::Text { text: text.clone() },
                        ContentPart::Image { source } => {
                            let url = match source {
                                ImageSource::Base64 { media_type, data } => {
                                    format!("data:{media_type};base64,{data}")
                                }
                                ImageSource::Url { url } => url.clone(),
                            };
                            ApiContentPart::ImageUrl {
                                image_url: ImageUrl { url },
                            }
                        }
                    })
                    .collect();
                vec![ApiMessage {
                    role: "user",
                    content: Some(ApiContent::Parts(parts)),
                    tool_call_id: None,
                    tool_calls: None,
                }]
            } else {
                vec![ApiMessage {
                    role: "user",
                    content: Some(ApiContent::Text(text)),
                    tool_call_id: None,
                    tool_calls: None,
                }]
            }
        }
        MessageRole::Assistant => {
            let tool_calls = recorded_calls(message)
                .into_iter()
                .map(|call| ApiToolCall {
                    id: call.call_id.unwrap_or_default(),
                    r#type: "function".to_string(),
                    function: ApiToolCallFunction {
                        name: call.name,
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect::<Vec<_>>();
            vec![ApiMessage {
                role: "assistant",
                content: if text.is_empty() {
                    None
                } else {
                    Some(ApiContent::Text(text))
                },
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            }]
        }
        MessageRole::Tool => vec![ApiMessage {
            role: "tool",
            content: Some(ApiContent::Text(text)),
            tool_call_id: message.call_id.clone(),
            tool_calls: None,
        }],
    }
}

/// Function calls recorded on a resubmitted assistant turn.
pub(crate) fn recorded_calls(message: &Message) -> Vec<FunctionCallRequest> {
    message
        .metadata
        .get("function_calls")
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

fn build_tools(options: &ChatOptions) -> Option<Vec<ApiTool>> {
    if options.functions.is_empty() {
        return None;
    }
    Some(
        options
            .functions
            .iter()
            .map(|spec| ApiTool {
                r#type: "function",
                function: ApiToolFunction {
                    name: spec.name.clone(),
                    description: spec.sanitized_description(),
                    parameters: spec.parameters.clone(),
                },
            })
            .collect(),
    )
}

fn build_request(
    messages: &[Message],
    options: &ChatOptions,
    default_model: &str,
    stream: bool,
) -> ApiRequest {
    ApiRequest {
        model: options
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        messages: messages.iter().flat_map(map_message).collect(),
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        top_p: options.top_p,
        frequency_penalty: options.frequency_penalty,
        presence_penalty: options.presence_penalty,
        tools: build_tools(options),
        tool_choice: options.tool_choice.clone(),
        stream: stream.then_some(true),
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        extra: options.extra.clone(),
    }
}

const KNOWN_RESPONSE_FIELDS: &[&str] = &["choices", "usage", "model", "object"];

fn parse_response(provider: &str, value: Value) -> Result<Response> {
    let api_response: ApiResponse = serde_json::from_value(value.clone()).map_err(|error| {
        ProviderError::new(
            ErrorKind::UnknownProvider,
            provider,
            format!("response decode failed: {error}"),
        )
    })?;

    let choice = api_response.choices.into_iter().next().ok_or_else(|| {
        ProviderError::new(ErrorKind::UnknownProvider, provider, "empty choices array")
    })?;

    let mut function_calls = Vec::new();
    for tool_call in choice.message.tool_calls.unwrap_or_default() {
        let arguments: Value =
            serde_json::from_str(&tool_call.function.arguments).map_err(|error| {
                ProviderError::new(
                    ErrorKind::UnknownProvider,
                    provider,
                    format!(
                        "tool call arguments for {} were not valid JSON: {error}",
                        tool_call.function.name
                    ),
                )
            })?;
        function_calls.push(FunctionCallRequest {
            name: tool_call.function.name,
            arguments,
            call_id: Some(tool_call.id),
        });
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
        content: choice.message.content.unwrap_or_default(),
        model: api_response.model,
        provider: provider.to_string(),
        finish_reason: Some(map_finish_reason(choice.finish_reason.as_deref())),
        usage: api_response
            .usage
            .map(|usage| TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)),
        function_calls,
        latency: None,
        metadata,
        streamed: false,
    })
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct OpenAiAdapter {
    client: reqwest::Client,
    auth_header: Option<String>,
    base_url: String,
    default_model: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(120), Duration::from_secs(10)),
            auth_header: api_key.map(|key| format!("Bearer {key}")),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn auth_header(&self) -> Result<&str> {
        self.auth_header.as_deref().ok_or_else(|| {
            ProviderError::new(
                ErrorKind::InvalidCredentials,
                self.name(),
                "missing API key (set OPENAI_API_KEY)",
            )
        })
    }

    async fn post_chat(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let auth = self.auth_header()?;
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", auth)
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

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
            let response = self.post_chat(&request).await?;
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
            let response = self.post_chat(&request).await?;
            let provider = self.name().to_string();
            let mut byte_stream = response.bytes_stream();

            let stream = async_stream::try_stream! {
                let mut sse_buffer = SseBuffer::new();
                let mut sent_start = false;
                let mut finish: Option<FinishReason> = None;
                let mut usage: Option<TokenUsage> = None;

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
                            let Ok(chunk) = serde_json::from_str::<ApiChunk>(data) else {
                                continue;
                            };

                            if !sent_start {
                                yield StreamEvent::Start {
                                    model: chunk.model.clone(),
                                };
                                sent_start = true;
                            }

                            // with include_usage the usage arrives in a
                            // trailing chunk whose choices array is empty
                            if let Some(u) = &chunk.usage {
                                usage = Some(TokenUsage::new(
                                    u.prompt_tokens,
                                    u.completion_tokens,
                                ));
                            }

                            for choice in &chunk.choices {
                                if let Some(content) = &choice.delta.content
                                    && !content.is_empty()
                                {
                                    yield StreamEvent::ContentDelta {
                                        text: content.clone(),
                                    };
                                }

                                if let Some(tool_calls) = &choice.delta.tool_calls {
                                    for tool_call in tool_calls {
                                        yield StreamEvent::FunctionCallDelta {
                                            index: tool_call.index,
                                            id: tool_call.id.clone(),
                                            name: tool_call
                                                .function
                                                .as_ref()
                                                .and_then(|f| f.name.clone()),
                                            arguments_delta: tool_call
                                                .function
                                                .as_ref()
                                                .and_then(|f| f.arguments.clone())
                                                .unwrap_or_default(),
                                        };
                                    }
                                }

                                if let Some(reason) = choice.finish_reason.as_deref() {
                                    finish = Some(map_finish_reason(Some(reason)));
                                }
                            }
                        }
                    }
                }

                if let Some(finish_reason) = finish {
                    yield StreamEvent::Done {
                        finish_reason: Some(finish_reason),
                        usage,
                    };
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelInfo>>> {
        Box::pin(async move {
            let auth = self.auth_header()?;
            let response = self
                .client
                .get(format!("{}/models", self.base_url))
                .header("Authorization", auth)
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
                owned_by: Option<String>,
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
                    display_name: None,
                    context_window: None,
                    owned_by: entry.owned_by,
                })
                .collect())
        })
    }
}
