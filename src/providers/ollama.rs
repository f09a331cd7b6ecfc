use super::http::build_client;
use super::streaming::{EventStream, StreamEvent};
use super::traits::{
    AdapterCapabilities, BoxFuture, ChatOptions, ModelInfo, ProviderAdapter, ProviderKind,
};
use super::{error_from_response, openai::recorded_calls};
use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{FinishReason, FunctionCallRequest, Message, MessageRole, Response, TokenUsage};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<RequestOptions>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    function: ApiFunctionCall,
}

/// Unlike the OpenAI wire format, arguments arrive as a JSON object, not a
/// string.
#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunctionSpec,
}

#[derive(Debug, Serialize)]
struct ApiFunctionSpec {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct RequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: Option<String>,
    message: Option<ApiMessage>,
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

// ─── Mapping ─────────────────────────────────────────────────────────────────

fn map_done_reason(done_reason: Option<&str>, has_calls: bool) -> FinishReason {
    if has_calls {
        return FinishReason::ToolCalls;
    }
    match done_reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn map_message(message: &Message) -> ApiMessage {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };

    let tool_calls = if message.role == MessageRole::Assistant {
        let calls = recorded_calls(message);
        if calls.is_empty() {
            None
        } else {
            Some(
                calls
                    .into_iter()
                    .map(|call| ApiToolCall {
                        function: ApiFunctionCall {
                            name: call.name,
                            arguments: call.arguments,
                        },
                    })
                    .collect(),
            )
        }
    } else {
        None
    };

    ApiMessage {
        role: role.to_string(),
        content: message.text_content(),
        tool_calls,
    }
}

fn build_request(
    model: String,
    messages: &[Message],
    options: &ChatOptions,
    stream: bool,
) -> ApiRequest {
    let tools = if options.functions.is_empty() {
        None
    } else {
        Some(
            options
                .functions
                .iter()
                .map(|spec| ApiTool {
                    tool_type: "function".to_string(),
                    function: ApiFunctionSpec {
                        name: spec.name.clone(),
                        description: spec.sanitized_description(),
                        parameters: spec.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    let request_options = if options.temperature.is_none()
        && options.max_tokens.is_none()
        && options.top_p.is_none()
    {
        None
    } else {
        Some(RequestOptions {
            temperature: options.temperature,
            num_predict: options.max_tokens,
            top_p: options.top_p,
        })
    };

    ApiRequest {
        model,
        messages: messages.iter().map(map_message).collect(),
        stream,
        tools,
        options: request_options,
        extra: options.extra.clone(),
    }
}

fn calls_from_message(message: &ApiMessage) -> Vec<FunctionCallRequest> {
    message
        .tool_calls
        .as_ref()
        .map(|calls| {
            calls
                .iter()
                .map(|call| FunctionCallRequest {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                    call_id: None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn usage_from_counts(prompt: Option<u64>, eval: Option<u64>) -> Option<TokenUsage> {
    if prompt.is_none() && eval.is_none() {
        return None;
    }
    Some(TokenUsage::new(prompt.unwrap_or(0), eval.unwrap_or(0)))
}

fn parse_response(provider: &str, api_response: &ApiResponse) -> Response {
    let (content, function_calls) = api_response.message.as_ref().map_or_else(
        || (String::new(), Vec::new()),
        |message| (message.content.clone(), calls_from_message(message)),
    );
    let has_calls = !function_calls.is_empty();

    Response {
        content,
        model: api_response.model.clone(),
        provider: provider.to_string(),
        finish_reason: Some(map_done_reason(
            api_response.done_reason.as_deref(),
            has_calls,
        )),
        usage: usage_from_counts(api_response.prompt_eval_count, api_response.eval_count),
        function_calls,
        latency: None,
        metadata: serde_json::Map::new(),
        streamed: false,
    }
}

/// Line buffer for newline-delimited JSON bodies. Holds partial lines across
/// chunk boundaries; decoding waits for the terminating newline so UTF-8
/// sequences split mid-chunk reassemble correctly.
struct NdjsonBuffer {
    bytes: Vec<u8>,
}

impl NdjsonBuffer {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.bytes.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=newline).collect();
        let text = String::from_utf8_lossy(&line);
        Some(text.trim().to_string())
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

/// Local inference over the Ollama HTTP API. No authentication; failures to
/// connect usually mean the daemon is not running.
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl OllamaAdapter {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(300), Duration::from_secs(10)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn model_for(&self, options: &ChatOptions) -> String {
        options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    async fn post_chat(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
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

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            function_calling: true,
            vision: false,
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
            let request = build_request(self.model_for(options), messages, options, false);
            let response = self.post_chat(&request).await?;
            let api_response: ApiResponse = response.json().await.map_err(|error| {
                ProviderError::new(
                    ErrorKind::UnknownProvider,
                    self.name(),
                    format!("response JSON decode failed: {error}"),
                )
            })?;
            Ok(parse_response(self.name(), &api_response))
        })
    }

    fn stream<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a ChatOptions,
    ) -> BoxFuture<'a, Result<EventStream>> {
        Box::pin(async move {
            let request = build_request(self.model_for(options), messages, options, true);
            let response = self.post_chat(&request).await?;
            let provider = self.name().to_string();
            let mut byte_stream = response.bytes_stream();

            let stream = async_stream::try_stream! {
                let mut buffer = NdjsonBuffer::new();
                let mut sent_start = false;
                let mut saw_call = false;

                while let Some(chunk_result) = byte_stream.next().await {
                    let bytes = chunk_result.map_err(|error| {
                        ProviderError::new(
                            ErrorKind::ServerError,
                            provider.clone(),
                            format!("stream read failed: {error}"),
                        )
                    })?;
                    buffer.push_chunk(&bytes);

                    while let Some(line) = buffer.next_line() {
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(chunk) = serde_json::from_str::<ApiResponse>(&line) else {
                            continue;
                        };

                        if !sent_start {
                            yield StreamEvent::Start {
                                model: chunk.model.clone(),
                            };
                            sent_start = true;
                        }

                        if let Some(message) = &chunk.message {
                            if !message.content.is_empty() {
                                yield StreamEvent::ContentDelta {
                                    text: message.content.clone(),
                                };
                            }
                            for call in calls_from_message(message) {
                                saw_call = true;
                                yield StreamEvent::FunctionCall { call };
                            }
                        }

                        if chunk.done {
                            yield StreamEvent::Done {
                                finish_reason: Some(map_done_reason(
                                    chunk.done_reason.as_deref(),
                                    saw_call,
                                )),
                                usage: usage_from_counts(
                                    chunk.prompt_eval_count,
                                    chunk.eval_count,
                                ),
                            };
                        }
                    }
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelInfo>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/api/tags", self.base_url))
                .send()
                .await
                .map_err(|error| ProviderError::from_transport(self.name(), &error))?;

            if !response.status().is_success() {
                return Err(error_from_response(self.name(), response).await);
            }

            #[derive(Deserialize)]
            struct TagList {
                models: Option<Vec<TagEntry>>,
            }
            #[derive(Deserialize)]
            struct TagEntry {
                name: String,
            }

            let list: TagList = response.json().await.map_err(|error| {
                ProviderError::new(
                    ErrorKind::UnknownProvider,
                    self.name(),
                    format!("model list decode failed: {error}"),
                )
            })?;

            Ok(list
                .models
                .unwrap_or_default()
                .into_iter()
                .map(|entry| ModelInfo::id_only(entry.name))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::FunctionSpec;

    #[test]
    fn request_places_sampling_knobs_under_options() {
        let options = ChatOptions::default()
            .with_temperature(0.1)
            .with_max_tokens(64);
        let request = build_request("llama3.2".into(), &[Message::user("hi")], &options, false);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["options"]["num_predict"], 64);
        assert_eq!(json["stream"], false);
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn tool_arguments_serialize_as_object_not_string() {
        let options = ChatOptions::default().with_functions(vec![FunctionSpec::new(
            "calc",
            "arithmetic",
            serde_json::json!({"type": "object", "properties": {"a": {"type": "number"}}}),
        )]);
        let request = build_request("llama3.2".into(), &[Message::user("2+2")], &options, false);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json["tools"][0]["function"]["parameters"].is_object());
    }

    #[test]
    fn parse_response_maps_counts_and_calls() {
        let api_response: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "calc", "arguments": {"a": 2, "b": 2}}}
                ]
            },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 30,
            "eval_count": 12
        }))
        .unwrap();
        let response = parse_response("ollama", &api_response);
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(
            response.function_calls[0].arguments,
            serde_json::json!({"a": 2, "b": 2})
        );
        assert_eq!(response.usage.unwrap().total_tokens(), 42);
    }

    #[test]
    fn done_reason_length_maps_to_length() {
        assert_eq!(map_done_reason(Some("length"), false), FinishReason::Length);
        assert_eq!(map_done_reason(Some("stop"), false), FinishReason::Stop);
        assert_eq!(map_done_reason(None, false), FinishReason::Stop);
    }

    #[test]
    fn ndjson_buffer_holds_partial_lines() {
        let mut buffer = NdjsonBuffer::new();
        buffer.push_chunk(b"{\"done\":fal");
        assert!(buffer.next_line().is_none());
        buffer.push_chunk(b"se}\n{\"done\":true}\n");
        assert_eq!(buffer.next_line().as_deref(), Some("{\"done\":false}"));
        assert_eq!(buffer.next_line().as_deref(), Some("{\"done\":true}"));
        assert!(buffer.next_line().is_none());
    }

    #[test]
    fn missing_counts_yield_no_usage() {
        assert!(usage_from_counts(None, None).is_none());
        assert_eq!(
            usage_from_counts(Some(5), None).map(|usage| usage.total_tokens()),
            Some(5)
        );
    }
}
