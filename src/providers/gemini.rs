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

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safety_settings: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<ApiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<ApiFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

// ─── Mapping ─────────────────────────────────────────────────────────────────

fn map_finish_reason(finish_reason: Option<&str>, has_calls: bool) -> FinishReason {
    if has_calls {
        return FinishReason::ToolCalls;
    }
    match finish_reason {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "BLOCKLIST") => {
            FinishReason::ContentFilter
        }
        Some(_) | None => FinishReason::Error,
    }
}

fn map_message(message: &Message) -> Option<Content> {
    match message.role {
        // handled via systemInstruction
        MessageRole::System => None,
        MessageRole::User => {
            let parts = message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => Part {
                        text: Some(text.clone()),
                        ..Part::default()
                    },
                    ContentPart::Image { source } => match source {
                        ImageSource::Base64 { media_type, data } => Part {
                            inline_data: Some(InlineData {
                                mime_type: media_type.clone(),
                                data: data.clone(),
                            }),
                            ..Part::default()
                        },
                        ImageSource::Url { url } => Part {
                            text: Some(url.clone()),
                            ..Part::default()
                        },
                    },
                })
                .collect();
            Some(Content {
                role: Some("user".to_string()),
                parts,
            })
        }
        MessageRole::Assistant => {
            let mut parts = Vec::new();
            let text = message.text_content();
            if !text.is_empty() {
                parts.push(Part {
                    text: Some(text),
                    ..Part::default()
                });
            }
            for call in recorded_calls(message) {
                parts.push(Part {
                    function_call: Some(ApiFunctionCall {
                        name: call.name,
                        args: Some(call.arguments),
                    }),
                    ..Part::default()
                });
            }
            if parts.is_empty() {
                None
            } else {
                Some(Content {
                    role: Some("model".to_string()),
                    parts,
                })
            }
        }
        MessageRole::Tool => {
            let text = message.text_content();
            let response = serde_json::from_str::<Value>(&text)
                .map_or_else(|_| serde_json::json!({ "result": text }), |parsed| {
                    if parsed.is_object() {
                        parsed
                    } else {
                        serde_json::json!({ "result": parsed })
                    }
                });
            Some(Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    function_response: Some(ApiFunctionResponse {
                        name: message.name.clone().unwrap_or_default(),
                        response,
                    }),
                    ..Part::default()
                }],
            })
        }
    }
}

fn build_request(messages: &[Message], options: &ChatOptions) -> ApiRequest {
    let system_parts: Vec<Part> = messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .filter_map(|message| {
            let text = message.text_content();
            if text.is_empty() {
                None
            } else {
                Some(Part {
                    text: Some(text),
                    ..Part::default()
                })
            }
        })
        .collect();

    let generation_config = if options.temperature.is_none()
        && options.max_tokens.is_none()
        && options.top_p.is_none()
    {
        None
    } else {
        Some(GenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
            top_p: options.top_p,
        })
    };

    let tools = if options.functions.is_empty() {
        None
    } else {
        Some(vec![ToolDeclarations {
            function_declarations: options
                .functions
                .iter()
                .map(|spec| FunctionDeclaration {
                    name: spec.name.clone(),
                    description: spec.sanitized_description(),
                    parameters: spec.parameters.clone(),
                })
                .collect(),
        }])
    };

    ApiRequest {
        contents: messages.iter().filter_map(map_message).collect(),
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: system_parts,
            })
        },
        generation_config,
        tools,
        safety_settings: options.safety_settings.clone(),
    }
}

const KNOWN_RESPONSE_FIELDS: &[&str] = &["candidates", "usageMetadata", "modelVersion"];

fn parse_response(provider: &str, value: Value) -> Result<Response> {
    let api_response: ApiResponse = serde_json::from_value(value.clone()).map_err(|error| {
        ProviderError::new(
            ErrorKind::UnknownProvider,
            provider,
            format!("response decode failed: {error}"),
        )
    })?;

    let candidates = api_response.candidates.unwrap_or_default();
    if candidates.is_empty() {
        let reason = api_response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason);
        if let Some(reason) = reason {
            return Err(ProviderError::new(
                ErrorKind::SafetyViolation,
                provider,
                format!("prompt blocked: {reason}"),
            ));
        }
        return Err(ProviderError::new(
            ErrorKind::UnknownProvider,
            provider,
            "no candidates in response",
        ));
    }

    // function calls nest inside each candidate's content parts
    let candidate = candidates.into_iter().next().unwrap_or(Candidate {
        content: None,
        finish_reason: None,
    });
    let mut content = String::new();
    let mut function_calls = Vec::new();
    if let Some(candidate_content) = candidate.content {
        for part in candidate_content.parts {
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                function_calls.push(FunctionCallRequest {
                    name: call.name,
                    arguments: call.args.unwrap_or_else(|| serde_json::json!({})),
                    call_id: None,
                });
            }
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

    let has_calls = !function_calls.is_empty();
    Ok(Response {
        content,
        model: api_response.model_version,
        provider: provider.to_string(),
        finish_reason: Some(map_finish_reason(
            candidate.finish_reason.as_deref(),
            has_calls,
        )),
        usage: api_response.usage_metadata.map(|usage| {
            TokenUsage::new(
                usage.prompt_token_count.unwrap_or(0),
                usage.candidates_token_count.unwrap_or(0),
            )
        }),
        function_calls,
        latency: None,
        metadata,
        streamed: false,
    })
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl GeminiAdapter {
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
                "missing API key (set GEMINI_API_KEY)",
            )
        })
    }

    fn model_for(&self, options: &ChatOptions) -> String {
        options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    async fn post_generate(
        &self,
        url: String,
        request: &ApiRequest,
    ) -> Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(url)
            .query(&[("key", api_key)])
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

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
            let model = self.model_for(options);
            let request = build_request(messages, options);
            let url = format!("{}/models/{model}:generateContent", self.base_url);
            let response = self.post_generate(url, &request).await?;
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
            let model = self.model_for(options);
            let request = build_request(messages, options);
            let url = format!(
                "{}/models/{model}:streamGenerateContent?alt=sse",
                self.base_url
            );
            let response = self.post_generate(url, &request).await?;
            let provider = self.name().to_string();
            let mut byte_stream = response.bytes_stream();

            let stream = async_stream::try_stream! {
                let mut sse_buffer = SseBuffer::new();
                let mut sent_start = false;
                let mut finish: Option<FinishReason> = None;
                let mut usage: Option<TokenUsage> = None;
                let mut saw_call = false;

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
                            let Ok(chunk) = serde_json::from_str::<ApiResponse>(data) else {
                                continue;
                            };

                            if !sent_start {
                                yield StreamEvent::Start {
                                    model: chunk.model_version.clone(),
                                };
                                sent_start = true;
                            }

                            if let Some(meta) = &chunk.usage_metadata {
                                usage = Some(TokenUsage::new(
                                    meta.prompt_token_count.unwrap_or(0),
                                    meta.candidates_token_count.unwrap_or(0),
                                ));
                            }

                            for candidate in chunk.candidates.unwrap_or_default() {
                                if let Some(content) = candidate.content {
                                    for part in content.parts {
                                        if let Some(text) = part.text
                                            && !text.is_empty()
                                        {
                                            yield StreamEvent::ContentDelta { text };
                                        }
                                        if let Some(call) = part.function_call {
                                            saw_call = true;
                                            yield StreamEvent::FunctionCall {
                                                call: FunctionCallRequest {
                                                    name: call.name,
                                                    arguments: call
                                                        .args
                                                        .unwrap_or_else(|| serde_json::json!({})),
                                                    call_id: None,
                                                },
                                            };
                                        }
                                    }
                                }
                                if let Some(reason) = candidate.finish_reason.as_deref() {
                                    finish = Some(map_finish_reason(Some(reason), saw_call));
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
            let api_key = self.api_key()?;
            let response = self
                .client
                .get(format!("{}/models", self.base_url))
                .query(&[("key", api_key)])
                .send()
                .await
                .map_err(|error| ProviderError::from_transport(self.name(), &error))?;

            if !response.status().is_success() {
                return Err(error_from_response(self.name(), response).await);
            }

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct ModelList {
                models: Option<Vec<ModelEntry>>,
            }
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct ModelEntry {
                name: String,
                display_name: Option<String>,
                input_token_limit: Option<u64>,
            }

            let list: ModelList = response.json().await.map_err(|error| {
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
                .map(|entry| ModelInfo {
                    id: entry
                        .name
                        .strip_prefix("models/")
                        .unwrap_or(&entry.name)
                        .to_string(),
                    display_name: entry.display_name,
                    context_window: entry.input_token_limit,
                    owned_by: None,
                })
                .collect())
        })
    }
}
