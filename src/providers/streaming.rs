use crate::error::Result;
use crate::model::{FinishReason, FunctionCallRequest, Response, TokenUsage};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Normalized streaming event, produced by every adapter regardless of the
/// backend's native encoding (SSE, typed SSE, NDJSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Start {
        model: Option<String>,
    },
    ContentDelta {
        text: String,
    },
    /// A fragment of an incrementally-streamed function call.
    FunctionCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// A function call delivered whole.
    FunctionCall {
        call: FunctionCallRequest,
    },
    Done {
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    },
}

struct CallBuilder {
    id: String,
    name: String,
    arguments_json: String,
}

/// Folds a stream of events into the final [`Response`], assembling
/// fragmented function-call JSON along the way.
pub struct StreamCollector {
    provider: String,
    content: String,
    calls: Vec<FunctionCallRequest>,
    builders: Vec<CallBuilder>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    model: Option<String>,
}

impl StreamCollector {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            content: String::new(),
            calls: Vec::new(),
            builders: Vec::new(),
            finish_reason: None,
            usage: None,
            model: None,
        }
    }

    pub fn feed(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Start { model } => {
                self.model.clone_from(model);
            }
            StreamEvent::ContentDelta { text } => {
                self.content.push_str(text);
            }
            StreamEvent::FunctionCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                if let Ok(builder_index) = usize::try_from(*index) {
                    while self.builders.len() <= builder_index {
                        self.builders.push(CallBuilder {
                            id: String::new(),
                            name: String::new(),
                            arguments_json: String::new(),
                        });
                    }
                    let builder = &mut self.builders[builder_index];
                    if let Some(call_id) = id {
                        builder.id.clone_from(call_id);
                    }
                    if let Some(call_name) = name {
                        builder.name.clone_from(call_name);
                    }
                    builder.arguments_json.push_str(arguments_delta);
                } else {
                    tracing::warn!(index, "skipping function call delta with bad index");
                }
            }
            StreamEvent::FunctionCall { call } => {
                self.calls.push(call.clone());
            }
            StreamEvent::Done {
                finish_reason,
                usage,
            } => {
                self.finish_reason = *finish_reason;
                self.usage = *usage;
            }
        }
    }

    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn saw_done(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn output_tokens(&self) -> Option<u64> {
        self.usage.map(|usage| usage.output_tokens())
    }

    pub fn finish(mut self) -> Response {
        for builder in self.builders {
            if builder.name.is_empty() {
                if !builder.arguments_json.trim().is_empty() {
                    tracing::warn!("skipping incomplete streamed function call (missing name)");
                }
                continue;
            }
            let raw = if builder.arguments_json.trim().is_empty() {
                "{}"
            } else {
                builder.arguments_json.as_str()
            };
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(arguments) => {
                    self.calls.push(FunctionCallRequest {
                        name: builder.name,
                        arguments,
                        call_id: if builder.id.is_empty() {
                            None
                        } else {
                            Some(builder.id)
                        },
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        call_name = builder.name.as_str(),
                        "skipping malformed streamed function call JSON: {error}"
                    );
                }
            }
        }

        let finish_reason = self.finish_reason.unwrap_or({
            if self.calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }
        });

        Response {
            content: self.content,
            model: self.model,
            provider: self.provider,
            finish_reason: Some(finish_reason),
            usage: self.usage,
            function_calls: self.calls,
            latency: None,
            metadata: serde_json::Map::new(),
            streamed: true,
        }
    }
}

/// Replay a buffered response as a short event stream. Used as the fallback
/// for backends called without native streaming.
pub fn resp_to_events(response: Response) -> Vec<Result<StreamEvent>> {
    let Response {
        content,
        model,
        finish_reason,
        usage,
        function_calls,
        ..
    } = response;

    let mut events = vec![Ok(StreamEvent::Start { model })];
    if !content.is_empty() {
        events.push(Ok(StreamEvent::ContentDelta { text: content }));
    }
    for call in function_calls {
        events.push(Ok(StreamEvent::FunctionCall { call }));
    }
    events.push(Ok(StreamEvent::Done {
        finish_reason,
        usage,
    }));
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_text_only() {
        let mut collector = StreamCollector::new("openai");
        collector.feed(&StreamEvent::Start {
            model: Some("gpt-4o".into()),
        });
        collector.feed(&StreamEvent::ContentDelta {
            text: "hello ".into(),
        });
        collector.feed(&StreamEvent::ContentDelta {
            text: "world".into(),
        });
        collector.feed(&StreamEvent::Done {
            finish_reason: Some(FinishReason::Stop),
            usage: Some(TokenUsage::new(10, 2)),
        });
        let response = collector.finish();
        assert_eq!(response.content, "hello world");
        assert_eq!(response.model.as_deref(), Some("gpt-4o"));
        assert!(response.streamed);
        assert_eq!(response.usage.unwrap().total_tokens(), 12);
    }

    #[test]
    fn collector_assembles_fragmented_call() {
        let mut collector = StreamCollector::new("openai");
        collector.feed(&StreamEvent::FunctionCallDelta {
            index: 0,
            id: Some("call_1".into()),
            name: Some("calc".into()),
            arguments_delta: "{\"a\": 2,".into(),
        });
        collector.feed(&StreamEvent::FunctionCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments_delta: " \"b\": 2}".into(),
        });
        collector.feed(&StreamEvent::Done {
            finish_reason: Some(FinishReason::ToolCalls),
            usage: None,
        });
        let response = collector.finish();
        assert_eq!(response.function_calls.len(), 1);
        let call = &response.function_calls[0];
        assert_eq!(call.name, "calc");
        assert_eq!(call.call_id.as_deref(), Some("call_1"));
        assert_eq!(call.arguments, serde_json::json!({"a": 2, "b": 2}));
    }

    #[test]
    fn malformed_call_json_is_skipped_not_fatal() {
        let mut collector = StreamCollector::new("openai");
        collector.feed(&StreamEvent::FunctionCallDelta {
            index: 0,
            id: Some("call_1".into()),
            name: Some("calc".into()),
            arguments_delta: "{not json".into(),
        });
        let response = collector.finish();
        assert!(response.function_calls.is_empty());
    }

    #[test]
    fn missing_done_defaults_finish_reason() {
        let mut collector = StreamCollector::new("gemini");
        collector.feed(&StreamEvent::ContentDelta { text: "hi".into() });
        let response = collector.finish();
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn resp_to_events_round_trips_through_collector() {
        let mut original = Response::text("anthropic", "done");
        original.function_calls.push(FunctionCallRequest {
            name: "search".into(),
            arguments: serde_json::json!({"q": "rust"}),
            call_id: Some("toolu_1".into()),
        });
        let events = resp_to_events(original);
        let mut collector = StreamCollector::new("anthropic");
        for event in events {
            collector.feed(&event.unwrap());
        }
        let rebuilt = collector.finish();
        assert_eq!(rebuilt.content, "done");
        assert_eq!(rebuilt.function_calls.len(), 1);
    }
}
