use futures_util::StreamExt;
use modelgate::providers::openai::OpenAiAdapter;
use modelgate::{
    ChatOptions, ErrorKind, FinishReason, LlmDriver, Message, ModelInfo, ProviderAdapter,
};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn driver_for(server: &MockServer) -> LlmDriver {
    LlmDriver::new(Arc::new(OpenAiAdapter::with_base_url(
        Some("test-key".to_string()),
        server.uri(),
    )))
}

fn chat_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o-mini",
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 4}
    })
}

#[tokio::test]
async fn completes_a_simple_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(
            serde_json::json!({"model": "gpt-4o-mini"}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("hello there")))
        .expect(1)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let response = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "hello there");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.unwrap().total_tokens(), 13);
    assert!(response.latency.is_some());
}

#[tokio::test]
async fn unauthorized_maps_to_invalid_credentials_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"message": "Incorrect API key provided", "code": "invalid_api_key"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let error = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::InvalidCredentials);
    assert!(!error.retryable);
    assert_eq!(error.attempts, 1);
    assert_eq!(error.code.as_deref(), Some("invalid_api_key"));
}

#[tokio::test]
async fn rate_limits_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "0")
                .set_body_json(serde_json::json!({
                    "error": {"message": "Rate limit reached", "type": "rate_limit_error"}
                })),
        )
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("recovered")))
        .expect(1)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let response = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "recovered");
}

#[tokio::test]
async fn persistent_server_errors_surface_with_attempt_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(500)
                .insert_header("retry-after", "0")
                .set_body_string("internal error"),
        )
        .expect(3)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let error = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::ServerError);
    assert_eq!(error.attempts, 3);
}

#[tokio::test]
async fn quota_exhaustion_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {"message": "You exceeded your current quota", "type": "insufficient_quota"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let error = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::QuotaExceeded);
    assert_eq!(error.attempts, 1);
}

#[tokio::test]
async fn streams_content_and_usage_over_sse() {
    let sse_body = concat!(
        "data: {\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let mut stream = driver
        .send_streaming_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content, "Hel");
    assert!(chunks[0].finish_reason.is_none());
    assert_eq!(chunks[1].content, "Hello");

    let terminal = chunks.last().unwrap();
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    assert_eq!(terminal.content, "Hello");
    assert_eq!(terminal.model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(terminal.usage.unwrap().total_tokens(), 7);
    assert!(terminal.streamed);
}

#[tokio::test]
async fn streamed_tool_call_fragments_reassemble() {
    let sse_body = concat!(
        "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"calc\",\"arguments\":\"{\\\"a\\\": 2,\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\" \\\"b\\\": 2}\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let mut stream = driver
        .send_streaming_message(&[Message::user("2+2")], &ChatOptions::default())
        .await
        .unwrap();

    let mut last = None;
    while let Some(chunk) = stream.next().await {
        last = Some(chunk.unwrap());
    }
    let terminal = last.unwrap();

    assert_eq!(terminal.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(terminal.function_calls.len(), 1);
    let call = &terminal.function_calls[0];
    assert_eq!(call.name, "calc");
    assert_eq!(call.call_id.as_deref(), Some("call_1"));
    assert_eq!(call.arguments, serde_json::json!({"a": 2, "b": 2}));
}

#[tokio::test]
async fn sync_models_tracks_catalog_changes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"id": "gpt-4o", "owned_by": "openai"},
                {"id": "gpt-4o-mini", "owned_by": "openai"}
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"id": "gpt-4o", "owned_by": "system"},
                {"id": "gpt-4.1", "owned_by": "openai"}
            ]
        })))
        .mount(&server)
        .await;

    let driver = driver_for(&server);

    let first = driver.sync_models(false).await.unwrap();
    assert!(first.refreshed);
    assert_eq!(first.added, 2);
    assert_eq!(first.updated, 0);

    // fresh cache short-circuits without a fetch
    let cached = driver.sync_models(false).await.unwrap();
    assert!(!cached.refreshed);

    let second = driver.sync_models(true).await.unwrap();
    assert!(second.refreshed);
    assert_eq!(second.added, 1);
    assert_eq!(second.updated, 1);
    assert_eq!(second.removed, 1);

    let models: Vec<ModelInfo> = driver.cached_models().await;
    assert!(models.iter().any(|model| model.id == "gpt-4.1"));
    assert!(!models.iter().any(|model| model.id == "gpt-4o-mini"));
}

#[tokio::test]
async fn failed_sync_keeps_previous_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"id": "gpt-4o", "owned_by": "openai"}]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(500).set_body_string("catalog offline"))
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    driver.sync_models(false).await.unwrap();

    let error = driver.sync_models(true).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ServerError);

    let models = driver.cached_models().await;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "gpt-4o");
}

#[tokio::test]
async fn missing_key_fails_before_any_request() {
    let server = MockServer::start().await;
    let adapter = OpenAiAdapter::with_base_url(None, server.uri());
    let error = adapter
        .complete(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::InvalidCredentials);
    assert!(server.received_requests().await.unwrap().is_empty());
}
