use futures_util::StreamExt;
use modelgate::providers::ollama::OllamaAdapter;
use modelgate::{ChatOptions, FinishReason, LlmDriver, Message};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn driver_for(server: &MockServer) -> LlmDriver {
    LlmDriver::new(Arc::new(OllamaAdapter::with_base_url(server.uri())))
}

#[tokio::test]
async fn completes_without_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({
            "model": "llama3.2",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "local hello"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 14,
            "eval_count": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let response = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "local hello");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.unwrap().total_tokens(), 17);
}

#[tokio::test]
async fn local_models_cost_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "free"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 1_000,
            "eval_count": 1_000
        })))
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let response = driver
        .send_message(&[Message::user("hi")], &ChatOptions::default())
        .await
        .unwrap();
    let breakdown = driver.calculate_cost(&response).unwrap();
    assert!(breakdown.total_cost.abs() < f64::EPSILON);
}

#[tokio::test]
async fn streams_newline_delimited_json() {
    let ndjson_body = concat!(
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"str\"},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"eam\"},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":10,\"eval_count\":2}\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(ndjson_body, "application/x-ndjson"),
        )
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
    assert_eq!(chunks[1].content, "stream");
    let terminal = chunks.last().unwrap();
    assert_eq!(terminal.content, "stream");
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    assert_eq!(terminal.usage.unwrap().total_tokens(), 12);
}

#[tokio::test]
async fn whole_tool_calls_arrive_in_stream() {
    let ndjson_body = concat!(
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\",\"tool_calls\":[{\"function\":{\"name\":\"calc\",\"arguments\":{\"a\":2,\"b\":2}}}]},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\"}\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(ndjson_body, "application/x-ndjson"),
        )
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
    assert_eq!(
        terminal.function_calls[0].arguments,
        serde_json::json!({"a": 2, "b": 2})
    );
}

#[tokio::test]
async fn lists_installed_models_from_tags() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [
                {"name": "llama3.2:latest"},
                {"name": "qwen2.5-coder:7b"}
            ]
        })))
        .mount(&server)
        .await;

    let driver = driver_for(&server);
    let result = driver.sync_models(false).await.unwrap();
    assert_eq!(result.added, 2);
    let models = driver.cached_models().await;
    assert!(models.iter().any(|model| model.id == "qwen2.5-coder:7b"));
}
