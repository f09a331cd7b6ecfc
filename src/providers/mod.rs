pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod ollama;
pub mod openai;
pub mod sse;
pub mod streaming;
pub mod traits;

pub use streaming::{EventStream, StreamCollector, StreamEvent, resp_to_events};
pub use traits::{
    AdapterCapabilities, BoxFuture, ChatOptions, FunctionSpec, MAX_FUNCTION_DESCRIPTION_CHARS,
    ModelInfo, ProviderAdapter, ProviderKind,
};

use crate::error::ProviderError;
use crate::retry::parse_retry_after;

/// Build a [`ProviderError`] from a non-success HTTP response, pulling out
/// the request id and any `Retry-After` hint before consuming the body.
pub(crate) async fn error_from_response(
    provider: &str,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status().as_u16();
    let request_id = ["x-request-id", "request-id"]
        .iter()
        .find_map(|name| response.headers().get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);

    let body = response.text().await.unwrap_or_default();
    let mut error = ProviderError::from_http(provider, status, &body);
    if let Some(id) = request_id {
        error = error.with_request_id(id);
    }
    if let Some(delay) = retry_after {
        error = error.with_retry_after(delay);
    }
    error
}
