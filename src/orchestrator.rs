use crate::driver::LlmDriver;
use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{FunctionCallRequest, Message, Response};
use crate::providers::traits::{BoxFuture, ChatOptions, FunctionSpec};
use futures_util::future::join_all;
use serde_json::Value;

/// Host-side function registry. `execute` returns the function's JSON result
/// or a human-readable failure the model can react to.
pub trait FunctionExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        call: &'a FunctionCallRequest,
    ) -> BoxFuture<'a, std::result::Result<Value, String>>;
}

// ─── Argument coercion ───────────────────────────────────────────────────────

/// Repair string-typed scalars against the declared JSON-Schema parameter
/// types. Models sometimes emit `"2"` where the schema says `number`; a clean
/// parse is substituted, anything ambiguous is left for the executor.
fn coerce_scalar(expected: &str, raw: &str) -> Option<Value> {
    match expected {
        "number" => raw.trim().parse::<f64>().ok().and_then(|parsed| {
            serde_json::Number::from_f64(parsed).map(Value::Number)
        }),
        "integer" => raw.trim().parse::<i64>().ok().map(Value::from),
        "boolean" => match raw.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        "null" => (raw.trim() == "null").then_some(Value::Null),
        _ => None,
    }
}

/// Coerce a call's arguments against its [`FunctionSpec`], if one is known.
pub fn coerce_arguments(spec: Option<&FunctionSpec>, mut arguments: Value) -> Value {
    let Some(spec) = spec else {
        return arguments;
    };
    let Some(properties) = spec.parameters.get("properties").and_then(Value::as_object) else {
        return arguments;
    };
    let Some(fields) = arguments.as_object_mut() else {
        return arguments;
    };

    for (key, declared) in properties {
        let Some(expected) = declared.get("type").and_then(Value::as_str) else {
            continue;
        };
        let Some(Value::String(raw)) = fields.get(key) else {
            continue;
        };
        if let Some(coerced) = coerce_scalar(expected, raw) {
            tracing::debug!(
                function = spec.name.as_str(),
                field = key.as_str(),
                expected,
                "coerced string argument to declared type"
            );
            fields.insert(key.clone(), coerced);
        }
    }
    arguments
}

fn result_to_content(result: std::result::Result<Value, String>) -> (String, bool) {
    match result {
        Ok(Value::String(text)) => (text, false),
        Ok(value) => (value.to_string(), false),
        Err(message) => (
            serde_json::json!({ "error": message }).to_string(),
            true,
        ),
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Drives the send → execute → resubmit tool loop until the model answers in
/// plain text or the round limit trips.
pub struct FunctionCallOrchestrator<'d> {
    driver: &'d LlmDriver,
    max_rounds: u32,
}

impl<'d> FunctionCallOrchestrator<'d> {
    pub fn new(driver: &'d LlmDriver) -> Self {
        Self {
            driver,
            max_rounds: driver.config().max_function_rounds,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub async fn run(
        &self,
        executor: &dyn FunctionExecutor,
        mut messages: Vec<Message>,
        options: &ChatOptions,
    ) -> Result<Response> {
        for round in 0..self.max_rounds {
            let response = self.driver.send_message(&messages, options).await?;
            if !response.has_function_calls() {
                return Ok(response);
            }

            tracing::debug!(
                round,
                calls = response.function_calls.len(),
                "executing requested function calls"
            );
            messages.push(response.to_assistant_message());

            let calls: Vec<FunctionCallRequest> = response
                .function_calls
                .iter()
                .map(|call| {
                    let spec = options.functions.iter().find(|spec| spec.name == call.name);
                    FunctionCallRequest {
                        name: call.name.clone(),
                        arguments: coerce_arguments(spec, call.arguments.clone()),
                        call_id: call.call_id.clone(),
                    }
                })
                .collect();

            let results = join_all(calls.iter().map(|call| executor.execute(call))).await;

            for (call, result) in calls.iter().zip(results) {
                let (content, is_error) = result_to_content(result);
                messages.push(Message::tool_result(
                    call.name.clone(),
                    call.call_id.clone(),
                    content,
                    is_error,
                ));
            }
        }

        let mut error = ProviderError::new(
            ErrorKind::FunctionCallingLimitExceeded,
            self.driver.adapter().name(),
            format!(
                "model kept requesting functions after {} rounds",
                self.max_rounds
            ),
        );
        error.retryable = false;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinishReason, MessageRole};
    use crate::providers::traits::{AdapterCapabilities, ProviderAdapter, ProviderKind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn calc_spec() -> FunctionSpec {
        FunctionSpec::new(
            "calc",
            "basic arithmetic",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"},
                    "op": {"type": "string"}
                },
                "required": ["a", "b", "op"]
            }),
        )
    }

    #[test]
    fn coercion_repairs_stringified_numbers() {
        let spec = calc_spec();
        let coerced = coerce_arguments(
            Some(&spec),
            serde_json::json!({"a": "2", "b": 3, "op": "add"}),
        );
        assert_eq!(coerced["a"], serde_json::json!(2.0));
        assert_eq!(coerced["b"], 3);
        assert_eq!(coerced["op"], "add");
    }

    #[test]
    fn coercion_leaves_unparseable_strings_alone() {
        let spec = calc_spec();
        let coerced = coerce_arguments(
            Some(&spec),
            serde_json::json!({"a": "two", "b": 2, "op": "add"}),
        );
        assert_eq!(coerced["a"], "two");
    }

    #[test]
    fn coercion_without_spec_is_identity() {
        let arguments = serde_json::json!({"a": "2"});
        assert_eq!(coerce_arguments(None, arguments.clone()), arguments);
    }

    #[test]
    fn boolean_and_integer_coercion() {
        let spec = FunctionSpec::new(
            "toggle",
            "flip",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "enabled": {"type": "boolean"},
                    "count": {"type": "integer"}
                }
            }),
        );
        let coerced = coerce_arguments(
            Some(&spec),
            serde_json::json!({"enabled": "true", "count": "7"}),
        );
        assert_eq!(coerced["enabled"], true);
        assert_eq!(coerced["count"], 7);
    }

    #[test]
    fn executor_errors_become_error_payloads() {
        let (content, is_error) = result_to_content(Err("division by zero".into()));
        assert!(is_error);
        assert!(content.contains("division by zero"));
        let (content, is_error) = result_to_content(Ok(serde_json::json!(4)));
        assert!(!is_error);
        assert_eq!(content, "4");
    }

    /// Requests one `calc` call on the first exchange, then answers with the
    /// tool result's text.
    struct CalcAdapter {
        calls: AtomicUsize,
        always_request: bool,
    }

    impl ProviderAdapter for CalcAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Ollama
        }

        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities {
                streaming: false,
                function_calling: true,
                vision: false,
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn complete<'a>(
            &'a self,
            messages: &'a [Message],
            _options: &'a ChatOptions,
        ) -> BoxFuture<'a, Result<Response>> {
            Box::pin(async move {
                let round = self.calls.fetch_add(1, Ordering::SeqCst);
                if round == 0 || self.always_request {
                    let mut response = Response::text(self.name(), "");
                    response.finish_reason = Some(FinishReason::ToolCalls);
                    response.function_calls.push(FunctionCallRequest {
                        name: "calc".into(),
                        arguments: serde_json::json!({"a": "2", "b": 2, "op": "add"}),
                        call_id: Some("call_1".into()),
                    });
                    return Ok(response);
                }
                let answer = messages
                    .iter()
                    .rev()
                    .find(|message| message.role == MessageRole::Tool)
                    .map(Message::text_content)
                    .unwrap_or_default();
                Ok(Response::text(self.name(), answer))
            })
        }
    }

    struct CalcExecutor;

    impl FunctionExecutor for CalcExecutor {
        fn execute<'a>(
            &'a self,
            call: &'a FunctionCallRequest,
        ) -> BoxFuture<'a, std::result::Result<Value, String>> {
            Box::pin(async move {
                let a = call.arguments["a"].as_f64().ok_or("a must be a number")?;
                let b = call.arguments["b"].as_f64().ok_or("b must be a number")?;
                match call.arguments["op"].as_str() {
                    Some("add") => Ok(serde_json::json!(a + b)),
                    _ => Err("unsupported op".to_string()),
                }
            })
        }
    }

    #[tokio::test]
    async fn full_loop_executes_call_and_returns_answer() {
        let driver = LlmDriver::new(Arc::new(CalcAdapter {
            calls: AtomicUsize::new(0),
            always_request: false,
        }));
        let options = ChatOptions::default().with_functions(vec![calc_spec()]);
        let response = driver
            .run_function_loop(&CalcExecutor, vec![Message::user("what is 2+2?")], &options)
            .await
            .unwrap();
        // coercion turned "2" into a number before the executor ran
        assert_eq!(response.content, "4.0");
    }

    #[tokio::test]
    async fn runaway_loop_trips_round_limit() {
        let driver = LlmDriver::new(Arc::new(CalcAdapter {
            calls: AtomicUsize::new(0),
            always_request: true,
        }));
        let options = ChatOptions::default().with_functions(vec![calc_spec()]);
        let error = driver
            .run_function_loop(&CalcExecutor, vec![Message::user("loop forever")], &options)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::FunctionCallingLimitExceeded);
        assert!(!error.retryable);
    }
}
