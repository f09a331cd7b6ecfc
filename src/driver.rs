use crate::config::DriverConfig;
use crate::cost::{CHARS_PER_TOKEN, CostBreakdown, CostCalculator};
use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{FinishReason, Message, MessageRole, Response};
use crate::orchestrator::{FunctionCallOrchestrator, FunctionExecutor};
use crate::pricing::PricingTable;
use crate::providers::streaming::{StreamCollector, StreamEvent};
use crate::providers::{ChatOptions, ModelInfo, ProviderAdapter};
use crate::retry::run_with_retry;
use arc_swap::ArcSwap;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Response>> + Send + 'static>>;

/// Outcome of a model-catalog refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// False when the cache was still fresh and no fetch happened.
    pub refreshed: bool,
}

struct ModelCache {
    models: Vec<ModelInfo>,
    fetched_at: Option<Instant>,
}

/// Unified front door over one backend adapter.
///
/// Owns the retry loop, cost accounting, the swappable pricing table, and
/// the model-catalog cache. Conversations and options stay backend-agnostic;
/// the adapter does all translation.
pub struct LlmDriver {
    adapter: Arc<dyn ProviderAdapter>,
    config: DriverConfig,
    pricing: ArcSwap<PricingTable>,
    cache: Mutex<ModelCache>,
}

impl LlmDriver {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self::with_config(adapter, DriverConfig::default())
    }

    pub fn with_config(adapter: Arc<dyn ProviderAdapter>, config: DriverConfig) -> Self {
        Self {
            adapter,
            config,
            pricing: ArcSwap::from_pointee(PricingTable::default()),
            cache: Mutex::new(ModelCache {
                models: Vec::new(),
                fetched_at: None,
            }),
        }
    }

    pub fn with_pricing(self, table: PricingTable) -> Self {
        self.pricing.store(Arc::new(table));
        self
    }

    pub fn adapter(&self) -> &dyn ProviderAdapter {
        self.adapter.as_ref()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Replace the pricing table without interrupting in-flight calls.
    pub fn swap_pricing(&self, table: PricingTable) {
        self.pricing.store(Arc::new(table));
        tracing::info!(provider = self.adapter.name(), "pricing table swapped");
    }

    fn effective_options(&self, mut options: ChatOptions) -> ChatOptions {
        if options.model.is_none() {
            options.model.clone_from(&self.config.default_model);
        }
        options
    }

    fn validate(&self, messages: &[Message]) -> Result<()> {
        let has_user_text = messages.iter().any(|message| {
            message.role == MessageRole::User
                && (!message.text_content().trim().is_empty() || message.has_images())
        });
        if messages.is_empty() || !has_user_text {
            return Err(ProviderError::new(
                ErrorKind::ValidationError,
                self.adapter.name(),
                "conversation must contain at least one non-empty user message",
            ));
        }
        Ok(())
    }

    /// One buffered chat exchange, retried per the error's category.
    pub async fn send_message(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Response> {
        self.validate(messages)?;
        let options = self.effective_options(options.clone());
        let started = Instant::now();

        let mut response = run_with_retry(
            self.adapter.name(),
            Some(self.config.max_retries),
            || self.adapter.complete(messages, &options),
        )
        .await?;

        response.latency = Some(started.elapsed());
        if response.model.is_none() {
            response.model = Some(
                options
                    .model
                    .clone()
                    .unwrap_or_else(|| self.adapter.default_model().to_string()),
            );
        }
        Ok(response)
    }

    /// Streamed chat exchange. Only the stream *open* is retried; once the
    /// first byte arrives, failures surface through the stream.
    ///
    /// Each yielded chunk carries the cumulative content so far with
    /// `finish_reason: None`; the final chunk is terminal and carries the
    /// assembled function calls and usage. If the backend closed without a
    /// terminal frame, the finish reason is synthesized: `Length` when the
    /// output plausibly hit `max_tokens`, `Stop` otherwise.
    pub async fn send_streaming_message(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ResponseStream> {
        self.validate(messages)?;
        let options = self.effective_options(options.clone());
        let started = Instant::now();

        let mut events = run_with_retry(
            self.adapter.name(),
            Some(self.config.max_retries),
            || self.adapter.stream(messages, &options),
        )
        .await?;

        let provider = self.adapter.name().to_string();
        let max_tokens = options.max_tokens;

        let stream = async_stream::try_stream! {
            let mut collector = StreamCollector::new(provider.clone());

            while let Some(event_result) = events.next().await {
                let event = event_result?;
                collector.feed(&event);

                if matches!(event, StreamEvent::ContentDelta { .. }) {
                    yield Response {
                        content: collector.content().to_string(),
                        model: collector.model().map(str::to_string),
                        provider: provider.clone(),
                        finish_reason: None,
                        usage: None,
                        function_calls: Vec::new(),
                        latency: None,
                        metadata: serde_json::Map::new(),
                        streamed: true,
                    };
                }
            }

            if !collector.saw_done() {
                let produced = collector.output_tokens().unwrap_or_else(|| {
                    u64::try_from(collector.content().chars().count() / CHARS_PER_TOKEN)
                        .unwrap_or(u64::MAX)
                });
                let reason = if max_tokens.is_some_and(|limit| produced >= u64::from(limit)) {
                    FinishReason::Length
                } else {
                    FinishReason::Stop
                };
                tracing::debug!(
                    provider,
                    ?reason,
                    "stream ended without terminal frame, synthesizing finish reason"
                );
                collector.feed(&StreamEvent::Done {
                    finish_reason: Some(reason),
                    usage: None,
                });
            }

            let mut terminal = collector.finish();
            terminal.latency = Some(started.elapsed());
            yield terminal;
        };

        Ok(Box::pin(stream) as ResponseStream)
    }

    /// Exact cost of a finished exchange from its reported usage.
    pub fn calculate_cost(&self, response: &Response) -> Result<CostBreakdown> {
        let usage = response.usage.ok_or_else(|| {
            ProviderError::new(
                ErrorKind::ValidationError,
                self.adapter.name(),
                "response carries no token usage to price",
            )
        })?;
        let model = response
            .model
            .clone()
            .unwrap_or_else(|| self.adapter.default_model().to_string());
        let table = self.pricing.load();
        CostCalculator::new(self.adapter.name()).calculate(&table, usage, &model)
    }

    /// Pre-flight, order-of-magnitude estimate from conversation length.
    pub fn estimate_cost(
        &self,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<CostBreakdown> {
        let model = model
            .map(str::to_string)
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| self.adapter.default_model().to_string());
        let table = self.pricing.load();
        CostCalculator::new(self.adapter.name()).estimate(&table, messages, &model)
    }

    /// Refresh the model catalog from the backend. Within the TTL the cached
    /// list is kept unless `force` is set; on fetch failure the previous
    /// cache stays intact and the error is surfaced.
    pub async fn sync_models(&self, force: bool) -> Result<SyncResult> {
        let mut cache = self.cache.lock().await;

        if !force
            && let Some(fetched_at) = cache.fetched_at
            && fetched_at.elapsed() < self.config.model_cache_ttl()
        {
            return Ok(SyncResult::default());
        }

        let fresh = self.adapter.list_models().await?;

        let added = fresh
            .iter()
            .filter(|model| !cache.models.iter().any(|old| old.id == model.id))
            .count();
        let removed = cache
            .models
            .iter()
            .filter(|old| !fresh.iter().any(|model| model.id == old.id))
            .count();
        let updated = fresh
            .iter()
            .filter(|model| {
                cache
                    .models
                    .iter()
                    .any(|old| old.id == model.id && old != *model)
            })
            .count();

        tracing::info!(
            provider = self.adapter.name(),
            added,
            updated,
            removed,
            total = fresh.len(),
            "model catalog synced"
        );

        cache.models = fresh;
        cache.fetched_at = Some(Instant::now());
        Ok(SyncResult {
            added,
            updated,
            removed,
            refreshed: true,
        })
    }

    /// Snapshot of the cached model catalog (empty before the first sync).
    pub async fn cached_models(&self) -> Vec<ModelInfo> {
        self.cache.lock().await.models.clone()
    }

    /// Run a full tool loop: send, execute requested calls, resubmit, until
    /// the model answers in plain text or the round limit is hit.
    pub async fn run_function_loop(
        &self,
        executor: &dyn FunctionExecutor,
        messages: Vec<Message>,
        options: &ChatOptions,
    ) -> Result<Response> {
        FunctionCallOrchestrator::new(self)
            .run(executor, messages, options)
            .await
    }
}
