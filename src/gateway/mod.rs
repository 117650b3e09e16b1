//! Provider gateway for OpenRouter chat completions.
//!
//! `ChatGateway` is the only provider contract the run orchestration sees:
//! prompt + model + call kind in, content + usage out. Retries and usage
//! logging happen here and are invisible to callers.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use pricing::{chat_cost, format_usd};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    provider: Arc<dyn ChatProvider>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self::with_config(
            openrouter,
            usage_sink,
            GatewayConfig::default(),
        ))
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self::with_provider(Arc::new(openrouter), usage_sink, config)
    }

    pub fn with_provider(
        provider: Arc<dyn ChatProvider>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(&req, None, Some(&err)).await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        model = req.model.model_id(),
                        kind = req.kind().as_str(),
                        attempt,
                        error = %err,
                        "retrying provider call in {delay:?}"
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        err: Option<&ProviderError>,
    ) {
        let mut record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .kind(req.kind())
        .run(req.attribution.run_id)
        .document(req.attribution.document_id.clone());

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
                .cost(resp.cost_nanodollars)
                .upstream_cost(resp.upstream_cost_nanodollars)
                .latency(resp.latency.as_millis() as i32);
        }

        if let Some(err) = err {
            record = record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string));
        }

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::usage::CallStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyProvider {
        calls: AtomicUsize,
        failures: usize,
        retryable: bool,
    }

    #[async_trait::async_trait]
    impl ChatProvider for FlakyProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProviderError::provider("test", "flaky", self.retryable));
            }
            Ok(ChatResponse {
                content: "ok".into(),
                input_tokens: 3,
                output_tokens: 4,
                cost_nanodollars: 7,
                upstream_cost_nanodollars: None,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<ProviderCallRecord>>,
    }

    #[async_trait::async_trait]
    impl UsageSink for RecordingSink {
        async fn record(&self, record: ProviderCallRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter("openai/gpt-5-mini"),
            vec![Message::user("hi")],
            Attribution::for_kind(CallKind::Evaluate).with_document("doc-a"),
        )
    }

    fn config(max_retries: u32) -> GatewayConfig {
        GatewayConfig {
            max_retries,
            retry_base_delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(80));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(320));
    }

    #[tokio::test]
    async fn retries_retryable_errors_and_records_every_attempt() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            failures: 2,
            retryable: true,
        });
        let sink = Arc::new(RecordingSink::default());
        let gateway = ProviderGateway::with_provider(provider.clone(), sink.clone(), config(2));

        let resp = gateway.chat(request()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, CallStatus::Error);
        assert_eq!(records[2].status, CallStatus::Success);
        assert_eq!(records[2].kind, CallKind::Evaluate);
        assert_eq!(records[2].document_id.as_deref(), Some("doc-a"));
        assert_eq!(records[2].cost_nanodollars, 7);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            failures: 5,
            retryable: false,
        });
        let gateway =
            ProviderGateway::with_provider(provider.clone(), Arc::new(NoopUsageSink), config(3));

        assert!(gateway.chat(request()).await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
