//! The single entry point composing every other component (§4.9).
//!
//! Grounded on `original_source/src/core/engine.py::CancellableAiAnalysisEngine
//! .analyze_with_cancellation` for the overall shape (cache check, audit-record
//! creation, chunked streaming loop, finalize-on-every-outcome) and on
//! `querymt::chat::ChatProvider::chat_stream` for treating the provider's output as a
//! `Stream` rather than a callback API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::cache::Cache;
use crate::cancel::{reasons, CancellationManager};
use crate::chunk;
use crate::cost;
use crate::events::{DispatchEvent, ErrorKind};
use crate::model::{AnalysisRequest, AuditRecord, LogKind, Mode, TaskStatus};
use crate::provider::{ProviderRegistry, StreamEvent, StreamParams};
use crate::ratelimit::RateLimiter;
use crate::status::{MessageLevel, StatusManager};

/// Structural separator emitted between chunk outputs (§4.9 step 6d).
pub const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

/// Upper bound on cumulative rate-limit waiting within a single dispatch before it fails
/// `RateLimited` (§4.9 step 6b).
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(120);

/// Everything the engine needs, wired once at startup and shared across dispatches.
pub struct DispatchEngine {
    providers: Arc<ProviderRegistry>,
    cache: Arc<Cache>,
    rate_limiter: Arc<RateLimiter>,
    cost_calculator: Arc<cost::CostCalculator>,
    audit: Arc<dyn AuditStore>,
    cancellation: Arc<CancellationManager>,
    default_provider: Option<String>,
    request_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        cache: Arc<Cache>,
        rate_limiter: Arc<RateLimiter>,
        cost_calculator: Arc<cost::CostCalculator>,
        audit: Arc<dyn AuditStore>,
        cancellation: Arc<CancellationManager>,
        default_provider: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            cache,
            rate_limiter,
            cost_calculator,
            audit,
            cancellation,
            default_provider,
            request_timeout,
        }
    }

    /// `analyze(request) -> lazy sequence of DispatchEvent` (§4.9, §6).
    ///
    /// The returned stream is driven lazily: nothing upstream happens until it is
    /// polled, matching §9's "stream as first-class value" design note.
    pub fn analyze(
        self: &Arc<Self>,
        request: AnalysisRequest,
        status: Arc<StatusManager>,
    ) -> impl Stream<Item = DispatchEvent> + Send + 'static {
        let engine = Arc::clone(self);
        async_stream::stream! {
            let analysis_id = Uuid::new_v4();
            yield DispatchEvent::Start { analysis_id };

            // Step 1: validate log_kind is already enforced by AnalysisRequest's type
            // (LogKind is a closed enum); InvalidMode is likewise unreachable through
            // Mode, both checked at the adapter boundary (CLI arg parsing) instead.

            // Step 2: resolve provider.
            let provider = match engine.providers.resolve(request.provider_hint.as_deref(), engine.default_provider.as_deref()) {
                Ok(p) => p,
                Err(err) => {
                    status.record_error(err.to_string()).await;
                    yield DispatchEvent::Error { kind: ErrorKind::from(&err), text: err.to_string() };
                    return;
                }
            };
            let Some(model) = provider.model_for_mode(request.mode) else {
                let err_text = format!("provider {} has no model mapped for mode {:?}", provider.name(), request.mode);
                status.record_error(&err_text).await;
                yield DispatchEvent::Error { kind: ErrorKind::NoProvider, text: err_text };
                return;
            };

            // Step 3: cache lookup.
            let key = crate::cache::cache_key(&request.content, request.mode, &model);
            if request.use_cache {
                match engine.cache.get(&key).await {
                    Ok(Some(cached)) => {
                        status.set_status("completed_from_cache").await;
                        yield DispatchEvent::Content { text: cached };
                        yield DispatchEvent::Complete { tokens_in: 0, tokens_out: 0, cost: 0.0 };
                        return;
                    }
                    Ok(None) => {}
                    Err(_) => {} // CacheError is never fatal (§7): fall through as a miss.
                }
            }

            // Step 4: audit record + cancellation token.
            let token = engine.cancellation.create_token(Some(analysis_id));
            // Wall-clock deadline for the whole dispatch (§5): exceeding it cancels the
            // token with reason=Timeout rather than surfacing as a plain error.
            let deadline = Instant::now() + engine.request_timeout;
            let content_hash = crate::model::ContentFingerprint::of(&request.content).to_hex();
            let record = AuditRecord {
                analysis_id,
                kind: request.log_kind,
                mode: request.mode,
                provider: provider.name().to_string(),
                model: model.clone(),
                content_hash: content_hash.clone(),
                content_size: request.content.len() as u64,
                status: TaskStatus::Pending,
                started_at: chrono::Utc::now(),
                completed_at: None,
                input_tokens: 0,
                output_tokens: 0,
                cost_usd: 0.0,
                error: None,
            };
            if let Err(err) = engine.audit.create(&record).await {
                // Initial record write failing IS fatal (§7 StorageError exception clause).
                yield DispatchEvent::Error { kind: ErrorKind::Internal, text: err.to_string() };
                return;
            }
            status.set_status("running").await;

            // Step 5: chunk.
            let content_str = String::from_utf8_lossy(&request.content).into_owned();
            let catalog = provider.models();
            let Some(spec) = catalog.get(&model) else {
                let err = crate::error::DispatchError::NoProvider { hint: Some(format!("model {model} missing from catalog")) };
                engine.audit.finish(analysis_id, TaskStatus::Failed, 0, 0, 0.0, Some(&err.to_string())).await.ok();
                yield DispatchEvent::Error { kind: ErrorKind::NoProvider, text: err.to_string() };
                return;
            };
            let ratio = cost::chars_per_token(provider.name());
            let budget = chunk::max_chars(spec.context_window, request.mode, ratio);
            let chunks = chunk::chunk_content(&content_str, request.log_kind, request.mode, budget);
            let total_chunks = chunks.len();

            let summary = chunk::summarize(&content_str, request.log_kind);
            status
                .record_message(
                    MessageLevel::Info,
                    format!("chunked into {total_chunks} pieces"),
                    serde_json::to_value(&summary).ok(),
                )
                .await;

            let mut buffer = String::new();
            let mut usage_in = 0u64;
            let mut usage_out = 0u64;
            let mut total_cost = 0.0;
            let mut waited = Duration::ZERO;
            let mut attempted_retry = false;

            'chunks: for (i, chunk) in chunks.iter().enumerate() {
                if Instant::now() >= deadline {
                    token.cancel(reasons::TIMEOUT);
                }
                if let Err(err) = token.check() {
                    status.record_cancellation(token.reason().unwrap_or_default()).await;
                    engine.audit.finish(analysis_id, TaskStatus::Cancelled, usage_in, usage_out, total_cost, None).await.ok();
                    yield DispatchEvent::Cancelled { reason: err.to_string() };
                    return;
                }

                // Step 6b: rate limit permit.
                loop {
                    match engine.rate_limiter.acquire(&request.client_id, provider.name(), chunk.est_input_tokens) {
                        Ok(acquired) if acquired.allowed => break,
                        Ok(acquired) => {
                            let Some(retry_after) = acquired.retry_after else { break };
                            if waited + retry_after > MAX_RATE_LIMIT_WAIT {
                                let err = crate::error::DispatchError::RateLimited { retry_after };
                                engine.audit.finish(analysis_id, TaskStatus::Failed, usage_in, usage_out, total_cost, Some(&err.to_string())).await.ok();
                                yield DispatchEvent::Error { kind: ErrorKind::RateLimited, text: err.to_string() };
                                return;
                            }
                            waited += retry_after;
                            tokio::time::sleep(retry_after).await;
                        }
                        Err(err) => {
                            engine.audit.finish(analysis_id, TaskStatus::Failed, usage_in, usage_out, total_cost, Some(&err.to_string())).await.ok();
                            yield DispatchEvent::Error { kind: ErrorKind::Internal, text: err.to_string() };
                            return;
                        }
                    }
                }

                // Step 6c: open provider stream.
                let params = StreamParams { temperature: None, max_output_tokens: Some(spec.max_output_tokens) };
                let provider_stream = match provider.stream(&chunk.text, &model, params, token.clone()).await {
                    Ok(s) => s,
                    Err(err) if err.is_retryable() && !attempted_retry => {
                        attempted_retry = true;
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        match provider.stream(&chunk.text, &model, StreamParams::default(), token.clone()).await {
                            Ok(s) => s,
                            Err(err) => {
                                engine.audit.finish(analysis_id, TaskStatus::Failed, usage_in, usage_out, total_cost, Some(&err.to_string())).await.ok();
                                yield DispatchEvent::Error { kind: ErrorKind::from(&err), text: err.to_string() };
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        engine.audit.finish(analysis_id, TaskStatus::Failed, usage_in, usage_out, total_cost, Some(&err.to_string())).await.ok();
                        yield DispatchEvent::Error { kind: ErrorKind::from(&err), text: err.to_string() };
                        return;
                    }
                };
                futures::pin_mut!(provider_stream);

                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let event = match tokio::time::timeout(remaining, provider_stream.next()).await {
                        Ok(Some(event)) => event,
                        Ok(None) => break,
                        Err(_elapsed) => {
                            token.cancel(reasons::TIMEOUT);
                            let err = crate::error::DispatchError::Timeout;
                            status.record_cancellation(reasons::TIMEOUT).await;
                            engine.audit.finish(analysis_id, TaskStatus::Cancelled, usage_in, usage_out, total_cost, Some(&err.to_string())).await.ok();
                            yield DispatchEvent::Cancelled { reason: reasons::TIMEOUT.to_string() };
                            return;
                        }
                    };
                    if let Err(err) = token.check() {
                        status.record_cancellation(token.reason().unwrap_or_default()).await;
                        engine.audit.finish(analysis_id, TaskStatus::Cancelled, usage_in, usage_out, total_cost, None).await.ok();
                        yield DispatchEvent::Cancelled { reason: err.to_string() };
                        return;
                    }
                    match event {
                        Ok(StreamEvent::Delta { text }) => {
                            buffer.push_str(&text);
                            let ratio = cost::chars_per_token(provider.name());
                            usage_out += (text.chars().count() as f64 / ratio).round() as u64;
                            status
                                .update_progress(i + 1, total_chunks, usage_in, usage_out)
                                .await;
                            yield DispatchEvent::Content { text };
                        }
                        Ok(StreamEvent::UsageUpdate { input_tokens, output_tokens }) => {
                            usage_in += input_tokens;
                            usage_out += output_tokens;
                            let chunk_cost = cost::cost(spec, input_tokens, output_tokens);
                            total_cost += chunk_cost;
                            status.record_usage(input_tokens, output_tokens, chunk_cost).await;
                            yield DispatchEvent::Progress {
                                percent: (i + 1) as f64 / total_chunks.max(1) as f64 * 100.0,
                                chunks: (i + 1, total_chunks),
                                tokens: (usage_in, usage_out),
                            };
                        }
                        Ok(StreamEvent::Start { .. }) | Ok(StreamEvent::End) => {
                            status.update_progress(i + 1, total_chunks, usage_in, usage_out).await;
                        }
                        Err(err) => {
                            status.record_error(err.to_string()).await;
                            engine.audit.finish(analysis_id, TaskStatus::Failed, usage_in, usage_out, total_cost, Some(&err.to_string())).await.ok();
                            yield DispatchEvent::Error { kind: ErrorKind::from(&err), text: err.to_string() };
                            return;
                        }
                    }
                }

                if i + 1 < total_chunks {
                    buffer.push_str(CHUNK_SEPARATOR);
                    yield DispatchEvent::Content { text: CHUNK_SEPARATOR.to_string() };
                }

                continue 'chunks;
            }

            // Step 7: normal completion.
            if request.use_cache {
                engine.cache.put(&key, buffer).await.ok();
            }
            engine
                .audit
                .finish(analysis_id, TaskStatus::Completed, usage_in, usage_out, total_cost, None)
                .await
                .ok();
            status.set_status("completed").await;
            yield DispatchEvent::Complete { tokens_in: usage_in, tokens_out: usage_out, cost: total_cost };
        }
    }
}

/// Resolves which mode-keyed model map to use for cache/estimate lookups shared between
/// the engine and CLI (SPEC_FULL §12).
pub fn resolve_model_for_mode(mode_map: &HashMap<Mode, String>, mode: Mode) -> Option<String> {
    mode_map.get(&mode).cloned()
}

pub fn validate_kind(kind: &str) -> Result<LogKind, crate::error::DispatchError> {
    kind.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::model::{ModelCatalog, ModelSpec};
    use crate::provider::{EventStream, ProviderAdapter};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    struct FixedAdapter {
        calls: Arc<AtomicUsize>,
        output: String,
    }

    #[async_trait]
    impl ProviderAdapter for FixedAdapter {
        fn name(&self) -> &str {
            "stub"
        }

        fn models(&self) -> ModelCatalog {
            let mut catalog = ModelCatalog::new();
            catalog.insert(
                "stub-model".to_string(),
                ModelSpec {
                    input_cost_per_1k: 1.0,
                    output_cost_per_1k: 2.0,
                    context_window: 200_000,
                    max_output_tokens: 4096,
                    speed_rating: 3,
                    quality_rating: 3,
                },
            );
            catalog
        }

        fn model_for_mode(&self, _mode: Mode) -> Option<String> {
            Some("stub-model".to_string())
        }

        async fn stream(
            &self,
            _prompt: &str,
            _model: &str,
            _params: StreamParams,
            _token: CancellationToken,
        ) -> Result<EventStream, crate::error::DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self.output.clone();
            Ok(Box::pin(stream::iter(vec![
                Ok(StreamEvent::Start { input_tokens: Some(1) }),
                Ok(StreamEvent::Delta { text }),
                Ok(StreamEvent::UsageUpdate { input_tokens: 10, output_tokens: 5 }),
                Ok(StreamEvent::End),
            ])))
        }
    }

    async fn build_engine(output: &str) -> (Arc<DispatchEngine>, Arc<AtomicUsize>, tempfile::TempDir) {
        build_engine_with_timeout(output, StdDuration::from_secs(30)).await
    }

    async fn build_engine_with_timeout(
        output: &str,
        request_timeout: StdDuration,
    ) -> (Arc<DispatchEngine>, Arc<AtomicUsize>, tempfile::TempDir) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FixedAdapter { calls: calls.clone(), output: output.to_string() }));
        let dir = tempdir().unwrap();
        let cache = Arc::new(Cache::new(10, StdDuration::from_secs(3600), Some(dir.path().to_path_buf())));
        let rate_limiter = Arc::new(RateLimiter::new());
        rate_limiter.register_tier(
            "stub",
            crate::ratelimit::Tier::Tier1,
            crate::ratelimit::TierLimits {
                requests_per_minute: 1000,
                tokens_per_minute: 1_000_000,
                requests_per_day: None,
                tokens_per_day: None,
                concurrent: 10,
            },
        );
        rate_limiter.set_tier("stub", crate::ratelimit::Tier::Tier1);
        let engine = Arc::new(DispatchEngine::new(
            Arc::new(registry),
            cache,
            rate_limiter,
            Arc::new(cost::CostCalculator::new()),
            Arc::new(crate::audit::NullAuditStore),
            Arc::new(CancellationManager::new()),
            Some("stub".to_string()),
            request_timeout,
        ));
        (engine, calls, dir)
    }

    struct StallingAdapter {
        delay: StdDuration,
    }

    #[async_trait]
    impl ProviderAdapter for StallingAdapter {
        fn name(&self) -> &str {
            "stub"
        }

        fn models(&self) -> ModelCatalog {
            let mut catalog = ModelCatalog::new();
            catalog.insert(
                "stub-model".to_string(),
                ModelSpec {
                    input_cost_per_1k: 1.0,
                    output_cost_per_1k: 2.0,
                    context_window: 200_000,
                    max_output_tokens: 4096,
                    speed_rating: 3,
                    quality_rating: 3,
                },
            );
            catalog
        }

        fn model_for_mode(&self, _mode: Mode) -> Option<String> {
            Some("stub-model".to_string())
        }

        async fn stream(
            &self,
            _prompt: &str,
            _model: &str,
            _params: StreamParams,
            _token: CancellationToken,
        ) -> Result<EventStream, crate::error::DispatchError> {
            let delay = self.delay;
            Ok(Box::pin(async_stream::stream! {
                yield Ok(StreamEvent::Start { input_tokens: Some(1) });
                tokio::time::sleep(delay).await;
                yield Ok(StreamEvent::Delta { text: "late".to_string() });
                yield Ok(StreamEvent::End);
            }))
        }
    }

    #[tokio::test]
    async fn stalled_stream_past_deadline_yields_cancelled_with_timeout_reason() {
        let dir = tempdir().unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StallingAdapter { delay: StdDuration::from_millis(200) }));
        let cache = Arc::new(Cache::new(10, StdDuration::from_secs(3600), Some(dir.path().to_path_buf())));
        let rate_limiter = Arc::new(RateLimiter::new());
        rate_limiter.register_tier(
            "stub",
            crate::ratelimit::Tier::Tier1,
            crate::ratelimit::TierLimits {
                requests_per_minute: 1000,
                tokens_per_minute: 1_000_000,
                requests_per_day: None,
                tokens_per_day: None,
                concurrent: 10,
            },
        );
        rate_limiter.set_tier("stub", crate::ratelimit::Tier::Tier1);
        let engine = Arc::new(DispatchEngine::new(
            Arc::new(registry),
            cache,
            rate_limiter,
            Arc::new(cost::CostCalculator::new()),
            Arc::new(crate::audit::NullAuditStore),
            Arc::new(CancellationManager::new()),
            Some("stub".to_string()),
            StdDuration::from_millis(20),
        ));
        let status = Arc::new(StatusManager::default());
        let request = AnalysisRequest::new(b"bar".to_vec(), LogKind::Anr, Mode::Quick);
        let events: Vec<_> = engine.analyze(request, status).collect().await;
        assert!(matches!(
            events.last(),
            Some(DispatchEvent::Cancelled { reason }) if reason == reasons::TIMEOUT
        ));
    }

    #[tokio::test]
    async fn cache_hit_skips_provider_entirely() {
        let (engine, calls, _dir) = build_engine("RESULT").await;
        let status = Arc::new(StatusManager::default());
        let request = AnalysisRequest::new(b"foo".to_vec(), LogKind::Anr, Mode::Quick);

        let events: Vec<_> = engine.analyze(request.clone(), status.clone()).collect().await;
        assert!(matches!(events.first(), Some(DispatchEvent::Start { .. })));
        assert!(matches!(events.last(), Some(DispatchEvent::Complete { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events2: Vec<_> = engine.analyze(request, status).collect().await;
        assert!(matches!(events2.last(), Some(DispatchEvent::Complete { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call must be served entirely from cache");
    }

    #[tokio::test]
    async fn every_dispatch_ends_with_exactly_one_terminal_event() {
        let (engine, _calls, _dir) = build_engine("hello").await;
        let status = Arc::new(StatusManager::default());
        let request = AnalysisRequest::new(b"bar".to_vec(), LogKind::Anr, Mode::Quick);
        let events: Vec<_> = engine.analyze(request, status).collect().await;
        let terminal_count = events
            .iter()
            .filter(|e| matches!(e, DispatchEvent::Complete { .. } | DispatchEvent::Cancelled { .. } | DispatchEvent::Error { .. }))
            .count();
        assert_eq!(terminal_count, 1);
        assert!(matches!(events.last().unwrap(), DispatchEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn no_provider_hint_fails_cleanly() {
        let (engine, _calls, _dir) = build_engine("hello").await;
        let status = Arc::new(StatusManager::default());
        let mut request = AnalysisRequest::new(b"bar".to_vec(), LogKind::Anr, Mode::Quick);
        request.provider_hint = Some("unknown-provider".to_string());
        let events: Vec<_> = engine.analyze(request, status).collect().await;
        assert!(matches!(events.last().unwrap(), DispatchEvent::Error { kind: ErrorKind::NoProvider, .. }));
    }
}
