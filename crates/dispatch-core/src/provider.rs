//! Uniform streaming façade over heterogeneous provider backends (§4.8).
//!
//! Grounded on `querymt::chat::{ChatProvider, StreamChunk}`: a closed `StreamEvent` enum
//! plays the role of `StreamChunk`, and `ProviderAdapter` plays the role of `ChatProvider`
//! — `async_trait`, object-safe, returning a boxed `Stream` of `Result<_, DispatchError>`.
//! Provider crates (`dispatch-providers-anthropic`, `dispatch-providers-openai`) implement
//! this trait the way `crates/providers/anthropic` implements `ChatProvider`.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::cancel::CancellationToken;
use crate::error::DispatchError;
use crate::model::{Mode, ModelCatalog};

/// One event on a provider's output stream (§4.8). Adapters translate their native wire
/// format (SSE, chunked JSON, …) into this closed set.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start { input_tokens: Option<u64> },
    Delta { text: String },
    UsageUpdate { input_tokens: u64, output_tokens: u64 },
    End,
}

/// Parameters threaded into a single provider call.
#[derive(Debug, Clone, Default)]
pub struct StreamParams {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u64>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, DispatchError>> + Send>>;

/// What a provider adapter must implement to be dispatched against (§4.8).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier used in config, audit records, and cache keys.
    fn name(&self) -> &str;

    fn models(&self) -> ModelCatalog;

    fn model_for_mode(&self, mode: Mode) -> Option<String>;

    async fn stream(
        &self,
        prompt: &str,
        model: &str,
        params: StreamParams,
        token: CancellationToken,
    ) -> Result<EventStream, DispatchError>;
}

/// Table of registered adapters keyed by provider name (§9 "Implementations are
/// registered at startup in a table keyed by tag").
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: std::collections::HashMap<String, std::sync::Arc<dyn ProviderAdapter>>,
    priority: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: std::sync::Arc<dyn ProviderAdapter>) {
        let name = adapter.name().to_string();
        self.priority.push(name.clone());
        self.adapters.insert(name, adapter);
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Resolves `hint` if present and registered, otherwise `default_provider`, else
    /// fails `NoProvider` (§4.9 step 2).
    pub fn resolve(
        &self,
        hint: Option<&str>,
        default_provider: Option<&str>,
    ) -> Result<std::sync::Arc<dyn ProviderAdapter>, DispatchError> {
        if let Some(hint) = hint {
            if let Some(adapter) = self.get(hint) {
                return Ok(adapter);
            }
            return Err(DispatchError::NoProvider {
                hint: Some(format!("provider hint '{hint}' is not registered")),
            });
        }
        if let Some(name) = default_provider {
            if let Some(adapter) = self.get(name) {
                return Ok(adapter);
            }
        }
        self.priority
            .first()
            .and_then(|name| self.get(name))
            .ok_or(DispatchError::NoProvider { hint: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use futures::stream;
    use std::sync::Arc;

    struct StubAdapter {
        name: String,
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn models(&self) -> ModelCatalog {
            let mut catalog = ModelCatalog::new();
            catalog.insert(
                "stub-model".to_string(),
                ModelSpec {
                    input_cost_per_1k: 1.0,
                    output_cost_per_1k: 2.0,
                    context_window: 100_000,
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
        ) -> Result<EventStream, DispatchError> {
            Ok(Box::pin(stream::iter(vec![
                Ok(StreamEvent::Start { input_tokens: Some(10) }),
                Ok(StreamEvent::Delta { text: "hi".to_string() }),
                Ok(StreamEvent::End),
            ])))
        }
    }

    #[test]
    fn resolve_prefers_hint_over_default() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubAdapter { name: "a".to_string() }));
        registry.register(Arc::new(StubAdapter { name: "b".to_string() }));
        let resolved = registry.resolve(Some("b"), Some("a")).unwrap();
        assert_eq!(resolved.name(), "b");
    }

    #[test]
    fn resolve_fails_with_no_provider_when_hint_unregistered() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve(Some("missing"), None).is_err());
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubAdapter { name: "a".to_string() }));
        let resolved = registry.resolve(None, Some("a")).unwrap();
        assert_eq!(resolved.name(), "a");
    }
}
