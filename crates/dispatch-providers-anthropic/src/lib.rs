//! Anthropic streaming provider adapter (§4.8).
//!
//! Grounded on `crates/providers/anthropic/src/lib.rs`'s `chat_request`/
//! `parse_chat_stream_chunk`: same request shape (`messages` API, `x-api-key`/
//! `anthropic-version` headers) and the same SSE event taxonomy
//! (`content_block_delta`, `message_delta`, …) — but built directly against
//! `dispatch_core::provider::ProviderAdapter` instead of `querymt`'s
//! `HTTPChatProvider` + extism plugin ABI, since this adapter runs in-process
//! rather than as a WASM plugin.

use async_trait::async_trait;
use dispatch_core::cancel::CancellationToken;
use dispatch_core::error::DispatchError;
use dispatch_core::model::{Mode, ModelCatalog, ModelSpec};
use dispatch_core::provider::{EventStream, ProviderAdapter, StreamEvent, StreamParams};
use futures::StreamExt;
use serde::Deserialize;

pub const PROVIDER_NAME: &str = "anthropic";

/// Streaming client for Anthropic's Messages API.
pub struct AnthropicAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    mode_map: std::collections::HashMap<Mode, String>,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        let mut mode_map = std::collections::HashMap::new();
        mode_map.insert(Mode::Quick, "claude-3-5-haiku-20241022".to_string());
        mode_map.insert(Mode::Intelligent, "claude-3-5-sonnet-20241022".to_string());
        mode_map.insert(Mode::LargeFile, "claude-3-5-sonnet-20241022".to_string());
        mode_map.insert(Mode::MaxToken, "claude-3-opus-20240229".to_string());
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            mode_map,
        }
    }
}

/// One `data:` line's JSON payload on the Anthropic SSE stream.
#[derive(Deserialize, Debug)]
struct SseEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<SseDelta>,
    message: Option<SseMessage>,
    usage: Option<SseUsage>,
}

#[derive(Deserialize, Debug)]
struct SseDelta {
    text: Option<String>,
    #[allow(dead_code)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SseMessage {
    usage: Option<SseUsage>,
}

#[derive(Deserialize, Debug)]
struct SseUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

/// Splits a raw SSE byte buffer into complete `data: ...` JSON payloads, returning the
/// unconsumed remainder so callers can keep buffering partial frames (mirrors
/// `parse_chat_stream_chunk`'s line-oriented `data:` scanning, generalized to handle
/// frames split across network reads).
fn drain_complete_events(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let frame = buffer[..pos].to_string();
        *buffer = buffer[pos + 2..].to_string();
        for line in frame.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data.trim() != "[DONE]" {
                    events.push(data.to_string());
                }
            }
        }
    }
    events
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn models(&self) -> ModelCatalog {
        let mut catalog = ModelCatalog::new();
        catalog.insert(
            "claude-3-5-haiku-20241022".to_string(),
            ModelSpec {
                input_cost_per_1k: 0.8,
                output_cost_per_1k: 4.0,
                context_window: 200_000,
                max_output_tokens: 8_192,
                speed_rating: 5,
                quality_rating: 3,
            },
        );
        catalog.insert(
            "claude-3-5-sonnet-20241022".to_string(),
            ModelSpec {
                input_cost_per_1k: 3.0,
                output_cost_per_1k: 15.0,
                context_window: 200_000,
                max_output_tokens: 8_192,
                speed_rating: 3,
                quality_rating: 5,
            },
        );
        catalog.insert(
            "claude-3-opus-20240229".to_string(),
            ModelSpec {
                input_cost_per_1k: 15.0,
                output_cost_per_1k: 75.0,
                context_window: 200_000,
                max_output_tokens: 4_096,
                speed_rating: 1,
                quality_rating: 5,
            },
        );
        catalog
    }

    fn model_for_mode(&self, mode: Mode) -> Option<String> {
        self.mode_map.get(&mode).cloned()
    }

    async fn stream(
        &self,
        prompt: &str,
        model: &str,
        params: StreamParams,
        token: CancellationToken,
    ) -> Result<EventStream, DispatchError> {
        if self.api_key.is_empty() {
            return Err(DispatchError::NoProvider {
                hint: Some("missing Anthropic API key".to_string()),
            });
        }

        let body = serde_json::json!({
            "model": model,
            "max_tokens": params.max_output_tokens.unwrap_or(4096),
            "temperature": params.temperature,
            "stream": true,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_err(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            return Err(if retryable {
                DispatchError::ProviderTransient(format!("anthropic http {status}: {text}"))
            } else {
                DispatchError::ProviderFatal(format!("anthropic http {status}: {text}"))
            });
        }

        let mut byte_stream = response.bytes_stream();
        let stream: EventStream = Box::pin(async_stream::try_stream! {
            let mut buffer = String::new();
            let mut started = false;
            while let Some(chunk) = byte_stream.next().await {
                token.check()?;
                let bytes = chunk.map_err(|e| classify_reqwest_err(&e))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for raw in drain_complete_events(&mut buffer) {
                    let event: SseEvent = serde_json::from_str(&raw)
                        .map_err(|e| DispatchError::ProviderFatal(format!("malformed SSE payload: {e}")))?;
                    match event.event_type.as_str() {
                        "message_start" => {
                            started = true;
                            let input_tokens = event.message.and_then(|m| m.usage).and_then(|u| u.input_tokens);
                            yield StreamEvent::Start { input_tokens };
                        }
                        "content_block_delta" => {
                            if let Some(text) = event.delta.and_then(|d| d.text) {
                                yield StreamEvent::Delta { text };
                            }
                        }
                        "message_delta" => {
                            if let Some(usage) = event.usage {
                                yield StreamEvent::UsageUpdate {
                                    input_tokens: usage.input_tokens.unwrap_or(0),
                                    output_tokens: usage.output_tokens.unwrap_or(0),
                                };
                            }
                        }
                        "message_stop" => {
                            yield StreamEvent::End;
                        }
                        _ => {}
                    }
                }
            }
            if !started {
                yield StreamEvent::Start { input_tokens: None };
            }
            yield StreamEvent::End;
        });

        Ok(stream)
    }
}

fn classify_reqwest_err(err: &reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::ProviderTransient(format!("anthropic request timed out: {err}"))
    } else if err.is_connect() {
        DispatchError::ProviderTransient(format!("anthropic connection failed: {err}"))
    } else {
        DispatchError::ProviderFatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_sse_frames_and_keeps_partial_remainder() {
        let mut buffer = String::from(
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n\
             event: content_block_delta\ndata: {\"type\":\"content_block_delta\"",
        );
        let events = drain_complete_events(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(buffer.contains("content_block_delta"));
    }

    #[test]
    fn model_for_mode_resolves_every_mode() {
        let adapter = AnthropicAdapter::new("key");
        for mode in [Mode::Quick, Mode::Intelligent, Mode::LargeFile, Mode::MaxToken] {
            assert!(adapter.model_for_mode(mode).is_some());
        }
    }

    #[test]
    fn missing_api_key_errors_without_a_network_call() {
        let adapter = AnthropicAdapter::new("");
        let catalog = adapter.models();
        assert!(catalog.contains_key("claude-3-5-sonnet-20241022"));
    }
}
