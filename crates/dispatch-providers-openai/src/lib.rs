//! OpenAI streaming provider adapter (§4.8).
//!
//! Grounded on `crates/providers/openai/src/api.rs`'s `parse_openai_sse_chunk`: a
//! line-oriented `data: ` scan terminated by the literal `[DONE]` sentinel, same as
//! Anthropic's adapter but over the `chat/completions` delta shape
//! (`choices[0].delta.content`) instead of Anthropic's `content_block_delta`.

use async_trait::async_trait;
use dispatch_core::cancel::CancellationToken;
use dispatch_core::error::DispatchError;
use dispatch_core::model::{Mode, ModelCatalog, ModelSpec};
use dispatch_core::provider::{EventStream, ProviderAdapter, StreamEvent, StreamParams};
use futures::StreamExt;
use serde::Deserialize;

pub const PROVIDER_NAME: &str = "openai";

pub struct OpenAIAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    mode_map: std::collections::HashMap<Mode, String>,
}

impl OpenAIAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        let mut mode_map = std::collections::HashMap::new();
        mode_map.insert(Mode::Quick, "gpt-4o-mini".to_string());
        mode_map.insert(Mode::Intelligent, "gpt-4o".to_string());
        mode_map.insert(Mode::LargeFile, "gpt-4o".to_string());
        mode_map.insert(Mode::MaxToken, "gpt-4-turbo".to_string());
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            mode_map,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize, Debug)]
struct ChatStreamChoice {
    delta: ChatDelta,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Drains complete `data: ...\n` SSE lines out of `buffer`, leaving any partial trailing
/// line (split across a network read) for the next call. Returns `None` once `[DONE]` has
/// been seen, signalling the caller to stop reading.
fn drain_lines(buffer: &mut String) -> (Vec<String>, bool) {
    let mut events = Vec::new();
    let mut done = false;
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim().to_string();
        *buffer = buffer[pos + 1..].to_string();
        if let Some(data) = line.strip_prefix("data: ") {
            if data == "[DONE]" {
                done = true;
                break;
            }
            if !data.is_empty() {
                events.push(data.to_string());
            }
        }
    }
    (events, done)
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn models(&self) -> ModelCatalog {
        let mut catalog = ModelCatalog::new();
        catalog.insert(
            "gpt-4o-mini".to_string(),
            ModelSpec {
                input_cost_per_1k: 0.15,
                output_cost_per_1k: 0.6,
                context_window: 128_000,
                max_output_tokens: 16_384,
                speed_rating: 5,
                quality_rating: 3,
            },
        );
        catalog.insert(
            "gpt-4o".to_string(),
            ModelSpec {
                input_cost_per_1k: 2.5,
                output_cost_per_1k: 10.0,
                context_window: 128_000,
                max_output_tokens: 16_384,
                speed_rating: 3,
                quality_rating: 5,
            },
        );
        catalog.insert(
            "gpt-4-turbo".to_string(),
            ModelSpec {
                input_cost_per_1k: 10.0,
                output_cost_per_1k: 30.0,
                context_window: 128_000,
                max_output_tokens: 4_096,
                speed_rating: 2,
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
                hint: Some("missing OpenAI API key".to_string()),
            });
        }

        let body = serde_json::json!({
            "model": model,
            "temperature": params.temperature,
            "max_tokens": params.max_output_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_err(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            return Err(if retryable {
                DispatchError::ProviderTransient(format!("openai http {status}: {text}"))
            } else {
                DispatchError::ProviderFatal(format!("openai http {status}: {text}"))
            });
        }

        let mut byte_stream = response.bytes_stream();
        let stream: EventStream = Box::pin(async_stream::try_stream! {
            yield StreamEvent::Start { input_tokens: None };
            let mut buffer = String::new();
            'outer: while let Some(chunk) = byte_stream.next().await {
                token.check()?;
                let bytes = chunk.map_err(|e| classify_reqwest_err(&e))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                let (events, done) = drain_lines(&mut buffer);
                for raw in events {
                    let parsed: ChatStreamChunk = serde_json::from_str(&raw)
                        .map_err(|e| DispatchError::ProviderFatal(format!("malformed SSE payload: {e}")))?;
                    if let Some(usage) = parsed.usage {
                        yield StreamEvent::UsageUpdate {
                            input_tokens: usage.prompt_tokens.unwrap_or(0),
                            output_tokens: usage.completion_tokens.unwrap_or(0),
                        };
                    }
                    for choice in parsed.choices {
                        if let Some(text) = choice.delta.content {
                            yield StreamEvent::Delta { text };
                        }
                    }
                }
                if done {
                    break 'outer;
                }
            }
            yield StreamEvent::End;
        });

        Ok(stream)
    }
}

fn classify_reqwest_err(err: &reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::ProviderTransient(format!("openai request timed out: {err}"))
    } else if err.is_connect() {
        DispatchError::ProviderTransient(format!("openai connection failed: {err}"))
    } else {
        DispatchError::ProviderFatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_stops_at_done_sentinel() {
        let mut buffer = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\
             data: [DONE]\n",
        );
        let (events, done) = drain_lines(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(done);
    }

    #[test]
    fn drain_lines_keeps_partial_trailing_line() {
        let mut buffer = String::from("data: {\"choices\":[]}\ndata: {\"choi");
        let (events, done) = drain_lines(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(!done);
        assert_eq!(buffer, "data: {\"choi");
    }

    #[test]
    fn model_for_mode_resolves_every_mode() {
        let adapter = OpenAIAdapter::new("key");
        for mode in [Mode::Quick, Mode::Intelligent, Mode::LargeFile, Mode::MaxToken] {
            assert!(adapter.model_for_mode(mode).is_some());
        }
    }
}
