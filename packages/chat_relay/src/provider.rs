//! Completion Provider Client
//!
//! `CompletionProvider` is the seam the relay and title summarizer talk to; the
//! HTTP implementation speaks the OpenAI-compatible chat-completions wire
//! format (Groq in the original deployment), streaming replies over SSE.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::models::ChatMessage;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
}

/// Sampling parameters fixed per call.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

/// Lazy, finite, non-restartable sequence of reply fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stream a completion over the full ordered history. A fresh call must be
    /// made for retries; the returned stream cannot be restarted.
    async fn stream_completion(
        &self,
        history: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<FragmentStream, ProviderError>;

    /// Non-streaming completion, used for short side requests (titles).
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<String, ProviderError>;
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
    stop: Option<&'a str>,
}

fn wire_messages(history: &[ChatMessage]) -> Vec<WireMessage<'_>> {
    history
        .iter()
        .map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

// =============================================================================
// SSE parsing
// =============================================================================

/// Reassembles SSE lines from arbitrarily split transport chunks.
#[derive(Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

/// Extract the payload of a `data:` SSE line. Non-data lines yield None.
fn sse_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.trim_start())
}

const SSE_DONE: &str = "[DONE]";

/// Pull `choices[0].delta.content` out of one streamed chunk. An absent delta
/// (role-only or finish chunks) is `None`, not an error.
fn delta_content(payload: &str) -> Result<Option<String>, ProviderError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ProviderError::Malformed(format!("bad chunk JSON: {e}")))?;
    Ok(value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

/// Pull `choices[0].message.content` out of a non-streaming response.
fn message_content(value: &Value) -> Result<String, ProviderError> {
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Malformed("response missing message content".into()))
}

// =============================================================================
// HTTP client
// =============================================================================

pub struct GroqClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl GroqClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Sampling parameters for relay turns.
    pub fn chat_params(&self) -> CompletionParams {
        CompletionParams {
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Smaller, cooler parameters for title summaries.
    pub fn title_params(&self) -> CompletionParams {
        CompletionParams {
            temperature: self.config.title_temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.title_max_tokens,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    async fn send_request(
        &self,
        history: &[ChatMessage],
        params: &CompletionParams,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: wire_messages(history),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stream,
            stop: None,
        };

        let timeout = self.config.request_timeout;
        let response = tokio::time::timeout(
            timeout,
            self.http
                .post(self.completions_url())
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for GroqClient {
    async fn stream_completion(
        &self,
        history: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<FragmentStream, ProviderError> {
        debug!(messages = history.len(), "requesting streamed completion");
        let response = self.send_request(history, params, true).await?;
        let gap_timeout = self.config.request_timeout;

        let stream = async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::default();

            loop {
                let chunk = match tokio::time::timeout(gap_timeout, body.next()).await {
                    Err(_) => {
                        yield Err(ProviderError::Timeout(gap_timeout));
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        yield Err(ProviderError::Request(e));
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };

                for line in lines.push(&String::from_utf8_lossy(&chunk)) {
                    let Some(payload) = sse_payload(&line) else {
                        continue;
                    };
                    if payload == SSE_DONE {
                        return;
                    }
                    match delta_content(payload) {
                        Ok(Some(fragment)) => yield Ok(fragment),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<String, ProviderError> {
        let response = self.send_request(messages, params, false).await?;
        let value: Value = response.json().await?;
        message_content(&value)
    }
}
