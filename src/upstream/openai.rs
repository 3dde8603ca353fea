//! OpenAI-style adapter (MLX-compatible backends).
//!
//! The upstream speaks the standard `/chat/completions` protocol, with one
//! quirk this adapter absorbs: strict role alternation. MLX servers reject
//! consecutive same-role messages and have no `system` role, so before every
//! request the message list is normalised — `system` becomes `user`, content
//! is coerced to a string (canonical JSON for structured payloads), and
//! consecutive same-role messages are merged with a newline separator.
//!
//! Streaming proxies the upstream SSE bytes through unchanged, except that a
//! terminal `[DONE]` is appended when the upstream disconnects without one —
//! clients always observe exactly one terminator.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use super::{ChatCompletionRequest, ChatMessage, SseStream};
use crate::{
    canonical::canonical_json,
    error::GatewayError,
    ids::{new_id, now_unix, sse_done, sse_event},
};

/// How much of an upstream error body to carry into the 502 detail.
const ERROR_BODY_LIMIT: usize = 5_000;

/// Adapter for any OpenAI-compatible backend.
pub struct OpenAiAdapter {
    /// Buffered requests — generous timeout for slow local inference.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .build()
            .expect("failed to build streaming reqwest client");
        Self { client, stream_client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn upstream_error(detail: Value) -> GatewayError {
        GatewayError::UpstreamError { upstream: "mlx".into(), detail }
    }

    /// Forward a chat completion request to `POST {base}/chat/completions`.
    pub async fn call(&self, request: &ChatCompletionRequest) -> Result<Value, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = build_payload(request, false);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Self::upstream_error(json!({ "error": e.to_string() })))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Self::upstream_error(json!({ "error": e.to_string() })))?;

        if !status.is_success() {
            return Err(Self::upstream_error(json!({
                "status": status.as_u16(),
                "body": truncate(&text, ERROR_BODY_LIMIT),
            })));
        }

        serde_json::from_str(&text)
            .map_err(|e| Self::upstream_error(json!({ "error": format!("invalid JSON: {e}") })))
    }

    /// Start a streaming request and return the proxied SSE stream.
    pub async fn stream(&self, request: &ChatCompletionRequest) -> Result<SseStream, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = build_payload(request, true);

        let response = self
            .stream_client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| Self::upstream_error(json!({ "error": e.to_string() })))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::upstream_error(json!({
                "status": status.as_u16(),
                "body": truncate(&body, ERROR_BODY_LIMIT),
            })));
        }

        let model = request.model.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<anyhow::Result<Bytes>>(32);
        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            let mut done_seen = false;
            let mut tail: Vec<u8> = Vec::new();

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        // Detect [DONE] across chunk boundaries.
                        let mut hay = std::mem::take(&mut tail);
                        hay.extend_from_slice(&chunk);
                        if contains(&hay, b"data: [DONE]") {
                            done_seen = true;
                        }
                        let keep = hay.len().min(64);
                        tail = hay[hay.len() - keep..].to_vec();

                        if tx.send(Ok(chunk)).await.is_err() {
                            return; // client went away
                        }
                    }
                    Err(e) => {
                        // One error event, a stop chunk, then the terminator.
                        let _ = tx
                            .send(Ok(sse_event(&json!({
                                "error": {
                                    "message": "Upstream error",
                                    "type": "upstream_error",
                                    "param": null,
                                    "code": null,
                                    "detail": { "upstream": "mlx", "error": e.to_string() },
                                }
                            }))))
                            .await;
                        let _ = tx.send(Ok(stop_chunk(&model))).await;
                        let _ = tx.send(Ok(sse_done())).await;
                        return;
                    }
                }
            }

            if !done_seen {
                let _ = tx.send(Ok(sse_done())).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn build_payload(request: &ChatCompletionRequest, stream: bool) -> Value {
    let mut payload = serde_json::to_value(request).unwrap_or_else(|_| json!({}));
    payload["messages"] = Value::Array(
        merge_for_strict_alternation(&request.messages)
            .into_iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect(),
    );
    payload["stream"] = Value::Bool(stream);
    payload
}

/// Normalise a message list for strict user/assistant alternation: `system`
/// folds into `user`, content becomes a string, and consecutive same-role
/// messages merge with a newline.
pub(crate) fn merge_for_strict_alternation(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for m in messages {
        let role = match m.role.trim() {
            "system" => "user".to_string(),
            other => other.to_string(),
        };
        let content_str = match &m.content {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => canonical_json(other),
        };

        match out.last_mut() {
            Some(prev) if prev.role == role => {
                let prev_content = prev.text().map(String::from).unwrap_or_default();
                prev.content = Some(Value::String(format!("{prev_content}\n{content_str}")));
            }
            _ => out.push(ChatMessage {
                role,
                content: Some(Value::String(content_str)),
                ..Default::default()
            }),
        }
    }
    out
}

/// A finish chunk for abnormal termination, so `[DONE]` is always preceded by
/// a `finish_reason`-bearing event.
fn stop_chunk(model: &str) -> Bytes {
    sse_event(&json!({
        "id": new_id("chatcmpl"),
        "object": "chat.completion.chunk",
        "created": now_unix(),
        "model": model,
        "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }],
    }))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
