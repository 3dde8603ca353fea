//! Ollama adapter — line-delimited JSON protocol.
//!
//! Talks to Ollama's native `/api/chat`. Non-stream responses are wrapped
//! into the OpenAI chat completion shape (fresh `chatcmpl-…` id, single
//! choice, `finish_reason` from `done_reason`, zeroed usage). Streaming reads
//! NDJSON lines and translates each into exactly one `chat.completion.chunk`
//! SSE event, honouring the framing invariants:
//!
//! - the first emitted event announces `role: assistant`;
//! - each NDJSON content (or thinking) delta becomes one event, in order;
//! - a final chunk carries `finish_reason`, then exactly one `data: [DONE]`;
//! - an upstream error payload becomes one `error` event, a stop chunk, and
//!   the terminator.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt as _, TryStreamExt as _};
use reqwest::Client;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{codec::{FramedRead, LinesCodec}, io::StreamReader};
use tracing::warn;

use super::{ChatCompletionRequest, SseStream};
use crate::{
    error::GatewayError,
    ids::{new_id, now_unix, sse_done, sse_event},
};

const ERROR_BODY_LIMIT: usize = 5_000;

/// Adapter for a locally-running Ollama instance. No auth.
pub struct OllamaAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl OllamaAdapter {
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
        GatewayError::UpstreamError { upstream: "ollama".into(), detail }
    }

    fn payload(request: &ChatCompletionRequest, stream: bool) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": stream,
        });
        if let Some(tools) = &request.tools {
            payload["tools"] = tools.clone();
        }
        if let Some(temperature) = request.temperature {
            payload["options"] = json!({ "temperature": temperature });
        }
        payload
    }

    /// Non-stream chat call, wrapped to the OpenAI response shape.
    pub async fn call(&self, request: &ChatCompletionRequest) -> Result<Value, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&Self::payload(request, false))
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

        let out: Value = serde_json::from_str(&text)
            .map_err(|e| Self::upstream_error(json!({ "error": format!("invalid JSON: {e}") })))?;

        // Ollama reports some failures as 200s with an error payload.
        if let Some(err) = out.get("error").and_then(Value::as_str).filter(|e| !e.is_empty()) {
            return Err(Self::upstream_error(json!({ "error": err })));
        }

        let finish_reason = out
            .get("done_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop")
            .to_string();
        Ok(json!({
            "id": new_id("chatcmpl"),
            "object": "chat.completion",
            "created": now_unix(),
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": out.get("message").cloned().unwrap_or(json!({})),
                "finish_reason": finish_reason,
            }],
            "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
        }))
    }

    /// Streaming chat call: NDJSON in, OpenAI SSE out.
    pub async fn stream(&self, request: &ChatCompletionRequest) -> Result<SseStream, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&Self::payload(request, true))
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

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        // Keep the backend prefix so clients can correlate streamed chunks
        // with /v1/models ids.
        let model_id = format!("ollama:{}", request.model);
        Ok(ndjson_to_sse(bytes, model_id))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Translate an NDJSON byte stream into OpenAI `chat.completion.chunk` SSE.
///
/// Runs in a spawned task feeding a bounded channel; dropping the returned
/// stream cancels translation and the upstream body read.
pub(crate) fn ndjson_to_sse<S>(byte_stream: S, model: String) -> SseStream
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<anyhow::Result<Bytes>>(32);
    tokio::spawn(async move {
        let chunk_id = new_id("chatcmpl");
        let created = now_unix();

        let chunk = |delta: Value, finish_reason: Value| {
            sse_event(&json!({
                "id": chunk_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
            }))
        };

        // First event: announce the assistant role.
        if tx.send(Ok(chunk(json!({ "role": "assistant" }), Value::Null))).await.is_err() {
            return;
        }

        let reader = StreamReader::new(byte_stream);
        let mut lines = FramedRead::new(reader, LinesCodec::new());
        let mut content_emitted = false;

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(l) if l.trim().is_empty() => continue,
                Ok(l) => l,
                Err(e) => {
                    // Transport died mid-stream: error event, stop, terminator.
                    let _ = tx
                        .send(Ok(sse_event(&json!({
                            "error": {
                                "message": "Upstream error",
                                "type": "upstream_error",
                                "param": null,
                                "code": null,
                                "detail": { "upstream": "ollama", "error": e.to_string() },
                            }
                        }))))
                        .await;
                    let _ = tx.send(Ok(chunk(json!({}), json!("stop")))).await;
                    let _ = tx.send(Ok(sse_done())).await;
                    return;
                }
            };

            let Ok(obj) = serde_json::from_str::<Value>(&line) else { continue };

            // Ollama may return a JSON error payload even with stream=true.
            if let Some(err) = obj.get("error").and_then(Value::as_str).filter(|e| !e.is_empty()) {
                warn!(model = %model, error = %err, "ollama stream error");
                let _ = tx
                    .send(Ok(sse_event(&json!({
                        "error": {
                            "message": err,
                            "type": "upstream_error",
                            "param": null,
                            "code": null,
                            "detail": { "upstream": "ollama", "model": model },
                        }
                    }))))
                    .await;
                let _ = tx.send(Ok(chunk(json!({}), json!("stop")))).await;
                let _ = tx.send(Ok(sse_done())).await;
                return;
            }

            let done = obj.get("done").and_then(Value::as_bool).unwrap_or(false);
            let message = obj.get("message");

            let thinking = message
                .and_then(|m| {
                    m.get("thinking").or_else(|| m.get("reasoning")).or_else(|| m.get("thoughts"))
                })
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty());
            if let Some(thinking) = thinking {
                if tx.send(Ok(chunk(json!({ "thinking": thinking }), Value::Null))).await.is_err() {
                    return;
                }
            }

            // Chat responses carry `message.content`; generate-style carry `response`.
            let content = message
                .and_then(|m| m.get("content"))
                .or_else(|| obj.get("response"))
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty());
            if let Some(content) = content {
                content_emitted = true;
                if tx.send(Ok(chunk(json!({ "content": content }), Value::Null))).await.is_err() {
                    return;
                }
            }

            if done {
                let finish_reason =
                    obj.get("done_reason").and_then(Value::as_str).unwrap_or("stop");
                if !content_emitted {
                    warn!(model = %model, done_reason = finish_reason, "ollama stream ended with no content");
                }
                let _ = tx.send(Ok(chunk(json!({}), json!(finish_reason)))).await;
                let _ = tx.send(Ok(sse_done())).await;
                return;
            }
        }

        // Upstream closed without a done marker; still end cleanly.
        let _ = tx.send(Ok(chunk(json!({}), json!("stop")))).await;
        let _ = tx.send(Ok(sse_done())).await;
    });

    Box::pin(ReceiverStream::new(rx))
}
