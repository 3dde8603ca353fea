//! Upstream adapters — per-backend request translation and normalisation.
//!
//! [`UpstreamAdapter`] is an enum that wraps a concrete protocol adapter
//! chosen by chat backend family. All routing code interacts with the same
//! two-operation API (`call`, `stream`); protocol differences — endpoint
//! paths, message-shape constraints, streaming wire formats — are fully
//! encapsulated in the adapter modules:
//!
//! - [`OpenAiAdapter`]: OpenAI-style servers (MLX and compatible). SSE is
//!   proxied through with a guaranteed single terminal `[DONE]`.
//! - [`OllamaAdapter`]: line-delimited JSON (`/api/chat`). Responses are
//!   wrapped to the OpenAI schema; NDJSON streams are translated to
//!   `chat.completion.chunk` SSE events.
//!
//! Both `stream` implementations hand back a typed event channel: a spawned
//! task feeds `Bytes` into a bounded mpsc sender, and dropping the receiving
//! stream (client disconnect) tears the task and its upstream request down.

mod ollama;
mod openai;

pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::GatewayError, settings::{Backend, Settings}};

/// A `Send`-able, heap-allocated SSE byte stream. Each item is one or more
/// fully framed `data: …\n\n` events, already in OpenAI wire format.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// One chat message on the wire. Optional fields serialize only when present,
/// which keeps upstream payloads canonical (no nulls).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    pub role: String,
    /// String for plain text, or structured content (arrays of parts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: Some(Value::String(content.into())), ..Default::default() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: Some(Value::String(content.into())), ..Default::default() }
    }

    /// Plain-text view of the content, when it is a string.
    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

/// An OpenAI-compatible chat completion request, as accepted at the gateway
/// edge and forwarded (translated) upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().and_then(Value::as_array).map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Messages as JSON values (for the router's size/coding heuristics).
    pub fn message_values(&self) -> Vec<Value> {
        self.messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect()
    }
}

/// Unified upstream client — enum dispatch over the two protocol adapters.
pub enum UpstreamAdapter {
    OpenAi(OpenAiAdapter),
    Ollama(OllamaAdapter),
}

impl UpstreamAdapter {
    /// Build the adapter for a chat backend family from Settings.
    pub fn for_backend(backend: Backend, settings: &Settings) -> Self {
        match backend {
            Backend::Mlx => Self::OpenAi(OpenAiAdapter::new(settings.mlx_base_url.clone())),
            Backend::Ollama => Self::Ollama(OllamaAdapter::new(settings.ollama_base_url.clone())),
        }
    }

    /// Synchronous request/response. The request's `model` must already be
    /// the resolved upstream model (the router never leaks sentinels here).
    pub async fn call(&self, request: &ChatCompletionRequest) -> Result<Value, GatewayError> {
        match self {
            Self::OpenAi(a) => a.call(request).await,
            Self::Ollama(a) => a.call(request).await,
        }
    }

    /// Chunked streaming. Returns once upstream headers are in, so transport
    /// failures surface as a proper HTTP error instead of a broken stream.
    pub async fn stream(&self, request: &ChatCompletionRequest) -> Result<SseStream, GatewayError> {
        match self {
            Self::OpenAi(a) => a.stream(request).await,
            Self::Ollama(a) => a.stream(request).await,
        }
    }
}

/// Embed a batch of texts on the configured chat backend family.
///
/// Ollama: tries the batched `/api/embed` first, then falls back to per-text
/// `/api/embeddings`. MLX: OpenAI-style `/embeddings`. Shape errors and
/// non-2xx responses surface as `upstream_error`.
pub async fn embed(
    backend: Backend,
    settings: &Settings,
    texts: &[String],
    model: &str,
) -> Result<Vec<Vec<f64>>, GatewayError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build embeddings client: {e}"))?;

    let upstream_err = |detail: Value| GatewayError::UpstreamError {
        upstream: backend.as_str().into(),
        detail,
    };

    match backend {
        Backend::Ollama => {
            let base = settings.ollama_base_url.trim_end_matches('/');

            // Batched endpoint first.
            if let Ok(resp) = client
                .post(format!("{base}/api/embed"))
                .json(&serde_json::json!({ "model": model, "input": texts }))
                .send()
                .await
            {
                if resp.status().is_success() {
                    if let Ok(body) = resp.json::<Value>().await {
                        if let Some(embs) = parse_embedding_rows(body.get("embeddings")) {
                            if embs.len() == texts.len() {
                                return Ok(embs);
                            }
                        }
                    }
                }
            }

            // Legacy per-text endpoint.
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                let resp = client
                    .post(format!("{base}/api/embeddings"))
                    .json(&serde_json::json!({ "model": model, "prompt": text }))
                    .send()
                    .await
                    .map_err(|e| upstream_err(serde_json::json!({ "error": e.to_string() })))?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(upstream_err(
                        serde_json::json!({ "status": status.as_u16() }),
                    ));
                }
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| upstream_err(serde_json::json!({ "error": e.to_string() })))?;
                let Some(embedding) = parse_embedding_row(body.get("embedding")) else {
                    return Err(upstream_err(
                        serde_json::json!({ "error": "no embedding in response" }),
                    ));
                };
                out.push(embedding);
            }
            Ok(out)
        }
        Backend::Mlx => {
            let base = settings.mlx_base_url.trim_end_matches('/');
            let input: Value = if texts.len() == 1 {
                Value::String(texts[0].clone())
            } else {
                serde_json::json!(texts)
            };
            let resp = client
                .post(format!("{base}/embeddings"))
                .json(&serde_json::json!({ "model": model, "input": input }))
                .send()
                .await
                .map_err(|e| upstream_err(serde_json::json!({ "error": e.to_string() })))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(upstream_err(serde_json::json!({ "status": status.as_u16() })));
            }
            let body: Value = resp
                .json()
                .await
                .map_err(|e| upstream_err(serde_json::json!({ "error": e.to_string() })))?;
            let rows: Vec<Vec<f64>> = body
                .get("data")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| parse_embedding_row(item.get("embedding")))
                        .collect()
                })
                .unwrap_or_default();
            if rows.len() != texts.len() {
                return Err(upstream_err(
                    serde_json::json!({ "error": "unexpected embeddings shape" }),
                ));
            }
            Ok(rows)
        }
    }
}

fn parse_embedding_row(value: Option<&Value>) -> Option<Vec<f64>> {
    value?.as_array().map(|nums| nums.iter().filter_map(Value::as_f64).collect())
}

fn parse_embedding_rows(value: Option<&Value>) -> Option<Vec<Vec<f64>>> {
    let rows = value?.as_array()?;
    if rows.is_empty() || !rows[0].is_array() {
        return None;
    }
    Some(rows.iter().filter_map(|r| parse_embedding_row(Some(r))).collect())
}

/// Extract the assistant message object from a chat completion response.
pub fn assistant_message(response: &Value) -> ChatMessage {
    let msg = response
        .pointer("/choices/0/message")
        .cloned()
        .unwrap_or(Value::Null);
    let role = msg.get("role").and_then(Value::as_str).unwrap_or("assistant").to_string();
    ChatMessage {
        role,
        content: msg.get("content").filter(|c| !c.is_null()).cloned(),
        name: None,
        tool_calls: msg.get("tool_calls").filter(|c| !c.is_null()).cloned(),
        tool_call_id: None,
    }
}

/// Extract tool calls from a chat completion response, if any.
pub fn tool_calls(response: &Value) -> Vec<Value> {
    response
        .pointer("/choices/0/message/tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter(|c| c.is_object()).cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_message_serializes_without_nulls() {
        let msg = ChatMessage::user("hi");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({ "role": "user", "content": "hi" }));
    }

    #[test]
    fn has_tools_requires_a_nonempty_array() {
        let mut req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![],
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            stream: None,
        };
        assert!(!req.has_tools());
        req.tools = Some(json!([]));
        assert!(!req.has_tools());
        req.tools = Some(json!([{ "type": "function", "function": { "name": "noop" } }]));
        assert!(req.has_tools());
    }

    #[test]
    fn assistant_message_reads_first_choice() {
        let resp = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "hello", "tool_calls": null }
            }]
        });
        let msg = assistant_message(&resp);
        assert_eq!(msg.role, "assistant");
        assert_eq!(msg.text(), Some("hello"));
        assert!(msg.tool_calls.is_none());
    }

    #[test]
    fn tool_calls_extracts_objects_only() {
        let resp = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [
                        { "id": "call_1", "function": { "name": "noop", "arguments": "{}" } },
                        "garbage",
                    ]
                }
            }]
        });
        let calls = tool_calls(&resp);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["id"], "call_1");
    }

    #[test]
    fn tool_calls_empty_when_absent() {
        assert!(tool_calls(&json!({ "choices": [{ "message": { "content": "hi" } }] })).is_empty());
        assert!(tool_calls(&json!({})).is_empty());
    }
}
