//! Chat and completions handlers — the core request plane.
//!
//! Flow for a chat request: parse → route (pure) → alias constraints →
//! readiness gate → capability check → admission acquire → translate and
//! forward → normalise → respond. The admission lease is dropped when the
//! response is done; for streams it rides inside the body so a client
//! disconnect releases capacity immediately.
//!
//! Responses always carry `X-Backend-Used`, `X-Model-Used` and
//! `X-Router-Reason` so callers (and the request log) can see the routing
//! decision that was actually applied.

use std::{collections::HashSet, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Extension, Json,
};
use serde_json::{json, Value};

use crate::{
    admission::AdmissionLease,
    aliases::AliasTable,
    context::GatewayContext,
    error::GatewayError,
    ids::{new_id, now_unix, sse_done, sse_event},
    registry::Capability,
    router::{decide_route, RouteDecision, RouteHints},
    upstream::{assistant_message, tool_calls, ChatCompletionRequest, ChatMessage, SseStream, UpstreamAdapter},
};

use super::auth::TokenPolicy;

/// Upper bound on model→tool→model iterations for non-stream tool calls.
const TOOL_LOOP_MAX_STEPS: usize = 8;

/// Extract routing hints from request headers.
pub fn route_hints(headers: &HeaderMap) -> RouteHints {
    let lower = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
    };
    RouteHints { backend_override: lower("x-backend"), request_type: lower("x-request-type") }
}

/// Attach the routing decision headers to a response builder.
fn routed_response(decision: &RouteDecision) -> axum::http::response::Builder {
    Response::builder()
        .header("x-backend-used", decision.backend.as_str())
        .header("x-model-used", decision.model.as_str())
        .header("x-router-reason", decision.reason)
}

/// The alias a request resolved through, if any: either the request model is
/// itself an alias key, or the router reason names one (`…->alias:coder`).
fn selected_alias_name(aliases: &AliasTable, request_model: &str, reason: &str) -> Option<String> {
    let key = request_model.trim().to_lowercase();
    if !key.is_empty() && aliases.get(&key).is_some() {
        return Some(key);
    }
    let idx = reason.rfind("alias:")?;
    let candidate: String = reason[idx + "alias:".len()..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let candidate = candidate.to_lowercase();
    aliases.get(&candidate).is_some().then_some(candidate)
}

/// Enforce alias caps: refuse tools against a `tools=false` alias (before
/// admission) and clamp temperature / max_tokens.
fn apply_alias_constraints(
    cc: &mut ChatCompletionRequest,
    aliases: &AliasTable,
    alias_name: Option<&str>,
) -> Result<(), GatewayError> {
    let Some(alias) = alias_name.and_then(|n| aliases.get(n)) else {
        return Ok(());
    };
    if cc.has_tools() && alias.tools == Some(false) {
        return Err(GatewayError::InvalidRequest(format!(
            "tools not allowed for model alias '{}'",
            alias_name.unwrap_or_default()
        )));
    }
    if let (Some(temperature), Some(cap)) = (cc.temperature, alias.temperature_cap) {
        cc.temperature = Some(temperature.min(cap));
    }
    if let (Some(max_tokens), Some(cap)) = (cc.max_tokens, alias.max_tokens_cap) {
        cc.max_tokens = Some(max_tokens.min(cap));
    }
    Ok(())
}

/// Body stream that keeps the admission lease alive until the client is done.
struct LeasedStream {
    inner: SseStream,
    _lease: AdmissionLease,
}

impl futures_util::Stream for LeasedStream {
    type Item = anyhow::Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn sse_response(
    decision: &RouteDecision,
    stream: SseStream,
    lease: AdmissionLease,
) -> Result<Response, GatewayError> {
    routed_response(decision)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(LeasedStream { inner: stream, _lease: lease }))
        .map_err(|e| anyhow::anyhow!("building stream response: {e}").into())
}

fn json_response(decision: &RouteDecision, payload: &Value) -> Result<Response, GatewayError> {
    routed_response(decision)
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap_or_default()))
        .map_err(|e| anyhow::anyhow!("building response: {e}").into())
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(ctx): State<Arc<GatewayContext>>,
    policy: Option<Extension<TokenPolicy>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let mut cc: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid chat request: {e}")))?;

    let hints = route_hints(&headers);
    let decision = decide_route(
        &ctx.router_cfg,
        &ctx.aliases,
        &cc.model,
        &hints,
        &cc.message_values(),
        cc.has_tools(),
    );
    tracing::debug!(
        model = %cc.model,
        backend = %decision.backend,
        upstream_model = %decision.model,
        reason = decision.reason,
        stream = cc.stream.unwrap_or(false),
        tools = cc.has_tools(),
        "routing chat request"
    );

    // Alias caps apply at entry, before any capacity is reserved.
    let alias_name = selected_alias_name(&ctx.aliases, &cc.model, decision.reason);
    apply_alias_constraints(&mut cc, &ctx.aliases, alias_name.as_deref())?;

    let stream = cc.stream.unwrap_or(false);
    if stream && cc.has_tools() {
        return Err(GatewayError::InvalidRequest(
            "stream=true not supported when tools are provided".into(),
        ));
    }

    let backend_class = ctx.registry.resolve_class(decision.backend.as_str()).to_string();
    let lease = ctx.admit(&backend_class, Capability::Chat)?;

    let adapter = ctx.adapter(decision.backend);
    let mut routed = cc.clone();
    routed.model = decision.model.clone();
    routed.stream = Some(false);

    if stream {
        let upstream = adapter.stream(&routed).await?;
        return sse_response(&decision, upstream, lease);
    }

    let response = if cc.has_tools() {
        let allowed = ctx
            .tool_bus
            .effective_allowlist(policy.as_ref().and_then(|Extension(TokenPolicy(p))| p.as_ref()));
        tool_loop(&ctx, routed, &adapter, &allowed).await?
    } else {
        adapter.call(&routed).await?
    };
    drop(lease);

    json_response(&decision, &response)
}

/// Non-stream tool loop: call the model, execute any requested tools through
/// the bus, feed results back, repeat until the model answers in prose.
async fn tool_loop(
    ctx: &GatewayContext,
    mut request: ChatCompletionRequest,
    adapter: &UpstreamAdapter,
    allowed: &HashSet<String>,
) -> Result<Value, GatewayError> {
    for _ in 0..TOOL_LOOP_MAX_STEPS {
        let response = adapter.call(&request).await?;
        let calls = tool_calls(&response);
        if calls.is_empty() {
            return Ok(response);
        }

        request.messages.push(assistant_message(&response));
        for call in calls {
            let function = call.get("function").cloned().unwrap_or(json!({}));
            let name = function.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = function.get("arguments").and_then(Value::as_str).unwrap_or("");
            let result = ctx.tool_bus.run_tool_call(name, arguments, allowed).await;
            request.messages.push(ChatMessage {
                role: "tool".into(),
                content: Some(Value::String(
                    serde_json::to_string(&result).unwrap_or_default(),
                )),
                tool_call_id: call.get("id").and_then(Value::as_str).map(String::from),
                ..Default::default()
            });
        }
    }
    Err(anyhow::anyhow!("tool loop exceeded max steps").into())
}

/// `POST /v1/completions` — legacy prompt API synthesised onto chat.
pub async fn completions(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("model must be a non-empty string".into()))?
        .to_string();

    let prompt_text = match body.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => {
            return Err(GatewayError::InvalidRequest(
                "prompt must be a string or list of strings".into(),
            ))
        }
    };

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let mut cc = ChatCompletionRequest {
        model: model.clone(),
        messages: vec![ChatMessage::user(prompt_text)],
        tools: None,
        tool_choice: None,
        temperature: body.get("temperature").and_then(Value::as_f64),
        max_tokens: body.get("max_tokens").and_then(Value::as_u64),
        stream: Some(stream),
    };

    let hints = route_hints(&headers);
    let decision =
        decide_route(&ctx.router_cfg, &ctx.aliases, &cc.model, &hints, &cc.message_values(), false);

    let alias_name = selected_alias_name(&ctx.aliases, &cc.model, decision.reason);
    apply_alias_constraints(&mut cc, &ctx.aliases, alias_name.as_deref())?;

    let backend_class = ctx.registry.resolve_class(decision.backend.as_str()).to_string();
    let lease = ctx.admit(&backend_class, Capability::Chat)?;

    let adapter = ctx.adapter(decision.backend);
    let mut routed = cc.clone();
    routed.model = decision.model.clone();
    routed.stream = Some(false);

    if stream {
        let upstream = adapter.stream(&routed).await?;
        let reframed = chat_sse_as_completions(upstream, decision.model.clone());
        return sse_response(&decision, reframed, lease);
    }

    let chat_resp = adapter.call(&routed).await?;
    drop(lease);

    let text = chat_resp
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or("");
    let payload = json!({
        "id": new_id("cmpl"),
        "object": "text_completion",
        "created": now_unix(),
        "model": decision.model,
        "choices": [{ "index": 0, "text": text, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
    });
    json_response(&decision, &payload)
}

/// Re-frame a chat-completions SSE stream as legacy `text_completion` events.
/// The framing invariants carry over: one finish chunk, then one `[DONE]`.
fn chat_sse_as_completions(upstream: SseStream, model: String) -> SseStream {
    use futures_util::StreamExt as _;

    let (tx, rx) = tokio::sync::mpsc::channel::<anyhow::Result<Bytes>>(32);
    tokio::spawn(async move {
        let stream_id = new_id("cmpl");
        let created = now_unix();
        let completion_chunk = |text: &str, finish_reason: Value| {
            sse_event(&json!({
                "id": stream_id,
                "object": "text_completion",
                "created": created,
                "model": model,
                "choices": [{ "index": 0, "text": text, "finish_reason": finish_reason }],
            }))
        };

        let mut upstream = upstream;
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(item) = upstream.next().await {
            let Ok(chunk) = item else { break };
            buffer.extend_from_slice(&chunk);

            // Process complete events only; partial frames wait for more bytes.
            while let Some(pos) = find_frame_end(&buffer) {
                let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
                let Some(data) = frame_data(&frame) else { continue };
                if data == "[DONE]" {
                    let _ = tx.send(Ok(completion_chunk("", json!("stop")))).await;
                    let _ = tx.send(Ok(sse_done())).await;
                    return;
                }
                let Ok(event) = serde_json::from_str::<Value>(&data) else { continue };
                let text = event
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !text.is_empty()
                    && tx.send(Ok(completion_chunk(text, Value::Null))).await.is_err()
                {
                    return;
                }
            }
        }

        // Upstream ended without a terminator; close out cleanly anyway.
        let _ = tx.send(Ok(completion_chunk("", json!("stop")))).await;
        let _ = tx.send(Ok(sse_done())).await;
    });

    Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn frame_data(frame: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(frame).ok()?;
    for line in text.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            return Some(data.trim().to_string());
        }
    }
    None
}
