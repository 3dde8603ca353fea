//! Request-id correlation and NDJSON request logging.
//!
//! Every inbound request gets an `X-Request-Id` (caller-provided one is
//! honoured, otherwise freshly minted), carried through a tracing span and
//! echoed on the response. On completion one event lands in the request log:
//! non-streams immediately with their duration; SSE responses are wrapped so
//! the event carries time-to-first-token, chunk/byte counts, and an abort
//! reason when the client went away mid-stream. Routing detail (backend,
//! model, router reason) is lifted from the response headers the chat
//! handlers set, so no shared mutable state crosses the middleware boundary.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use futures_util::Stream;
use serde_json::{json, Value};
use tracing::Instrument as _;

use crate::{
    context::GatewayContext,
    ids::{new_id, now_unix},
    request_log::{round1, StreamMetrics},
};

/// Newtype carrying the assigned request id, exposed as an extension.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Axum middleware: correlation id + metrics + request-log event.
pub async fn instrument_middleware(
    State(ctx): State<Arc<GatewayContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| new_id("req"));

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::debug_span!("request", id = %request_id);
    let mut resp = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert("x-request-id", value);
    }

    let status = resp.status().as_u16();
    let duration_ms = round1(started.elapsed().as_secs_f64() * 1_000.0);
    ctx.metrics.observe_request(&path, status, duration_ms);

    let mut base = serde_json::Map::new();
    base.insert("ts".into(), json!(now_unix()));
    base.insert("request_id".into(), json!(request_id));
    base.insert("method".into(), json!(method));
    base.insert("path".into(), json!(path));
    base.insert("status".into(), json!(status));
    // Routing detail from the handler-set response headers.
    for (header, field) in [
        ("x-backend-used", "backend"),
        ("x-model-used", "upstream_model"),
        ("x-router-reason", "router_reason"),
    ] {
        if let Some(value) = resp.headers().get(header).and_then(|v| v.to_str().ok()) {
            base.insert(field.into(), json!(value));
        }
    }
    if let Some(backend) = base.get("backend").and_then(Value::as_str) {
        let class = ctx.registry.resolve_class(backend).to_string();
        base.insert("backend_class".into(), json!(class));
    }

    let is_stream = resp
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);

    if !is_stream {
        base.insert("stream".into(), json!(false));
        base.insert("duration_ms".into(), json!(duration_ms));
        ctx.request_log.write(Value::Object(base));
        return resp;
    }

    // Streams are measured during body iteration and logged when the body
    // finishes — or is dropped by a disconnecting client.
    let (parts, body) = resp.into_parts();
    let instrumented = InstrumentedBody {
        inner: Box::pin(body.into_data_stream()),
        metrics: StreamMetrics::new(started),
        pending: Some((base, Arc::clone(&ctx))),
    };
    Response::from_parts(parts, Body::from_stream(instrumented))
}

/// Body wrapper that counts chunks and writes the request-log event exactly
/// once, whether the stream ends, errors, or is dropped mid-flight.
struct InstrumentedBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send>>,
    metrics: StreamMetrics,
    pending: Option<(serde_json::Map<String, Value>, Arc<GatewayContext>)>,
}

impl InstrumentedBody {
    fn finalize(&mut self) {
        if let Some((mut base, ctx)) = self.pending.take() {
            if let Some(extra) = self.metrics.finish().as_object() {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
            ctx.request_log.write(Value::Object(base));
        }
    }
}

impl Stream for InstrumentedBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.metrics.on_chunk(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.metrics.abort_reason = Some(e.to_string());
                self.finalize();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for InstrumentedBody {
    fn drop(&mut self) {
        // Client disconnects drop the body before completion.
        if self.pending.is_some() {
            self.metrics.abort_reason.get_or_insert_with(|| "client_disconnect".into());
            self.finalize();
        }
    }
}
