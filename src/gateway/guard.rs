//! Request size guard.
//!
//! Runs outermost, before auth: oversized payloads are refused before any
//! other work happens. `Content-Length` is preferred when present; bodied
//! methods without one get their body buffered up to the limit and rejected
//! past it. The effective limit is the global setting, optionally overridden
//! by the caller's per-token policy (resolved from the raw header — the auth
//! middleware has not run yet at this layer).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;

use crate::{context::GatewayContext, error::GatewayError};

use super::auth::bearer_from_headers;

/// Axum middleware enforcing the request size limit.
pub async fn size_guard_middleware(
    State(ctx): State<Arc<GatewayContext>>,
    req: Request,
    next: Next,
) -> Response {
    let mut max_bytes = ctx.settings.max_request_bytes;

    // Per-token override, when the token is known and carries a policy.
    if let Some(token) = bearer_from_headers(req.headers()) {
        if let Some(limit) = ctx
            .token_policy(&token)
            .and_then(|p| p.get("max_request_bytes"))
            .and_then(Value::as_u64)
        {
            max_bytes = limit;
        }
    }

    if max_bytes == 0 {
        return next.run(req).await;
    }

    if let Some(length) = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if length > max_bytes {
            return GatewayError::RequestTooLarge("request too large".into()).into_response();
        }
        return next.run(req).await;
    }

    // No Content-Length on a bodied method: buffer once and check.
    let method = req.method();
    if method == Method::POST || method == Method::PUT || method == Method::PATCH {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, max_bytes as usize).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return GatewayError::RequestTooLarge("request too large".into()).into_response()
            }
        };
        let req = Request::from_parts(parts, Body::from(bytes));
        return next.run(req).await;
    }

    next.run(req).await
}
