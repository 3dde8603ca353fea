//! Unified error taxonomy for the request plane.
//!
//! Every handler returns `Result<T, GatewayError>` and propagates with `?`.
//! [`GatewayError`] is a discriminated union whose variants carry exactly the
//! structured detail the client-facing JSON needs; the HTTP mapping happens
//! once, in [`IntoResponse`]. Kind strings are stable API — clients and the
//! request log match on them.
//!
//! Two deliberate asymmetries, per the propagation policy:
//! - tool failures are *not* HTTP errors (they return `ok:false` bodies), so
//!   there is no variant for them here;
//! - admission refusals are never queued — `BackendOverloaded` carries the
//!   `Retry-After: 5` header and returns immediately.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// All error shapes the request plane can surface to a client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Body or params failed validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// Tool arguments did not match the declared schema.
    #[error("invalid tool arguments")]
    InvalidArguments { issues: Vec<String> },

    /// Backend does not offer the requested capability.
    #[error("backend {backend_class} does not support {route_kind}")]
    CapabilityNotSupported {
        backend_class: String,
        route_kind: String,
        /// Availability listing for helpful error bodies (backends currently
        /// offering the capability, with health detail).
        availability: Value,
    },

    /// Backend class is not configured at all.
    #[error("backend {backend_class} is not configured")]
    BackendNotFound {
        backend_class: String,
        availability: Value,
    },

    /// Tool is not in the caller's effective allowlist. Fail-closed: the
    /// message is identical whether or not the tool exists.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Tool is allowlisted but has no declaration (builtin or registry).
    #[error("undeclared tool: {0}")]
    UndeclaredTool(String),

    /// Missing bearer token.
    #[error("{0}")]
    Unauthorized(String),

    /// Bad token or client IP not allowlisted.
    #[error("{0}")]
    Forbidden(String),

    /// No invocation or run recorded under that id.
    #[error("replay not found: {0}")]
    ReplayNotFound(String),

    /// Health gate rejected routing to this backend.
    #[error("backend {backend_class} is not ready to accept requests")]
    BackendNotReady {
        backend_class: String,
        detail: Value,
    },

    /// Admission capacity exhausted for (backend_class, route_kind).
    #[error("backend {backend_class} is at capacity for {route_kind} requests")]
    BackendOverloaded {
        backend_class: String,
        route_kind: String,
    },

    /// Per-token bucket empty, tool concurrency timeout, or agent queue
    /// full/timeout/shed. The payload `error` field distinguishes them.
    #[error("{message}")]
    RateLimited {
        /// Short stable discriminator: `rate_limited`, `queue_full`,
        /// `queue_timeout`, `shed_heavy`.
        error: String,
        message: String,
    },

    /// Request body or accumulated tool I/O over the configured limit.
    #[error("{0}")]
    RequestTooLarge(String),

    /// Agent runtime or turn budget exceeded.
    #[error("{0}")]
    Timeout(String),

    /// Backend RPC failed or returned non-2xx.
    #[error("upstream {upstream} error")]
    UpstreamError { upstream: String, detail: Value },

    /// Anything unexpected. Includes `io::Error`, `reqwest::Error`, and any
    /// `anyhow`-wrapped failure from startup plumbing.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Convenience constructor for the common single-message rate limit.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::RateLimited { error: "rate_limited".into(), message }
    }

    /// Stable kind string, used in response bodies and the request log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::CapabilityNotSupported { .. } => "capability_not_supported",
            Self::BackendNotFound { .. } => "backend_not_found",
            Self::UnknownTool(_) => "unknown_tool",
            Self::UndeclaredTool(_) => "undeclared_tool",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ReplayNotFound(_) => "replay_not_found",
            Self::BackendNotReady { .. } => "backend_not_ready",
            Self::BackendOverloaded { .. } => "backend_overloaded",
            Self::RateLimited { .. } => "rate_limited",
            Self::RequestTooLarge(_) => "request_too_large",
            Self::Timeout(_) => "timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidArguments { .. }
            | Self::CapabilityNotSupported { .. }
            | Self::BackendNotFound { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::UnknownTool(_) | Self::UndeclaredTool(_) | Self::ReplayNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::RequestTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BackendOverloaded { .. } | Self::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::BackendNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::InvalidArguments { issues } => json!({
                "error": "invalid_arguments",
                "error_type": "invalid_arguments",
                "error_message": "invalid tool arguments",
                "issues": issues,
            }),
            Self::CapabilityNotSupported { backend_class, route_kind, availability } => {
                let mut body = json!({
                    "error": "capability_not_supported",
                    "backend_class": backend_class,
                    "route_kind": route_kind,
                    "message": format!("Backend {backend_class} does not support {route_kind}"),
                });
                merge(&mut body, availability);
                body
            }
            Self::BackendNotFound { backend_class, availability } => {
                let mut body = json!({
                    "error": "backend_not_found",
                    "backend_class": backend_class,
                    "message": format!("Backend {backend_class} is not configured"),
                });
                merge(&mut body, availability);
                body
            }
            Self::BackendNotReady { backend_class, detail } => {
                let mut body = json!({
                    "error": "backend_not_ready",
                    "backend_class": backend_class,
                    "message": format!("Backend {backend_class} is not ready to accept requests"),
                });
                merge(&mut body, detail);
                body
            }
            Self::BackendOverloaded { backend_class, route_kind } => json!({
                "error": "backend_overloaded",
                "backend_class": backend_class,
                "route_kind": route_kind,
                "message": format!("Backend {backend_class} is at capacity for {route_kind} requests"),
            }),
            Self::RateLimited { error, message } => json!({
                "error": error,
                "error_type": "rate_limited",
                "error_message": message,
            }),
            Self::UpstreamError { upstream, detail } => {
                let mut body = json!({
                    "error": "upstream_error",
                    "upstream": upstream,
                });
                merge(&mut body, detail);
                body
            }
            other => json!({
                "error": other.kind(),
                "message": other.to_string(),
            }),
        }
    }
}

/// Shallow-merge `extra`'s object members into `base` (existing keys win).
fn merge(base: &mut Value, extra: &Value) {
    if let (Some(base_map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_map {
            base_map.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "request rejected");
        }

        let mut response = (status, Json(self.body())).into_response();
        let retry_after = match &self {
            Self::BackendOverloaded { .. } => Some("5"),
            Self::BackendNotReady { .. } => Some("30"),
            _ => None,
        };
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static(secs));
        }
        response
    }
}
