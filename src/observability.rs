//! Internal observability listener.
//!
//! A second, unauthenticated HTTP listener bound to localhost by default —
//! network isolation is the access control here, the same reason it sits on
//! its own port rather than behind the bearer gate. Endpoints:
//!
//! - `GET /health`    — process liveness, no dependencies
//! - `GET /readyz`    — 503 until every probed backend reports ready
//! - `GET /metrics`   — Prometheus text exposition
//! - `GET /health/upstreams` — live reachability of the chat upstreams
//! - `GET /status`    — uptime and admission `{limit, available, inflight}`

use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use crate::context::GatewayContext;

/// Build the observability router.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/health/upstreams", get(health_upstreams))
        .route("/status", get(status))
        .with_state(ctx)
}

/// `GET /health` — always 200; safe as a container liveness probe.
async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// `GET /readyz` — reflects the health checker's latest observations.
async fn readyz(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    let statuses = ctx.health.all_status();
    if statuses.is_empty() {
        return (
            StatusCode::OK,
            Json(json!({ "ok": true, "ready": true, "detail": "no_backends" })),
        );
    }

    let ready = statuses.values().all(|s| s.healthy && s.ready);
    let backends: serde_json::Map<String, Value> = statuses
        .iter()
        .map(|(name, s)| {
            (
                name.clone(),
                json!({
                    "healthy": s.healthy,
                    "ready": s.ready,
                    "last_check": s.last_check_unix,
                    "error": s.error,
                }),
            )
        })
        .collect();

    let payload = json!({ "ok": ready, "ready": ready, "backends": backends });
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(payload))
}

/// `GET /metrics` — Prometheus text format; 404 when metrics are disabled.
async fn metrics(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    if !ctx.metrics.enabled() {
        return (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], String::new());
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        ctx.metrics.render(),
    )
}

/// `GET /health/upstreams` — poke the chat upstreams directly.
async fn health_upstreams(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => {
            return Json(json!({ "ok": false, "error": e.to_string() }));
        }
    };

    let mut ok = true;
    let mut upstreams = serde_json::Map::new();
    for (name, url) in [
        ("ollama", format!("{}/api/tags", ctx.settings.ollama_base_url.trim_end_matches('/'))),
        ("mlx", format!("{}/models", ctx.settings.mlx_base_url.trim_end_matches('/'))),
    ] {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                upstreams
                    .insert(name.into(), json!({ "ok": true, "status": resp.status().as_u16() }));
            }
            Ok(resp) => {
                ok = false;
                upstreams
                    .insert(name.into(), json!({ "ok": false, "status": resp.status().as_u16() }));
            }
            Err(e) => {
                ok = false;
                upstreams.insert(name.into(), json!({ "ok": false, "error": e.to_string() }));
            }
        }
    }
    Json(json!({ "ok": ok, "upstreams": upstreams }))
}

/// `GET /status` — uptime plus live admission counters.
async fn status(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "backends": ctx.registry.len(),
        "admission": ctx.admission.stats(),
    }))
}
