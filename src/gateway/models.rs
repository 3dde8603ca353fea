//! Model listing endpoints.
//!
//! `/v1/models` aggregates three sources: live model tags from both chat
//! upstreams (best-effort — an unreachable upstream contributes nothing),
//! the routing sentinels (`auto` plus the backend names), and every
//! configured alias with its metadata so clients can discover the stable
//! routing names.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::{context::GatewayContext, error::GatewayError, ids::now_unix};

/// `GET /v1/models`.
pub async fn list_models(
    State(ctx): State<Arc<GatewayContext>>,
) -> Result<Json<Value>, GatewayError> {
    let now = now_unix();
    let mut data: Vec<Value> = Vec::new();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| anyhow::anyhow!("building model-list client: {e}"))?;

    // Live Ollama tags.
    let ollama_base = ctx.settings.ollama_base_url.trim_end_matches('/');
    if let Ok(resp) = client.get(format!("{ollama_base}/api/tags")).send().await {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<Value>().await {
                for model in body.get("models").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(name) = model.get("name").and_then(Value::as_str) {
                        data.push(json!({
                            "id": format!("ollama:{name}"),
                            "object": "model",
                            "created": now,
                            "owned_by": "local",
                        }));
                    }
                }
            }
        }
    }

    // Live MLX models.
    let mlx_base = ctx.settings.mlx_base_url.trim_end_matches('/');
    if let Ok(resp) = client.get(format!("{mlx_base}/models")).send().await {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<Value>().await {
                for model in body.get("data").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(id) = model.get("id").and_then(Value::as_str) {
                        data.push(json!({
                            "id": format!("mlx:{id}"),
                            "object": "model",
                            "created": now,
                            "owned_by": "local",
                        }));
                    }
                }
            }
        }
    }

    // Routing sentinels.
    for id in ["auto", "ollama", "mlx"] {
        data.push(json!({ "id": id, "object": "model", "created": now, "owned_by": "gateway" }));
    }

    // Aliases, with enough metadata for clients to pick intelligently.
    let mut alias_entries: Vec<_> = ctx.aliases.iter().collect();
    alias_entries.sort_by(|a, b| a.0.cmp(b.0));
    for (name, alias) in alias_entries {
        let mut item = json!({
            "id": name,
            "object": "model",
            "created": now,
            "owned_by": "gateway",
            "backend": alias.backend.as_str(),
            "upstream_model": alias.upstream_model,
        });
        if let Some(window) = alias.context_window {
            item["context_window"] = json!(window);
        }
        if let Some(tools) = alias.tools {
            item["tools"] = json!(tools);
        }
        if let Some(cap) = alias.max_tokens_cap {
            item["max_tokens_cap"] = json!(cap);
        }
        if let Some(cap) = alias.temperature_cap {
            item["temperature_cap"] = json!(cap);
        }
        data.push(item);
    }

    Ok(Json(json!({ "object": "list", "data": data })))
}

/// `GET /v1/models/{model_id}`.
pub async fn get_model(Path(model_id): Path<String>) -> Json<Value> {
    Json(json!({
        "id": model_id,
        "object": "model",
        "created": now_unix(),
        "owned_by": "local",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use axum::{body::Body, http::Request, middleware, routing::get, Router};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(ctx: Arc<GatewayContext>) -> Router {
        Router::new()
            .route("/v1/models", get(list_models))
            .route("/v1/models/{model_id}", get(get_model))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&ctx),
                super::super::auth::auth_middleware,
            ))
            .with_state(ctx)
    }

    async fn fetch(ctx: Arc<GatewayContext>, uri: &str) -> Value {
        let resp = app(ctx)
            .oneshot(
                Request::get(uri)
                    .header("authorization", "Bearer tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn listing_includes_upstream_models_sentinels_and_aliases() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "qwen2.5:7b" }, { "name": "llama3:8b" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "gemma-2-9b" }]
            })))
            .mount(&server)
            .await;

        let mut s = Settings::default();
        s.gateway_bearer_token = "tok".into();
        s.ollama_base_url = server.uri();
        s.mlx_base_url = server.uri();
        let body = fetch(GatewayContext::new(s), "/v1/models").await;

        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"ollama:qwen2.5:7b"));
        assert!(ids.contains(&"mlx:gemma-2-9b"));
        assert!(ids.contains(&"auto"));
        assert!(ids.contains(&"fast"));
        assert!(ids.contains(&"coder"));

        // Alias entries carry routing metadata.
        let fast = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["id"] == "fast")
            .unwrap();
        assert_eq!(fast["backend"], "ollama");
        assert_eq!(fast["tools"], false);
    }

    #[tokio::test]
    async fn unreachable_upstreams_still_produce_a_listing() {
        let mut s = Settings::default();
        s.gateway_bearer_token = "tok".into();
        s.ollama_base_url = "http://127.0.0.1:9".into();
        s.mlx_base_url = "http://127.0.0.1:9".into();
        let body = fetch(GatewayContext::new(s), "/v1/models").await;
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"auto"));
        assert!(ids.contains(&"default"));
    }

    #[tokio::test]
    async fn single_model_lookup_echoes_the_id() {
        let mut s = Settings::default();
        s.gateway_bearer_token = "tok".into();
        let body = fetch(GatewayContext::new(s), "/v1/models/anything").await;
        assert_eq!(body["id"], "anything");
        assert_eq!(body["object"], "model");
    }
}
