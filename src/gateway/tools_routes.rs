//! HTTP surface of the tool bus.
//!
//! Thin handlers: auth has already run, so these extract the caller's policy
//! and bearer token from extensions, apply the per-token rate limit, and
//! delegate to [`ToolBus`]. Tool failures come back as 200s with `ok: false`;
//! only bus refusals (unknown tool, bad arguments, capacity) map to HTTP
//! error statuses.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::Value;

use crate::{context::GatewayContext, error::GatewayError};

use super::auth::{BearerToken, TokenPolicy};

fn policy_of(policy: &Option<Extension<TokenPolicy>>) -> Option<&Value> {
    policy.as_ref().and_then(|Extension(TokenPolicy(p))| p.as_ref())
}

fn token_of(token: &Option<Extension<BearerToken>>) -> &str {
    token.as_ref().map(|Extension(BearerToken(t))| t.as_str()).unwrap_or("")
}

/// `GET /v1/tools` — declared tools visible under the caller's allowlist.
pub async fn list_tools(
    State(ctx): State<Arc<GatewayContext>>,
    token: Option<Extension<BearerToken>>,
    policy: Option<Extension<TokenPolicy>>,
) -> Result<Json<Value>, GatewayError> {
    let policy = policy_of(&policy);
    ctx.tool_bus.check_rate_limit(token_of(&token), policy)?;
    let allowed = ctx.tool_bus.effective_allowlist(policy);
    Ok(Json(ctx.tool_bus.list(&allowed)))
}

/// `POST /v1/tools` — dispatcher form: `{"name": …, "arguments": {…}}`.
pub async fn dispatch_tool(
    State(ctx): State<Arc<GatewayContext>>,
    token: Option<Extension<BearerToken>>,
    policy: Option<Extension<TokenPolicy>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let policy = policy_of(&policy);
    ctx.tool_bus.check_rate_limit(token_of(&token), policy)?;

    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("name must be a non-empty string".into()))?
        .to_string();
    let args = match body.get("arguments") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(args) if args.is_object() => args.clone(),
        Some(_) => {
            return Err(GatewayError::InvalidRequest("arguments must be an object".into()))
        }
    };

    let allowed = ctx.tool_bus.effective_allowlist(policy);
    let result = ctx.tool_bus.execute(&name, args, &allowed).await?;
    Ok(Json(result))
}

/// `POST /v1/tools/{name}` — arguments as the body, or under `"arguments"`.
pub async fn execute_tool(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
    token: Option<Extension<BearerToken>>,
    policy: Option<Extension<TokenPolicy>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let policy = policy_of(&policy);
    ctx.tool_bus.check_rate_limit(token_of(&token), policy)?;

    let args = match body.get("arguments") {
        Some(args) if args.is_object() => args.clone(),
        Some(_) => {
            return Err(GatewayError::InvalidRequest("arguments must be an object".into()))
        }
        // Shortcut form: the body itself is the argument object.
        None if body.is_object() => body,
        None => return Err(GatewayError::InvalidRequest("body must be an object".into())),
    };

    let allowed = ctx.tool_bus.effective_allowlist(policy);
    let result = ctx.tool_bus.execute(&name, args, &allowed).await?;
    Ok(Json(result))
}

/// `GET /v1/tools/replay/{replay_id}` — fetch a logged invocation.
pub async fn replay_tool(
    State(ctx): State<Arc<GatewayContext>>,
    Path(replay_id): Path<String>,
    token: Option<Extension<BearerToken>>,
    policy: Option<Extension<TokenPolicy>>,
) -> Result<Json<Value>, GatewayError> {
    ctx.tool_bus.check_rate_limit(token_of(&token), policy_of(&policy))?;
    Ok(Json(ctx.tool_bus.replay(&replay_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::{get, post},
        Router,
    };
    use serde_json::json;
    use tower::ServiceExt;

    fn ctx_in(dir: &std::path::Path, configure: impl FnOnce(&mut Settings)) -> Arc<GatewayContext> {
        let mut s = Settings::default();
        s.gateway_bearer_token = "tok".into();
        s.tools_log_mode = crate::settings::ToolLogMode::Both;
        s.tools_log_path = dir.join("inv.ndjson").to_string_lossy().into_owned();
        s.tools_log_dir = dir.to_string_lossy().into_owned();
        configure(&mut s);
        GatewayContext::new(s)
    }

    fn app(ctx: Arc<GatewayContext>) -> Router {
        Router::new()
            .route("/v1/tools", get(list_tools).post(dispatch_tool))
            .route("/v1/tools/replay/{replay_id}", get(replay_tool))
            .route("/v1/tools/{name}", post(execute_tool))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&ctx),
                super::super::auth::auth_middleware,
            ))
            .with_state(ctx)
    }

    async fn call(
        ctx: Arc<GatewayContext>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer tok");
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app(ctx).oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn tools_require_auth() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path(), |_| {});
        let resp = app(ctx)
            .oneshot(Request::get("/v1/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_reflects_the_callers_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path(), |s| s.tools_allow_git = true);
        let (status, body) = call(ctx, "GET", "/v1/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["git", "noop"]);
    }

    #[tokio::test]
    async fn execute_and_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path(), |_| {});

        // Scenario E: dispatcher form.
        let (status, body) = call(
            Arc::clone(&ctx),
            "POST",
            "/v1/tools",
            Some(json!({ "name": "noop", "arguments": { "text": "x" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["text"], "x");
        let replay_id = body["replay_id"].as_str().unwrap().to_string();
        let request_hash = body["request_hash"].as_str().unwrap().to_string();

        let (status, replayed) = call(
            Arc::clone(&ctx),
            "GET",
            &format!("/v1/tools/replay/{replay_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replayed["replay_id"], replay_id);
        assert_eq!(replayed["request_hash"], request_hash);
        assert_eq!(replayed["tool"], "noop");
        assert_eq!(replayed["args"]["text"], "x");

        // And the hash matches a recomputation of the original request.
        assert_eq!(
            request_hash,
            crate::canonical::request_hash("noop", "1", &json!({ "text": "x" }))
        );
    }

    #[tokio::test]
    async fn named_route_accepts_bare_argument_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path(), |_| {});
        let (status, body) =
            call(ctx, "POST", "/v1/tools/noop", Some(json!({ "text": "direct" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "direct");
    }

    #[tokio::test]
    async fn refusals_map_to_http_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path(), |_| {});

        let (status, body) = call(
            Arc::clone(&ctx),
            "POST",
            "/v1/tools",
            Some(json!({ "name": "shell", "arguments": { "cmd": "ls" } })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_tool");

        let (status, body) = call(
            Arc::clone(&ctx),
            "POST",
            "/v1/tools",
            Some(json!({ "name": "noop", "arguments": { "bogus": 1 } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_arguments");
        assert_eq!(body["issues"][0], "unexpected field: bogus");

        let (status, _) = call(Arc::clone(&ctx), "GET", "/v1/tools/replay/tool-none", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            call(ctx, "POST", "/v1/tools", Some(json!({ "arguments": {} }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn per_token_rate_limit_applies_to_the_surface() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path(), |s| {
            s.tools_rate_limit_rps = 0.001;
            s.tools_rate_limit_burst = 2;
        });

        for _ in 0..2 {
            let (status, _) = call(Arc::clone(&ctx), "GET", "/v1/tools", None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(ctx, "GET", "/v1/tools", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error_type"], "rate_limited");
    }

    #[tokio::test]
    async fn failed_tools_are_still_200_with_ok_false() {
        let dir = tempfile::tempdir().unwrap();
        // git allowlisted but disabled: the tool runs and reports failure.
        let ctx = ctx_in(dir.path(), |s| s.tools_allowlist = "git".into());
        let (status, body) = call(
            ctx,
            "POST",
            "/v1/tools",
            Some(json!({ "name": "git", "arguments": { "args": ["status"] } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
        assert!(body["replay_id"].is_string());
    }
}
