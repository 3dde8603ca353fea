//! HTTP surface of the agent runtime.
//!
//! `POST /v1/agent/run` executes one bounded run and returns the transcript
//! payload. Budget overruns keep their transcript body but surface the
//! mandated status (408 for turn/runtime limits, 413 for tool I/O); pre-run
//! refusals (unknown agent, shed, queue) are plain typed errors.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde_json::Value;

use crate::{
    agent::AgentRunRequest,
    context::GatewayContext,
    error::GatewayError,
};

use super::chat::route_hints;

/// `POST /v1/agent/run`.
pub async fn agent_run(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let run_req: AgentRunRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid agent run request: {e}")))?;

    let hints = route_hints(&headers);
    let outcome = ctx.agents.run(run_req, &hints).await?;

    let status = outcome
        .failure_status
        .as_ref()
        .map(GatewayError::status)
        .unwrap_or(StatusCode::OK);

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-backend-used", outcome.backend.as_str())
        .header("x-model-used", outcome.upstream_model.as_str())
        .body(Body::from(serde_json::to_vec(&outcome.payload).unwrap_or_default()))
        .map_err(|e| anyhow::anyhow!("building agent response: {e}").into())
}

/// `GET /v1/agent/replay/{run_id}` — fetch a persisted transcript.
pub async fn agent_replay(
    State(ctx): State<Arc<GatewayContext>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(ctx.agents.load_transcript(&run_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Backend, RunLogMode, Settings};
    use axum::{
        http::Request,
        middleware,
        routing::{get, post},
        Router,
    };
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path as urlpath};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx_for(server_uri: &str, dir: &std::path::Path, specs: &str) -> Arc<GatewayContext> {
        let spec_path = dir.join("agent_specs.json");
        std::fs::write(&spec_path, specs).unwrap();

        let mut s = Settings::default();
        s.gateway_bearer_token = "tok".into();
        s.mlx_base_url = server_uri.to_string();
        s.default_backend = Backend::Mlx;
        s.agent_shed_heavy = false;
        s.agent_specs_path = spec_path.to_string_lossy().into_owned();
        s.agent_runs_log_mode = RunLogMode::Both;
        s.agent_runs_log_dir = dir.join("agent").to_string_lossy().into_owned();
        s.agent_runs_log_path = dir.join("agent/runs.ndjson").to_string_lossy().into_owned();
        s.tools_log_path = dir.join("tools/inv.ndjson").to_string_lossy().into_owned();
        s.tools_log_dir = dir.join("tools").to_string_lossy().into_owned();
        GatewayContext::new(s)
    }

    fn app(ctx: Arc<GatewayContext>) -> Router {
        Router::new()
            .route("/v1/agent/run", post(agent_run))
            .route("/v1/agent/replay/{run_id}", get(agent_replay))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&ctx),
                super::super::auth::auth_middleware,
            ))
            .with_state(ctx)
    }

    async fn post_run(ctx: Arc<GatewayContext>, body: Value) -> (StatusCode, Value, HeaderMap) {
        let resp = app(ctx)
            .oneshot(
                Request::post("/v1/agent/run")
                    .header("authorization", "Bearer tok")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap(), headers)
    }

    #[tokio::test]
    async fn bounded_single_turn_run_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(urlpath("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "word" } }]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(
            &server.uri(),
            dir.path(),
            r#"{"default":{"model":"fast","tier":0,"max_turns":1}}"#,
        );

        let (status, body, headers) = post_run(
            Arc::clone(&ctx),
            json!({ "agent": "default", "input": "say one word" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["output_text"], "word");
        assert_eq!(headers.get("x-backend-used").unwrap(), "mlx");

        let types: Vec<&str> = body["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["run_started", "plan", "assistant", "run_completed"]);

        // And the transcript replays.
        let run_id = body["run_id"].as_str().unwrap();
        let resp = app(ctx)
            .oneshot(
                Request::get(format!("/v1/agent/replay/{run_id}"))
                    .header("authorization", "Bearer tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let replayed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(replayed["run_id"], body["run_id"]);
    }

    #[tokio::test]
    async fn turn_limit_returns_408_with_the_transcript() {
        let server = MockServer::start().await;
        // ACT always requests a tool; the run can never converge.
        Mock::given(method("POST"))
            .and(urlpath("/chat/completions"))
            .and(wiremock::matchers::body_string_contains("\"tools\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "tool_calls": [{ "id": "c1", "function": { "name": "noop", "arguments": "{}" } }],
                }}]
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "plan" } }]
            })))
            .with_priority(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(
            &server.uri(),
            dir.path(),
            r#"{"default":{"model":"fast","tier":0,"max_turns":1}}"#,
        );

        let (status, body, _) =
            post_run(ctx, json!({ "agent": "default", "input": "never stop" })).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["ok"], false);
        assert_eq!(body["events"].as_array().unwrap().last().unwrap()["type"], "run_failed");
    }

    #[tokio::test]
    async fn unknown_replay_is_404() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(&server.uri(), dir.path(), r#"{"default":{"model":"fast"}}"#);
        let resp = app(ctx)
            .oneshot(
                Request::get("/v1/agent/replay/run-nope")
                    .header("authorization", "Bearer tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_run_request_is_400() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(&server.uri(), dir.path(), r#"{"default":{"model":"fast"}}"#);
        let (status, _, _) = post_run(ctx, json!({ "agent": 42 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
