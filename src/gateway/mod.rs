//! Client-facing API assembly.
//!
//! Middleware order matters and reads outside-in: trace → instrumentation
//! (request id + request log) → size guard → bearer auth → handler. The
//! guard sits outside auth so oversized bodies are refused before any policy
//! work; instrumentation sits outside both so even rejected requests get a
//! request id and a log line.

pub mod agent_routes;
pub mod auth;
pub mod chat;
pub mod embeddings;
pub mod guard;
pub mod instrument;
pub mod media;
pub mod models;
pub mod tools_routes;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::context::GatewayContext;

/// Build the client-facing router with the full middleware stack.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/completions", post(chat::completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/{model_id}", get(models::get_model))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .route("/v1/rerank", post(embeddings::rerank))
        .route("/v1/images/generations", post(media::images_generations))
        .route("/v1/images/files/{name}", get(media::serve_image_file))
        .route("/v1/music/generations", post(media::music_generations))
        .route("/v1/tts/generations", post(media::tts_generations))
        .route("/v1/audio/speech", post(media::tts_generations))
        .route("/v1/tools", get(tools_routes::list_tools).post(tools_routes::dispatch_tool))
        .route("/v1/tools/replay/{replay_id}", get(tools_routes::replay_tool))
        .route("/v1/tools/{name}", post(tools_routes::execute_tool))
        .route("/v1/agent/run", post(agent_routes::agent_run))
        .route("/v1/agent/replay/{run_id}", get(agent_routes::agent_replay))
        .layer(middleware::from_fn_with_state(Arc::clone(&ctx), auth::auth_middleware))
        .layer(middleware::from_fn_with_state(Arc::clone(&ctx), guard::size_guard_middleware))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            instrument::instrument_middleware,
        ))
        .with_state(ctx)
}
