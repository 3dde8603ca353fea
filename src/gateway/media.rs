//! Media generation endpoints: images, music, and text-to-speech.
//!
//! These are normalising proxies. The gateway validates and admits the
//! request, massages the body into what the upstream engine expects, scales
//! timeouts with the requested duration, and post-processes the result —
//! most notably the image payload policy: by default generated bytes are
//! re-stored on disk and returned as a same-origin URL instead of a large
//! base64 blob.

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use base64::Engine as _;
use serde_json::{json, Value};

use crate::{
    context::GatewayContext,
    error::GatewayError,
    ids::now_unix,
    registry::Capability,
};

/// Effective base URL for a media backend class: registry entry first (which
/// supports `${VAR}` expansion), then the Settings fallback.
fn media_base_url(ctx: &GatewayContext, backend_class: &str, fallback: &str) -> String {
    ctx.registry
        .get(backend_class)
        .map(|cfg| cfg.base_url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| fallback.trim().trim_end_matches('/').to_string())
}

/// Stretch a timeout for long generations: 5 s per requested audio second
/// plus a 30 s buffer, never below the configured floor.
fn scale_timeout(base_timeout_sec: f64, body: &Value) -> f64 {
    let duration = body.get("duration").and_then(Value::as_f64).unwrap_or(0.0);
    if duration > 0.0 {
        base_timeout_sec.max(duration * 5.0 + 30.0)
    } else {
        base_timeout_sec
    }
}

async fn proxy_json(
    url: &str,
    body: &Value,
    timeout_sec: f64,
    upstream: &str,
) -> Result<(Value, f64), GatewayError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_sec.max(1.0)))
        .build()
        .map_err(|e| anyhow::anyhow!("building media client: {e}"))?;

    let started = std::time::Instant::now();
    let response = client.post(url).json(body).send().await.map_err(|e| {
        GatewayError::UpstreamError {
            upstream: upstream.into(),
            detail: json!({ "error": e.to_string() }),
        }
    })?;
    let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(GatewayError::UpstreamError {
            upstream: upstream.into(),
            detail: json!({
                "status": status.as_u16(),
                "body": text.chars().take(5_000).collect::<String>(),
            }),
        });
    }

    let payload = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }));
    Ok((payload, (latency_ms * 10.0).round() / 10.0))
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// `POST /v1/images/generations`.
pub async fn images_generations(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("prompt must be a non-empty string".into()))?
        .to_string();

    let n = body.get("n").and_then(Value::as_u64).unwrap_or(1);
    if !(1..=4).contains(&n) {
        return Err(GatewayError::InvalidRequest("n must be between 1 and 4".into()));
    }

    let size = body.get("size").and_then(Value::as_str).unwrap_or("1024x1024");
    let (width, height) = parse_size(size)?;
    if width * height > ctx.settings.images_max_pixels {
        return Err(GatewayError::InvalidRequest(format!(
            "size {size} exceeds the pixel budget ({} pixels)",
            ctx.settings.images_max_pixels
        )));
    }

    let response_format = body.get("response_format").and_then(Value::as_str).unwrap_or("url");
    if !matches!(response_format, "url" | "b64_json") {
        return Err(GatewayError::InvalidRequest(
            "response_format must be 'url' or 'b64_json'".into(),
        ));
    }

    let backend_class = ctx.settings.images_backend_class.clone();
    let lease = ctx.admit(&backend_class, Capability::Images)?;

    let base = media_base_url(&ctx, &backend_class, &ctx.settings.images_http_base_url);
    let mut result = if base.is_empty() {
        // No engine configured: deterministic placeholder so the full payload
        // pipeline (storage, URLs) stays exercisable.
        placeholder_images(&prompt, n, size)
    } else {
        let mut upstream_body = json!({
            "prompt": prompt,
            "n": n,
            "size": size,
            "response_format": "b64_json",
        });
        if let Some(model) = body.get("model").and_then(Value::as_str).filter(|m| !m.trim().is_empty()) {
            upstream_body["model"] = json!(model);
        }
        // Quality knobs pass through untouched; the engine may ignore them.
        for key in [
            "seed", "steps", "num_inference_steps", "guidance", "guidance_scale",
            "cfg_scale", "negative_prompt", "sampler", "scheduler", "style", "quality",
        ] {
            if let Some(v) = body.get(key) {
                upstream_body[key] = v.clone();
            }
        }
        let (payload, latency_ms) = proxy_json(
            &format!("{base}/v1/images/generations"),
            &upstream_body,
            ctx.settings.images_http_timeout_sec,
            "images",
        )
        .await?;
        let mut payload = payload;
        payload["_gateway"] = json!({
            "backend_class": backend_class,
            "upstream_base_url": base,
            "upstream_latency_ms": latency_ms,
        });
        payload
    };
    drop(lease);

    if response_format == "url" {
        result = store_images_as_urls(&ctx, result);
    }
    Ok(Json(result))
}

fn parse_size(size: &str) -> Result<(u64, u64), GatewayError> {
    let invalid = || GatewayError::InvalidRequest(format!("size must be 'WxH', got {size:?}"));
    let (w, h) = size.split_once('x').ok_or_else(invalid)?;
    let width: u64 = w.trim().parse().map_err(|_| invalid())?;
    let height: u64 = h.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// An inline SVG placeholder, base64-encoded like a real engine response.
fn placeholder_images(prompt: &str, n: u64, size: &str) -> Value {
    let label: String = prompt.chars().take(60).collect();
    let svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"256\" height=\"256\">\
         <rect width=\"100%\" height=\"100%\" fill=\"#223\"/>\
         <text x=\"12\" y=\"128\" fill=\"#eee\" font-size=\"12\">{label}</text></svg>"
    );
    let b64 = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());
    let data: Vec<Value> = (0..n).map(|_| json!({ "b64_json": b64 })).collect();
    json!({
        "created": now_unix(),
        "data": data,
        "_gateway": { "backend_class": "mock", "mime": "image/svg+xml", "size": size },
    })
}

/// Payload policy: replace every `b64_json` member with a same-origin URL to
/// the stored bytes. Decode failures leave the entry untouched.
fn store_images_as_urls(ctx: &GatewayContext, mut response: Value) -> Value {
    let mime = response
        .pointer("/_gateway/mime")
        .and_then(Value::as_str)
        .unwrap_or("image/png")
        .to_string();
    let Some(data) = response.get_mut("data").and_then(Value::as_array_mut) else {
        return response;
    };

    for item in data {
        let Some(b64) = item.get("b64_json").and_then(Value::as_str) else { continue };
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64) else { continue };

        let ext = match mime.as_str() {
            m if m.contains("jpeg") || m.contains("jpg") => "jpg",
            m if m.contains("svg") => "svg",
            m if m.contains("webp") => "webp",
            _ => "png",
        };
        let name = format!("{}_{}.{ext}", now_unix(), &sha256_hex_bytes(&bytes)[..16]);
        let dir = PathBuf::from(&ctx.settings.images_dir);
        let stored = std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::write(dir.join(&name), &bytes));
        if stored.is_err() {
            continue;
        }

        let url_path = format!("/v1/images/files/{name}");
        let public = ctx.settings.public_base_url.trim().trim_end_matches('/');
        let url =
            if public.is_empty() { url_path } else { format!("{public}{url_path}") };

        if let Some(map) = item.as_object_mut() {
            map.remove("b64_json");
            map.insert("url".into(), json!(url));
        }
    }
    response
}

fn sha256_hex_bytes(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    hex::encode(sha2::Sha256::digest(bytes))
}

/// `GET /v1/images/files/{name}` — serve a stored generation.
pub async fn serve_image_file(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    // Filenames are gateway-minted; anything with path structure is hostile.
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(GatewayError::InvalidRequest("invalid image name".into()));
    }
    let path = PathBuf::from(&ctx.settings.images_dir).join(&name);
    let bytes = std::fs::read(&path)
        .map_err(|_| GatewayError::ReplayNotFound(format!("image {name}")))?;

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(|e| anyhow::anyhow!("building image response: {e}").into())
}

// ---------------------------------------------------------------------------
// Music
// ---------------------------------------------------------------------------

/// `POST /v1/music/generations`.
pub async fn music_generations(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let mut body = body;
    if !body.is_object() {
        return Err(GatewayError::InvalidRequest("body must be an object".into()));
    }

    // Callers may say `input` instead of `prompt`.
    if body.get("prompt").is_none() {
        if let Some(input) = body.get("input").and_then(Value::as_str) {
            body["prompt"] = json!(input);
        }
    }
    // Tag lists are joined into the comma-separated form the engine expects.
    if let Some(tags) = body.get("tags").and_then(Value::as_array) {
        let joined = tags
            .iter()
            .filter_map(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        body["tags"] = json!(joined);
    }

    let backend_class = ctx.settings.music_backend_class.clone();
    let lease = ctx.admit(&backend_class, Capability::Music)?;

    let base = media_base_url(&ctx, &backend_class, &ctx.settings.heartmula_base_url);
    if base.is_empty() {
        return Err(GatewayError::BackendNotReady {
            backend_class,
            detail: json!({ "health_error": "base_url not configured" }),
        });
    }

    let path = normalized_path(&ctx.settings.heartmula_generate_path);
    let timeout = scale_timeout(ctx.settings.heartmula_timeout_sec, &body);
    let (mut payload, latency_ms) =
        proxy_json(&format!("{base}{path}"), &body, timeout, "music").await?;
    drop(lease);

    if payload.is_object() {
        payload["_gateway"] = json!({
            "backend_class": backend_class,
            "upstream_base_url": base,
            "upstream_path": path,
            "upstream_latency_ms": latency_ms,
        });
    }
    Ok(Json(payload))
}

fn normalized_path(raw: &str) -> String {
    let p = raw.trim();
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

// ---------------------------------------------------------------------------
// TTS
// ---------------------------------------------------------------------------

/// `POST /v1/tts/generations` and `POST /v1/audio/speech`.
pub async fn tts_generations(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let mut body = body;
    if !body.is_object() {
        return Err(GatewayError::InvalidRequest("body must be an object".into()));
    }

    // `input` and `text` are aliases; engines differ on which they read.
    if body.get("text").is_none() {
        if let Some(input) = body.get("input").and_then(Value::as_str) {
            body["text"] = json!(input);
        }
    }
    if body.get("input").is_none() {
        if let Some(text) = body.get("text").and_then(Value::as_str) {
            body["input"] = json!(text);
        }
    }
    if let Some(voice) = body.get("voice").cloned() {
        match voice.as_str().map(str::trim) {
            Some("") | None => {
                if let Some(map) = body.as_object_mut() {
                    map.remove("voice");
                }
            }
            Some(v) => body["voice"] = json!(v),
        }
    }
    if let Some(speed) = body.get("speed").and_then(Value::as_f64) {
        body["speed"] = json!(speed.clamp(0.5, 2.0));
    }

    let backend_class = ctx.settings.tts_backend_class.clone();
    let lease = ctx.admit(&backend_class, Capability::Tts)?;

    let base = media_base_url(&ctx, &backend_class, &ctx.settings.tts_base_url);
    if base.is_empty() {
        return Err(GatewayError::BackendNotReady {
            backend_class,
            detail: json!({ "health_error": "base_url not configured" }),
        });
    }

    let path = normalized_path(&ctx.settings.tts_generate_path);
    let timeout = scale_timeout(ctx.settings.tts_timeout_sec, &body);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(timeout.max(1.0)))
        .build()
        .map_err(|e| anyhow::anyhow!("building tts client: {e}"))?;
    let response = client.post(format!("{base}{path}")).json(&body).send().await.map_err(|e| {
        GatewayError::UpstreamError { upstream: "tts".into(), detail: json!({ "error": e.to_string() }) }
    })?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = response.bytes().await.unwrap_or_default();
    drop(lease);

    if !status.is_success() {
        return Err(GatewayError::UpstreamError {
            upstream: "tts".into(),
            detail: json!({
                "status": status.as_u16(),
                "body": String::from_utf8_lossy(&bytes).chars().take(5_000).collect::<String>(),
            }),
        });
    }

    // JSON responses may embed base64 audio; decode and serve it as audio.
    if content_type.contains("application/json") {
        if let Ok(payload) = serde_json::from_slice::<Value>(&bytes) {
            if let Some((audio, decoded_type)) = decode_audio_from_json(&payload) {
                return audio_response(&decoded_type, audio);
            }
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&payload).unwrap_or_default()))
                .map_err(|e| anyhow::anyhow!("building tts response: {e}").into());
        }
    }

    audio_response(&content_type, bytes.to_vec())
}

fn audio_response(content_type: &str, audio: Vec<u8>) -> Result<Response, GatewayError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(audio))
        .map_err(|e| anyhow::anyhow!("building audio response: {e}").into())
}

/// Pull base64 audio out of a JSON payload. Accepts `audio_base64`, `audio`
/// or `audio_data`, with optional data-URL framing.
fn decode_audio_from_json(payload: &Value) -> Option<(Vec<u8>, String)> {
    let raw = ["audio_base64", "audio", "audio_data"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str).filter(|v| !v.is_empty()))?;

    let mut content_type = payload
        .get("content_type")
        .or_else(|| payload.get("mime_type"))
        .or_else(|| payload.get("format"))
        .and_then(Value::as_str)
        .unwrap_or("audio/wav")
        .to_string();

    let data = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, b64) = rest.split_once(',')?;
            if let Some(mime) = header.split(';').next().filter(|m| !m.is_empty()) {
                content_type = mime.to_string();
            }
            b64
        }
        None => raw,
    };

    let audio = base64::engine::general_purpose::STANDARD.decode(data.trim()).ok()?;
    Some((audio, content_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use axum::{
        http::Request,
        middleware,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, method, path as urlpath};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx_with(configure: impl FnOnce(&mut Settings)) -> Arc<GatewayContext> {
        let dir = tempfile::tempdir().unwrap().keep();
        let mut s = Settings::default();
        s.gateway_bearer_token = "tok".into();
        s.images_dir = dir.to_string_lossy().into_owned();
        // Registry entries for the media classes so capability checks pass.
        let registry_file = dir.join("backends.toml");
        std::fs::write(
            &registry_file,
            r#"
            [backends.gpu_heavy]
            base_url = ""
            supported_capabilities = ["images"]
            [backends.gpu_heavy.concurrency_limits]
            images = 2

            [backends.heartmula_music]
            base_url = "${HEARTMULA_BASE_URL}"
            supported_capabilities = ["music"]

            [backends.pocket_tts]
            base_url = "${TTS_BASE_URL}"
            supported_capabilities = ["tts"]
            "#,
        )
        .unwrap();
        s.backends_config_path = registry_file.to_string_lossy().into_owned();
        configure(&mut s);
        GatewayContext::new(s)
    }

    fn app(ctx: Arc<GatewayContext>) -> Router {
        Router::new()
            .route("/v1/images/generations", post(images_generations))
            .route("/v1/images/files/{name}", get(serve_image_file))
            .route("/v1/music/generations", post(music_generations))
            .route("/v1/tts/generations", post(tts_generations))
            .route("/v1/audio/speech", post(tts_generations))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&ctx),
                super::super::auth::auth_middleware,
            ))
            .with_state(ctx)
    }

    async fn post_json(ctx: Arc<GatewayContext>, uri: &str, body: Value) -> (u16, Response) {
        let resp = app(ctx)
            .oneshot(
                Request::post(uri)
                    .header("authorization", "Bearer tok")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        (resp.status().as_u16(), resp)
    }

    async fn json_of(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn size_parsing_enforces_wxh() {
        assert_eq!(parse_size("512x512").unwrap(), (512, 512));
        assert!(parse_size("512").is_err());
        assert!(parse_size("0x512").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn timeout_scales_with_duration() {
        assert_eq!(scale_timeout(60.0, &json!({})), 60.0);
        assert_eq!(scale_timeout(60.0, &json!({ "duration": 30 })), 180.0);
        // Short durations never shrink the floor.
        assert_eq!(scale_timeout(120.0, &json!({ "duration": 2 })), 120.0);
    }

    #[tokio::test]
    async fn images_validate_prompt_n_and_size() {
        let ctx = ctx_with(|_| {});
        let (status, _) = post_json(Arc::clone(&ctx), "/v1/images/generations", json!({})).await;
        assert_eq!(status, 400);

        let (status, _) = post_json(
            Arc::clone(&ctx),
            "/v1/images/generations",
            json!({ "prompt": "cat", "n": 9 }),
        )
        .await;
        assert_eq!(status, 400);

        let (status, _) = post_json(
            ctx,
            "/v1/images/generations",
            json!({ "prompt": "cat", "size": "99999x99999" }),
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn images_default_url_format_stores_and_serves_files() {
        let ctx = ctx_with(|_| {});
        let (status, resp) = post_json(
            Arc::clone(&ctx),
            "/v1/images/generations",
            json!({ "prompt": "a quiet harbour", "n": 2, "size": "256x256" }),
        )
        .await;
        assert_eq!(status, 200);
        let body = json_of(resp).await;
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        for item in data {
            assert!(item.get("b64_json").is_none(), "b64 must be replaced by url");
            let url = item["url"].as_str().unwrap();
            assert!(url.starts_with("/v1/images/files/"));

            // The stored file is served back.
            let resp = app(Arc::clone(&ctx))
                .oneshot(
                    Request::get(url)
                        .header("authorization", "Bearer tok")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 200);
            assert_eq!(resp.headers().get("content-type").unwrap(), "image/svg+xml");
        }
    }

    #[tokio::test]
    async fn images_b64_format_returns_inline_payload() {
        let ctx = ctx_with(|_| {});
        let (status, resp) = post_json(
            ctx,
            "/v1/images/generations",
            json!({ "prompt": "x", "response_format": "b64_json" }),
        )
        .await;
        assert_eq!(status, 200);
        let body = json_of(resp).await;
        assert!(body["data"][0]["b64_json"].is_string());
    }

    #[tokio::test]
    async fn image_file_names_with_path_structure_are_rejected() {
        let ctx = ctx_with(|_| {});
        let resp = app(ctx)
            .oneshot(
                Request::get("/v1/images/files/..%2Fsecrets.png")
                    .header("authorization", "Bearer tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn music_normalises_and_proxies_with_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(urlpath("/v1/music/generations"))
            .and(body_partial_json(json!({ "prompt": "calm piano", "tags": "calm,piano" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "audio_url": "/audio/x.wav" })))
            .mount(&server)
            .await;

        let ctx = ctx_with(|s| s.heartmula_base_url = server.uri());
        let (status, resp) = post_json(
            ctx,
            "/v1/music/generations",
            json!({ "input": "calm piano", "tags": ["calm", "piano"], "duration": 8 }),
        )
        .await;
        assert_eq!(status, 200);
        let body = json_of(resp).await;
        assert_eq!(body["audio_url"], "/audio/x.wav");
        assert_eq!(body["_gateway"]["backend_class"], "heartmula_music");
        assert!(body["_gateway"]["upstream_latency_ms"].is_number());
    }

    #[tokio::test]
    async fn music_without_configured_backend_is_not_ready() {
        let ctx = ctx_with(|_| {});
        let (status, resp) =
            post_json(ctx, "/v1/music/generations", json!({ "prompt": "x" })).await;
        assert_eq!(status, 503);
        let body = json_of(resp).await;
        assert_eq!(body["error"], "backend_not_ready");
    }

    #[tokio::test]
    async fn tts_decodes_base64_json_audio() {
        let server = MockServer::start().await;
        let audio = base64::engine::general_purpose::STANDARD.encode(b"RIFFdata");
        Mock::given(method("POST"))
            .and(urlpath("/v1/audio/speech"))
            .and(body_partial_json(json!({ "text": "hello", "input": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "audio_base64": audio,
                "content_type": "audio/wav",
            })))
            .mount(&server)
            .await;

        let ctx = ctx_with(|s| s.tts_base_url = server.uri());
        let (status, resp) =
            post_json(ctx, "/v1/audio/speech", json!({ "input": "hello", "speed": 9.0 })).await;
        assert_eq!(status, 200);
        assert_eq!(resp.headers().get("content-type").unwrap(), "audio/wav");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"RIFFdata");
    }

    #[tokio::test]
    async fn tts_passes_raw_audio_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(urlpath("/v1/audio/speech"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"OggSbytes".to_vec(), "audio/ogg"),
            )
            .mount(&server)
            .await;

        let ctx = ctx_with(|s| s.tts_base_url = server.uri());
        let (status, resp) =
            post_json(ctx, "/v1/tts/generations", json!({ "text": "hi" })).await;
        assert_eq!(status, 200);
        assert_eq!(resp.headers().get("content-type").unwrap(), "audio/ogg");
    }

    #[tokio::test]
    async fn tts_upstream_error_maps_to_502() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(urlpath("/v1/audio/speech"))
            .respond_with(ResponseTemplate::new(500).set_body_string("engine down"))
            .mount(&server)
            .await;

        let ctx = ctx_with(|s| s.tts_base_url = server.uri());
        let (status, resp) = post_json(ctx, "/v1/audio/speech", json!({ "text": "hi" })).await;
        assert_eq!(status, 502);
        let body = json_of(resp).await;
        assert_eq!(body["error"], "upstream_error");
    }

    #[test]
    fn audio_decoding_handles_data_urls() {
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"pcm");
        let (audio, ct) =
            decode_audio_from_json(&json!({ "audio": format!("data:audio/mp3;base64,{b64}") }))
                .unwrap();
        assert_eq!(audio, b"pcm");
        assert_eq!(ct, "audio/mp3");

        assert!(decode_audio_from_json(&json!({ "status": "pending" })).is_none());
    }
}
