use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use tokio::signal;
use tracing::{info, warn};

use inference_gateway::{gateway, observability, GatewayContext, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inference_gateway=info,tower_http=warn".into()),
        )
        .init();

    // Settings: TOML file (optional) + environment overlay.
    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("gateway.toml"));
    let settings = Settings::load(Some(&config_path))
        .with_context(|| format!("failed to load settings (config: {})", config_path.display()))?;

    info!(
        client_port = settings.gateway_port,
        observability_port = settings.observability_port,
        policy = settings.router_enable_policy,
        "inference-gateway starting"
    );

    let observability_enabled = settings.observability_enabled;
    let client_addr: SocketAddr =
        format!("{}:{}", settings.gateway_host, settings.gateway_port).parse()?;
    let observability_addr: SocketAddr =
        format!("{}:{}", settings.observability_host, settings.observability_port).parse()?;

    let ctx = GatewayContext::new(settings);

    // Background readiness probing for every registered backend.
    tokio::spawn(Arc::clone(&ctx.health).run());

    startup_check_models(&ctx).await;

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = gateway::router(Arc::clone(&ctx)).layer(trace_layer());
    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    info!(%client_addr, "client API listening");

    if observability_enabled {
        let observability_app = observability::router(Arc::clone(&ctx)).layer(trace_layer());
        let observability_listener = tokio::net::TcpListener::bind(observability_addr).await?;
        info!(%observability_addr, "observability API listening");

        tokio::select! {
            result = axum::serve(
                client_listener,
                client_app.into_make_service_with_connect_info::<SocketAddr>(),
            ) => {
                result.context("client API server error")?;
            }
            result = axum::serve(observability_listener, observability_app) => {
                result.context("observability API server error")?;
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
        }
    } else {
        tokio::select! {
            result = axum::serve(
                client_listener,
                client_app.into_make_service_with_connect_info::<SocketAddr>(),
            ) => {
                result.context("client API server error")?;
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Non-fatal startup check: warn when an Ollama-backed alias points at a
/// model tag the upstream does not have pulled.
async fn startup_check_models(ctx: &GatewayContext) {
    use inference_gateway::settings::Backend;

    let wanted: Vec<String> = {
        let mut models: Vec<String> = ctx
            .aliases
            .iter()
            .filter(|(_, alias)| alias.backend == Backend::Ollama)
            .map(|(_, alias)| alias.upstream_model.clone())
            .collect();
        models.sort();
        models.dedup();
        models
    };
    if wanted.is_empty() {
        return;
    }

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
    {
        Ok(c) => c,
        Err(_) => return,
    };
    let url = format!("{}/api/tags", ctx.settings.ollama_base_url.trim_end_matches('/'));
    let Ok(resp) = client.get(&url).send().await else {
        // Upstream may still be cold-booting; don't spam logs.
        return;
    };
    if resp.status().as_u16() != 200 {
        info!(status = resp.status().as_u16(), "startup: ollama tag listing unavailable, skipping model check");
        return;
    }
    let Ok(body) = resp.json::<serde_json::Value>().await else { return };

    let present: Vec<&str> = body
        .get("models")
        .and_then(serde_json::Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(serde_json::Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    for model in &wanted {
        if !present.contains(&model.as_str()) {
            warn!(model = %model, "startup: ollama model missing (check aliases or run 'ollama pull {model}')");
        }
    }
}
