//! Backend health and readiness checking.
//!
//! A background task probes every registered backend on a fixed interval:
//! liveness first (`health_liveness`, default `/healthz`), then readiness
//! (`health_readiness`, default `/readyz`) only when live. Results land in a
//! status map consulted by the request-plane pre-flight. Backends that have
//! never been probed are optimistically treated as ready, so a cold gateway
//! does not refuse traffic while the first probe round is in flight.
//!
//! Probes run concurrently across backends with a per-request timeout; a
//! failing probe records its error and never stalls the loop.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::{
    error::GatewayError,
    ids::now_unix,
    registry::{BackendConfig, BackendRegistry, Capability},
};

/// Probe result for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub backend_class: String,
    pub healthy: bool,
    pub ready: bool,
    pub last_check_unix: i64,
    pub error: Option<String>,
}

/// Periodically checks backend health and caches the latest status.
pub struct HealthChecker {
    registry: Arc<BackendRegistry>,
    client: reqwest::Client,
    check_interval: Duration,
    status: Mutex<HashMap<String, HealthStatus>>,
}

impl HealthChecker {
    /// Default probe cadence.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    /// Default per-probe timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(registry: Arc<BackendRegistry>, check_interval: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build health-check client");
        Self { registry, client, check_interval, status: Mutex::new(HashMap::new()) }
    }

    pub fn with_defaults(registry: Arc<BackendRegistry>) -> Self {
        Self::new(registry, Self::DEFAULT_INTERVAL, Self::DEFAULT_TIMEOUT)
    }

    /// Background loop. Spawn with `tokio::spawn(checker.run())`; exits only
    /// when the process does.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            interval.tick().await;
            self.check_all().await;
        }
    }

    /// One probe round over all backends, concurrently.
    pub async fn check_all(&self) {
        let probes: Vec<_> = self
            .registry
            .iter()
            .map(|(class, cfg)| self.check_backend(class.clone(), cfg.clone()))
            .collect();
        for status in join_all(probes).await {
            if !status.ready {
                warn!(
                    backend = %status.backend_class,
                    healthy = status.healthy,
                    error = status.error.as_deref().unwrap_or(""),
                    "backend not ready"
                );
            }
            self.status
                .lock()
                .expect("health status poisoned")
                .insert(status.backend_class.clone(), status);
        }
    }

    async fn check_backend(&self, backend_class: String, cfg: BackendConfig) -> HealthStatus {
        let base = cfg.base_url.trim_end_matches('/');
        if base.is_empty() || !(base.starts_with("http://") || base.starts_with("https://")) {
            return HealthStatus {
                backend_class,
                healthy: false,
                ready: false,
                last_check_unix: now_unix(),
                error: Some("base_url not configured".into()),
            };
        }

        let mut healthy = false;
        let mut ready = false;
        let mut error = None;

        match self.client.get(format!("{base}{}", cfg.health_liveness)).send().await {
            Ok(resp) => healthy = resp.status().as_u16() == 200,
            Err(e) => error = Some(format!("liveness check failed: {e}")),
        }

        if healthy {
            match self.client.get(format!("{base}{}", cfg.health_readiness)).send().await {
                Ok(resp) => ready = resp.status().as_u16() == 200,
                Err(e) => error = Some(format!("readiness check failed: {e}")),
            }
        }

        HealthStatus { backend_class, healthy, ready, last_check_unix: now_unix(), error }
    }

    /// Latest status for one backend, if any probe has completed.
    pub fn status(&self, backend_class: &str) -> Option<HealthStatus> {
        let canonical = self.registry.resolve_class(backend_class);
        self.status.lock().expect("health status poisoned").get(canonical).cloned()
    }

    /// Snapshot of all probed backends.
    pub fn all_status(&self) -> HashMap<String, HealthStatus> {
        self.status.lock().expect("health status poisoned").clone()
    }

    /// Whether a backend may receive traffic: true before the first probe
    /// (optimistic start) or when the latest probe reports ready.
    pub fn is_ready(&self, backend_class: &str) -> bool {
        self.status(backend_class).map(|s| s.ready).unwrap_or(true)
    }

    /// Request-plane pre-flight. Yields a structured 503 (`Retry-After: 30`)
    /// when the latest probe says the backend is not ready, or a 400 when the
    /// backend class is not configured at all.
    pub fn ensure_ready(
        &self,
        backend_class: &str,
        capability: Capability,
    ) -> Result<(), GatewayError> {
        let Some(cfg) = self.registry.get(backend_class) else {
            return Err(GatewayError::BackendNotFound {
                backend_class: backend_class.to_string(),
                availability: self.registry.capability_availability(capability),
            });
        };

        if self.is_ready(backend_class) {
            return Ok(());
        }

        let status = self.status(backend_class);
        let mut backend = json!({
            "backend_class": cfg.backend_class,
            "base_url": cfg.base_url,
            "host": cfg.host(),
            "description": cfg.description,
        });
        let mut detail = serde_json::Map::new();
        if let Some(s) = &status {
            backend["healthy"] = json!(s.healthy);
            backend["ready"] = json!(s.ready);
            if let Some(err) = &s.error {
                detail.insert("health_error".into(), json!(err));
            }
        }
        detail.insert("backend".into(), backend);
        if let Some(avail) = self.registry.capability_availability(capability).as_object() {
            for (k, v) in avail {
                detail.insert(k.clone(), v.clone());
            }
        }

        Err(GatewayError::BackendNotReady {
            backend_class: backend_class.to_string(),
            detail: serde_json::Value::Object(detail),
        })
    }
}
