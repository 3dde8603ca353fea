//! Gateway context — the owner of every long-lived component.
//!
//! Built once at startup in dependency order (Settings → Registry → Admission
//! / Health / Aliases → Router config → ToolBus → AgentRuntime) and handed to
//! request handlers as `State<Arc<GatewayContext>>`. There is no service
//! locator and no global mutable state; anything a handler needs hangs off
//! this struct.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Instant,
};

use serde_json::Value;
use tracing::warn;

use crate::{
    admission::AdmissionController,
    agent::AgentRuntime,
    aliases::AliasTable,
    error::GatewayError,
    health::HealthChecker,
    metrics::Metrics,
    registry::{load_registry, BackendRegistry, Capability},
    request_log::RequestLog,
    router::RouterConfig,
    settings::{Backend, Settings},
    tools::ToolBus,
    upstream::UpstreamAdapter,
};

/// Process-wide shared state.
pub struct GatewayContext {
    pub settings: Arc<Settings>,
    pub registry: Arc<BackendRegistry>,
    pub admission: AdmissionController,
    pub health: Arc<HealthChecker>,
    pub aliases: Arc<AliasTable>,
    pub router_cfg: RouterConfig,
    pub tool_bus: Arc<ToolBus>,
    pub agents: AgentRuntime,
    pub metrics: Arc<Metrics>,
    pub request_log: RequestLog,
    pub started_at: Instant,
    bearer_tokens: HashSet<String>,
    token_policies: HashMap<String, Value>,
    token_policies_ok: bool,
}

impl GatewayContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);

        let registry_path = settings.backends_config_path.trim();
        let registry = Arc::new(load_registry(
            (!registry_path.is_empty()).then(|| Path::new(registry_path)),
            &settings,
        ));

        let admission = AdmissionController::new(Arc::clone(&registry));
        let health = Arc::new(HealthChecker::with_defaults(Arc::clone(&registry)));
        let aliases = Arc::new(AliasTable::load(&settings));
        let router_cfg = RouterConfig::from_settings(&settings);
        let metrics = Arc::new(Metrics::new(settings.metrics_enabled));
        let tool_bus = Arc::new(ToolBus::new(Arc::clone(&settings), Arc::clone(&metrics)));
        let agents =
            AgentRuntime::new(Arc::clone(&settings), Arc::clone(&aliases), Arc::clone(&tool_bus));
        let request_log =
            RequestLog::new(settings.request_log_enabled, settings.request_log_path.clone());

        let bearer_tokens: HashSet<String> = settings.bearer_tokens().into_iter().collect();
        let (token_policies, token_policies_ok) =
            parse_token_policies(&settings.gateway_token_policies_json);

        Arc::new(Self {
            settings,
            registry,
            admission,
            health,
            aliases,
            router_cfg,
            tool_bus,
            agents,
            metrics,
            request_log,
            started_at: Instant::now(),
            bearer_tokens,
            token_policies,
            token_policies_ok,
        })
    }

    /// Whether this bearer token is accepted.
    pub fn token_is_valid(&self, token: &str) -> bool {
        self.bearer_tokens.contains(token)
    }

    /// Per-token policy object, when one is configured.
    pub fn token_policy(&self, token: &str) -> Option<&Value> {
        self.token_policies.get(token)
    }

    /// True when the policy JSON was set but malformed (consulted by strict
    /// mode, which then fails requests closed).
    pub fn token_policies_invalid(&self) -> bool {
        !self.token_policies_ok
    }

    /// Build the upstream adapter for a chat backend family.
    pub fn adapter(&self, backend: Backend) -> UpstreamAdapter {
        UpstreamAdapter::for_backend(backend, &self.settings)
    }

    /// Verify a backend class offers a capability, with a helpful
    /// availability listing on refusal.
    pub fn check_capability(
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
        if !cfg.supports(capability) {
            return Err(GatewayError::CapabilityNotSupported {
                backend_class: backend_class.to_string(),
                route_kind: capability.as_str().to_string(),
                availability: self.registry.capability_availability(capability),
            });
        }
        Ok(())
    }

    /// The full pre-flight for a routed request: readiness gate, capability
    /// check, then a non-blocking admission acquire.
    pub fn admit(
        &self,
        backend_class: &str,
        capability: Capability,
    ) -> Result<crate::admission::AdmissionLease, GatewayError> {
        self.health.ensure_ready(backend_class, capability)?;
        self.check_capability(backend_class, capability)?;
        self.admission.acquire(backend_class, capability)
    }
}

/// Parse the per-token policy JSON. Returns `(policies, parse_ok)`; malformed
/// input yields an empty map with `parse_ok == false` so strict deployments
/// can fail closed.
fn parse_token_policies(raw: &str) -> (HashMap<String, Value>, bool) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (HashMap::new(), true);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => {
            let out = map
                .into_iter()
                .filter(|(k, v)| !k.is_empty() && v.is_object())
                .collect();
            (out, true)
        }
        Ok(_) => {
            warn!("token policies JSON must be an object at top level");
            (HashMap::new(), false)
        }
        Err(e) => {
            warn!(error = %e, "token policies JSON unparseable");
            (HashMap::new(), false)
        }
    }
}
