//! Bounded agent runtime.
//!
//! Drives a deterministic PLAN → ACT → TOOL → OBSERVE loop against a single
//! backend. The route is decided once per run and locked for its duration;
//! tool access is the intersection of the agent's tier capability set and its
//! spec allowlist; and every run is bounded three ways — turns, wall time,
//! and cumulative tool I/O bytes. The full transcript (strictly ordered
//! events) is persisted on completion and can be fetched back by run id.
//!
//! Admission here is deliberately different from the request-plane
//! controller: agent runs may wait, but the wait is bounded by a queue
//! ceiling (`agent_queue_max` waiters) and a timeout, and tier>=1 agents are
//! refused outright while `agent_shed_heavy` is set.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{
    aliases::AliasTable,
    canonical::{canonical_json, sha256_hex, strip_nulls},
    error::GatewayError,
    ids::{new_id, now_unix},
    router::{decide_route, RouteHints, RouterConfig},
    settings::{Backend, RunLogMode, Settings},
    tools::{append_ndjson_line, scan_ndjson_for, write_json_file_atomic, ToolBus},
    upstream::{assistant_message, tool_calls, ChatCompletionRequest, ChatMessage, UpstreamAdapter},
};

/// Fixed system prompt prepended to every PLAN step. Deterministic by design.
const PLAN_SYSTEM_PROMPT: &str = "Follow a strict loop: PLAN -> ACT -> OBSERVE -> TERMINATE. \
     Use tools only when they are necessary. Do not exceed the caller's budgets. Be concise.";

/// One agent definition, loaded from the specs file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Routing name (usually an alias like `fast` or `coder`).
    pub model: String,
    #[serde(default)]
    pub tier: u8,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_runtime_sec")]
    pub max_runtime_sec: Option<f64>,
    #[serde(default = "default_max_tool_io")]
    pub max_total_tool_io_bytes: Option<u64>,
    #[serde(default)]
    pub tools_allowlist: Option<Vec<String>>,
}

fn default_max_turns() -> u32 {
    8
}
fn default_max_runtime_sec() -> Option<f64> {
    Some(60.0)
}
fn default_max_tool_io() -> Option<u64> {
    Some(2_000_000)
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            model: "fast".into(),
            tier: 0,
            max_turns: default_max_turns(),
            max_runtime_sec: default_max_runtime_sec(),
            max_total_tool_io_bytes: default_max_tool_io(),
            tools_allowlist: None,
        }
    }
}

/// Body of `POST /v1/agent/run`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRunRequest {
    #[serde(default = "default_agent_name")]
    pub agent: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
}

fn default_agent_name() -> String {
    "default".into()
}

/// Tool capability buckets. Monotonic: every tier includes the ones below.
pub fn tools_for_tier(tier: u8) -> HashSet<String> {
    let mut set: HashSet<String> =
        ["noop", "read_file", "http_fetch_local"].map(String::from).into();
    if tier >= 1 {
        set.insert("write_file".into());
        set.insert("http_fetch".into());
    }
    if tier >= 2 {
        set.insert("shell".into());
        set.insert("git".into());
    }
    set
}

/// Load agent specs from the configured JSON file (`{name: spec, …}`).
/// Missing or unreadable file yields the single built-in default spec.
pub fn load_agent_specs(settings: &Settings) -> HashMap<String, AgentSpec> {
    let path = settings.agent_specs_path.trim();
    if !path.is_empty() {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(parsed) = serde_json::from_str::<HashMap<String, AgentSpec>>(&raw) {
                let out: HashMap<String, AgentSpec> = parsed
                    .into_iter()
                    .filter(|(k, _)| !k.trim().is_empty())
                    .collect();
                if !out.is_empty() {
                    return out;
                }
            }
        }
    }
    HashMap::from([("default".to_string(), AgentSpec::default())])
}

/// Queue-bounded per-backend admission for agent runs.
struct AgentAdmission {
    semaphores: HashMap<Backend, Arc<Semaphore>>,
    waiters: Mutex<HashMap<Backend, u32>>,
}

impl AgentAdmission {
    fn new(settings: &Settings) -> Self {
        let semaphores = HashMap::from([
            (
                Backend::Ollama,
                Arc::new(Semaphore::new(settings.agent_backend_concurrency_ollama.max(1) as usize)),
            ),
            (
                Backend::Mlx,
                Arc::new(Semaphore::new(settings.agent_backend_concurrency_mlx.max(1) as usize)),
            ),
        ]);
        Self { semaphores, waiters: Mutex::new(HashMap::new()) }
    }

    async fn acquire(
        &self,
        backend: Backend,
        tier: u8,
        settings: &Settings,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, GatewayError> {
        if settings.agent_shed_heavy && tier >= 1 {
            return Err(GatewayError::RateLimited {
                error: "shed_heavy".into(),
                message: "heavy agents refused (shed heavy mode)".into(),
            });
        }

        {
            let mut waiters = self.waiters.lock().expect("agent waiters poisoned");
            let count = waiters.entry(backend).or_insert(0);
            if *count >= settings.agent_queue_max {
                return Err(GatewayError::RateLimited {
                    error: "queue_full".into(),
                    message: "agent queue full".into(),
                });
            }
            *count += 1;
        }

        let sem = Arc::clone(self.semaphores.get(&backend).expect("backend semaphore"));
        let timeout = Duration::from_secs_f64(settings.agent_queue_timeout_sec.max(0.0));
        let acquired = tokio::time::timeout(timeout, sem.acquire_owned()).await;

        {
            let mut waiters = self.waiters.lock().expect("agent waiters poisoned");
            if let Some(count) = waiters.get_mut(&backend) {
                *count = count.saturating_sub(1);
            }
        }

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(anyhow::anyhow!("agent semaphore closed").into()),
            Err(_) => Err(GatewayError::RateLimited {
                error: "queue_timeout".into(),
                message: "agent queue timeout".into(),
            }),
        }
    }
}

/// How a bounded run ended, when it did not complete normally.
enum RunFailure {
    /// Runtime or turn budget exceeded → 408.
    Timeout(String),
    /// Cumulative tool I/O over budget → 413.
    TooLarge(String),
    /// Upstream or tool-plumbing failure; reported in the payload only.
    Soft(String),
}

/// Outcome of a run that produced a transcript. Pre-run refusals (unknown
/// agent, shed, queue) surface as plain [`GatewayError`]s instead.
#[derive(Debug)]
pub struct AgentRunOutcome {
    pub payload: Value,
    pub backend: Backend,
    pub upstream_model: String,
    /// HTTP status override for budget failures (408/413).
    pub failure_status: Option<GatewayError>,
}

/// The agent runtime. One per process.
pub struct AgentRuntime {
    settings: Arc<Settings>,
    router_cfg: RouterConfig,
    aliases: Arc<AliasTable>,
    tool_bus: Arc<ToolBus>,
    specs: HashMap<String, AgentSpec>,
    admission: AgentAdmission,
}

impl AgentRuntime {
    pub fn new(settings: Arc<Settings>, aliases: Arc<AliasTable>, tool_bus: Arc<ToolBus>) -> Self {
        let router_cfg = RouterConfig::from_settings(&settings);
        let specs = load_agent_specs(&settings);
        let admission = AgentAdmission::new(&settings);
        Self { settings, router_cfg, aliases, tool_bus, specs, admission }
    }

    /// Execute one bounded run end to end.
    pub async fn run(
        &self,
        run_req: AgentRunRequest,
        hints: &RouteHints,
    ) -> Result<AgentRunOutcome, GatewayError> {
        let spec = self
            .specs
            .get(&run_req.agent)
            .or_else(|| self.specs.get("default"))
            .ok_or_else(|| GatewayError::InvalidRequest("unknown agent".into()))?
            .clone();
        let tier = spec.tier;

        if spec.max_turns == 0 {
            return Err(GatewayError::InvalidRequest("agent max_turns must be > 0".into()));
        }

        let mut messages: Vec<ChatMessage> = match &run_req.messages {
            Some(msgs) => msgs.clone(),
            None => {
                let input = run_req
                    .input
                    .as_deref()
                    .map(str::trim)
                    .filter(|i| !i.is_empty())
                    .ok_or_else(|| {
                        GatewayError::InvalidRequest(
                            "input must be a non-empty string (or provide messages)".into(),
                        )
                    })?;
                vec![ChatMessage::user(input)]
            }
        };

        // Effective tools: tier capability set, narrowed by the spec allowlist.
        let mut allowed = tools_for_tier(tier);
        if let Some(allowlist) = &spec.tools_allowlist {
            let wanted: HashSet<String> = allowlist
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            allowed.retain(|t| wanted.contains(t));
        }
        let mut allowed_sorted: Vec<String> = allowed.iter().cloned().collect();
        allowed_sorted.sort();
        let tool_specs = self.tool_bus.tool_specs(&allowed_sorted);
        let tools_value =
            if tool_specs.is_empty() { None } else { Some(Value::Array(tool_specs)) };

        // Route once; the backend/model pair is locked for the whole run.
        let route = decide_route(
            &self.router_cfg,
            &self.aliases,
            &spec.model,
            hints,
            &messages
                .iter()
                .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
                .collect::<Vec<_>>(),
            tools_value.is_some(),
        );
        let backend = route.backend;
        let upstream_model = route.model;
        let adapter = UpstreamAdapter::for_backend(backend, &self.settings);

        let _permit = self.admission.acquire(backend, tier, &self.settings).await?;

        let started = Instant::now();
        let run_id = new_id("run");
        let request_hash = sha256_hex(&canonical_json(&strip_nulls(json!({
            "agent": run_req.agent,
            "spec": spec,
            "messages": messages,
            "backend": backend.as_str(),
            "upstream_model": upstream_model,
        }))));

        let mut events: Vec<Value> = Vec::new();
        events.push(json!({
            "ts": now_unix(),
            "type": "run_started",
            "run_id": run_id,
            "request_hash": request_hash,
            "agent": run_req.agent,
            "tier": tier,
            "backend": backend.as_str(),
            "upstream_model": upstream_model,
            "max_turns": spec.max_turns,
        }));

        let mut output_text = String::new();
        let mut total_tool_io: u64 = 0;
        let mut failure: Option<RunFailure> = None;
        let mut completed = false;

        let over_runtime = |started: &Instant| -> bool {
            spec.max_runtime_sec
                .map(|limit| started.elapsed().as_secs_f64() > limit)
                .unwrap_or(false)
        };

        'turns: for turn in 0..spec.max_turns {
            if over_runtime(&started) {
                failure = Some(RunFailure::Timeout("agent runtime budget exceeded".into()));
                break;
            }

            // PLAN: no tools, fixed system prompt prepended.
            let mut plan_messages = vec![ChatMessage::system(PLAN_SYSTEM_PROMPT)];
            plan_messages.extend(messages.iter().cloned());
            let plan_req = ChatCompletionRequest {
                model: upstream_model.clone(),
                messages: plan_messages,
                tools: None,
                tool_choice: None,
                temperature: None,
                max_tokens: None,
                stream: Some(false),
            };
            let plan_resp = match adapter.call(&plan_req).await {
                Ok(resp) => resp,
                Err(e) => {
                    failure = Some(RunFailure::Soft(e.to_string()));
                    break;
                }
            };
            let plan_msg = assistant_message(&plan_resp);
            events.push(json!({
                "ts": now_unix(),
                "type": "plan",
                "turn": turn,
                "message": plan_msg,
            }));
            messages.push(plan_msg);

            // ACT: tools enabled.
            let action_req = ChatCompletionRequest {
                model: upstream_model.clone(),
                messages: messages.clone(),
                tools: tools_value.clone(),
                tool_choice: None,
                temperature: None,
                max_tokens: None,
                stream: Some(false),
            };
            let action_resp = match adapter.call(&action_req).await {
                Ok(resp) => resp,
                Err(e) => {
                    failure = Some(RunFailure::Soft(e.to_string()));
                    break;
                }
            };
            let action_msg = assistant_message(&action_resp);
            events.push(json!({
                "ts": now_unix(),
                "type": "assistant",
                "turn": turn,
                "message": action_msg,
            }));
            let calls = tool_calls(&action_resp);
            messages.push(action_msg.clone());

            if calls.is_empty() {
                output_text = action_msg.text().unwrap_or("").to_string();
                completed = true;
                break;
            }

            for call in calls {
                let function = call.get("function").cloned().unwrap_or(json!({}));
                let Some(name) =
                    function.get("name").and_then(Value::as_str).filter(|n| !n.trim().is_empty())
                else {
                    failure = Some(RunFailure::Soft("invalid tool call from model".into()));
                    break 'turns;
                };
                let arguments = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let tool_call_id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|i| !i.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| new_id("toolcall"));

                if over_runtime(&started) {
                    failure = Some(RunFailure::Timeout("agent runtime budget exceeded".into()));
                    break 'turns;
                }

                let result =
                    self.tool_bus.run_tool_call(name.trim(), &arguments, &allowed).await;
                if let Some(io) = result.get("tool_io_bytes").and_then(Value::as_u64) {
                    total_tool_io += io;
                }

                events.push(json!({
                    "ts": now_unix(),
                    "type": "tool",
                    "turn": turn,
                    "tool_call_id": tool_call_id,
                    "name": name.trim(),
                    "result": result,
                }));

                if let Some(limit) = spec.max_total_tool_io_bytes {
                    if total_tool_io > limit {
                        failure = Some(RunFailure::TooLarge("tool IO budget exceeded".into()));
                        break 'turns;
                    }
                }

                messages.push(ChatMessage {
                    role: "tool".into(),
                    content: Some(Value::String(canonical_json(&result))),
                    tool_call_id: Some(tool_call_id),
                    ..Default::default()
                });
            }
        }

        if !completed && failure.is_none() {
            failure = Some(RunFailure::Timeout("agent turn limit exceeded".into()));
        }

        let (ok, error_text) = match &failure {
            None => (true, None),
            Some(RunFailure::Timeout(msg) | RunFailure::TooLarge(msg) | RunFailure::Soft(msg)) => {
                (false, Some(msg.clone()))
            }
        };

        events.push(json!({
            "ts": now_unix(),
            "type": if ok { "run_completed" } else { "run_failed" },
            "run_id": run_id,
            "ok": ok,
            "output_text": output_text,
            "error": error_text,
            "total_tool_io_bytes": total_tool_io,
            "duration_ms": (started.elapsed().as_secs_f64() * 1_000.0 * 10.0).round() / 10.0,
        }));

        let payload = strip_nulls(json!({
            "run_id": run_id,
            "request_hash": request_hash,
            "agent": run_req.agent,
            "tier": tier,
            "backend": backend.as_str(),
            "upstream_model": upstream_model,
            "ok": ok,
            "output_text": output_text,
            "error": error_text,
            "events": events,
        }));

        if let Err(e) = self.persist(&run_id, &payload) {
            warn!(run_id = %run_id, error = %e, "agent run persistence failed");
        }

        let failure_status = match failure {
            Some(RunFailure::Timeout(msg)) => Some(GatewayError::Timeout(msg)),
            Some(RunFailure::TooLarge(msg)) => Some(GatewayError::RequestTooLarge(msg)),
            _ => None,
        };

        Ok(AgentRunOutcome { payload, backend, upstream_model, failure_status })
    }

    fn persist(&self, run_id: &str, payload: &Value) -> anyhow::Result<()> {
        let mode = self.settings.agent_runs_log_mode;
        if matches!(mode, RunLogMode::Ndjson | RunLogMode::Both) {
            append_ndjson_line(Path::new(&self.settings.agent_runs_log_path), payload)?;
        }
        if matches!(mode, RunLogMode::PerRun | RunLogMode::Both) {
            write_json_file_atomic(Path::new(&self.settings.agent_runs_log_dir), run_id, payload)?;
        }
        Ok(())
    }

    /// Fetch a persisted transcript by run id. Prefers the per-run file and
    /// falls back to scanning the NDJSON log.
    pub fn load_transcript(&self, run_id: &str) -> Result<Value, GatewayError> {
        let rid = run_id.trim();
        if rid.is_empty() {
            return Err(GatewayError::InvalidRequest("run_id must be a non-empty string".into()));
        }

        let per_run = Path::new(&self.settings.agent_runs_log_dir).join(format!("{rid}.json"));
        if let Ok(raw) = std::fs::read_to_string(&per_run) {
            if let Ok(payload) = serde_json::from_str::<Value>(&raw) {
                return Ok(payload);
            }
        }

        if let Some(payload) =
            scan_ndjson_for(Path::new(&self.settings.agent_runs_log_path), "run_id", rid)
        {
            return Ok(payload);
        }

        Err(GatewayError::ReplayNotFound(rid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn assistant_response(content: &str) -> Value {
        json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    fn tool_call_response() -> Value {
        json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "noop", "arguments": "{\"text\":\"probe\"}" },
                }],
            }}]
        })
    }

    /// Runtime wired to a mock MLX server via the `fast` alias.
    fn runtime_for(server_uri: &str, specs_json: Option<&str>, tmp: &Path) -> AgentRuntime {
        let mut settings = Settings::default();
        settings.gateway_bearer_token = "t".into();
        settings.mlx_base_url = server_uri.to_string();
        settings.default_backend = Backend::Mlx;
        settings.agent_shed_heavy = false;
        settings.agent_runs_log_mode = RunLogMode::Both;
        settings.agent_runs_log_dir = tmp.join("agent").to_string_lossy().into_owned();
        settings.agent_runs_log_path =
            tmp.join("agent/runs.ndjson").to_string_lossy().into_owned();
        settings.tools_log_path = tmp.join("tools/inv.ndjson").to_string_lossy().into_owned();
        settings.tools_log_dir = tmp.join("tools").to_string_lossy().into_owned();
        if let Some(specs) = specs_json {
            let spec_path = tmp.join("agent_specs.json");
            std::fs::write(&spec_path, specs).unwrap();
            settings.agent_specs_path = spec_path.to_string_lossy().into_owned();
        }

        let settings = Arc::new(settings);
        let aliases = Arc::new(AliasTable::load(&settings));
        let metrics = Arc::new(Metrics::new(true));
        let tool_bus = Arc::new(ToolBus::new(Arc::clone(&settings), metrics));
        AgentRuntime::new(settings, aliases, tool_bus)
    }

    fn run_request(input: &str) -> AgentRunRequest {
        AgentRunRequest { agent: "default".into(), input: Some(input.into()), messages: None }
    }

    #[test]
    fn tiers_are_monotonic() {
        let t0 = tools_for_tier(0);
        let t1 = tools_for_tier(1);
        let t2 = tools_for_tier(2);
        assert!(t0.is_subset(&t1));
        assert!(t1.is_subset(&t2));
        assert!(t0.contains("noop"));
        assert!(!t0.contains("write_file"));
        assert!(t1.contains("write_file"));
        assert!(!t1.contains("shell"));
        assert!(t2.contains("shell"));
    }

    #[test]
    fn missing_specs_file_yields_default() {
        let specs = load_agent_specs(&Settings::default());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs["default"].model, "fast");
        assert_eq!(specs["default"].max_turns, 8);
    }

    #[tokio::test]
    async fn single_turn_run_completes_with_transcript() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(assistant_response("one")))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime_for(
            &server.uri(),
            Some(r#"{"default":{"model":"fast","tier":0,"max_turns":1}}"#),
            tmp.path(),
        );

        let outcome = rt.run(run_request("say one word"), &RouteHints::default()).await.unwrap();
        assert!(outcome.failure_status.is_none());
        let p = &outcome.payload;
        assert_eq!(p["ok"], true);
        assert_eq!(p["output_text"], "one");

        let types: Vec<&str> = p["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["run_started", "plan", "assistant", "run_completed"]);
    }

    #[tokio::test]
    async fn tool_calls_are_executed_and_observed() {
        let server = MockServer::start().await;
        // After a tool result is in the conversation, the model finishes.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\\\"replay_id\\\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(assistant_response("done")))
            .with_priority(1)
            .mount(&server)
            .await;
        // ACT requests (tools present) ask for the noop tool.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"tools\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response()))
            .with_priority(2)
            .mount(&server)
            .await;
        // PLAN requests get a plain narration.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(assistant_response("planning")))
            .with_priority(3)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime_for(
            &server.uri(),
            Some(r#"{"default":{"model":"fast","tier":0,"max_turns":3}}"#),
            tmp.path(),
        );

        let outcome = rt.run(run_request("probe the noop tool"), &RouteHints::default()).await.unwrap();
        let p = &outcome.payload;
        assert_eq!(p["ok"], true, "payload: {p}");
        assert_eq!(p["output_text"], "done");

        let events = p["events"].as_array().unwrap();
        let tool_events: Vec<&Value> =
            events.iter().filter(|e| e["type"] == "tool").collect();
        assert_eq!(tool_events.len(), 1);
        assert_eq!(tool_events[0]["name"], "noop");
        assert_eq!(tool_events[0]["result"]["ok"], true);
        assert_eq!(tool_events[0]["result"]["text"], "probe");
    }

    #[tokio::test]
    async fn turn_limit_maps_to_timeout() {
        let server = MockServer::start().await;
        // The model asks for a tool every single turn; the run never converges.
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"tools\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response()))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(assistant_response("planning")))
            .with_priority(2)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime_for(
            &server.uri(),
            Some(r#"{"default":{"model":"fast","tier":0,"max_turns":2}}"#),
            tmp.path(),
        );

        let outcome = rt.run(run_request("loop forever"), &RouteHints::default()).await.unwrap();
        let p = &outcome.payload;
        assert_eq!(p["ok"], false);
        assert!(p["error"].as_str().unwrap().contains("turn limit"));
        match outcome.failure_status {
            Some(GatewayError::Timeout(_)) => {}
            other => panic!("expected timeout failure, got {other:?}"),
        }

        // At most max_turns plan and assistant events.
        let events = p["events"].as_array().unwrap();
        let plans = events.iter().filter(|e| e["type"] == "plan").count();
        let assistants = events.iter().filter(|e| e["type"] == "assistant").count();
        assert!(plans <= 2);
        assert!(assistants <= 2);
        assert_eq!(events.last().unwrap()["type"], "run_failed");
    }

    #[tokio::test]
    async fn tool_io_budget_maps_to_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("\"tools\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_response()))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(assistant_response("planning")))
            .with_priority(2)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime_for(
            &server.uri(),
            Some(r#"{"default":{"model":"fast","tier":0,"max_turns":4,"max_total_tool_io_bytes":0}}"#),
            tmp.path(),
        );

        let outcome = rt.run(run_request("probe"), &RouteHints::default()).await.unwrap();
        assert_eq!(outcome.payload["ok"], false);
        match outcome.failure_status {
            Some(GatewayError::RequestTooLarge(_)) => {}
            other => panic!("expected too-large failure, got {other:?}"),
        }
        assert_eq!(outcome.payload["events"].as_array().unwrap().last().unwrap()["type"], "run_failed");
    }

    #[tokio::test]
    async fn shed_heavy_refuses_tier_one_agents() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let mut rt = runtime_for(
            &server.uri(),
            Some(r#"{"heavy":{"model":"fast","tier":1,"max_turns":1}}"#),
            tmp.path(),
        );
        // Flip shedding on for this runtime.
        let mut settings = (*rt.settings).clone();
        settings.agent_shed_heavy = true;
        rt.settings = Arc::new(settings);

        let req =
            AgentRunRequest { agent: "heavy".into(), input: Some("x".into()), messages: None };
        let err = rt.run(req, &RouteHints::default()).await.unwrap_err();
        match err {
            GatewayError::RateLimited { error, .. } => assert_eq!(error, "shed_heavy"),
            other => panic!("expected shed refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_input_is_invalid() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime_for(&server.uri(), None, tmp.path());
        let req = AgentRunRequest { agent: "default".into(), input: Some("  ".into()), messages: None };
        assert_eq!(
            rt.run(req, &RouteHints::default()).await.unwrap_err().kind(),
            "invalid_request"
        );
    }

    #[tokio::test]
    async fn transcript_replay_round_trips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(assistant_response("ok")))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let rt = runtime_for(
            &server.uri(),
            Some(r#"{"default":{"model":"fast","tier":0,"max_turns":1}}"#),
            tmp.path(),
        );

        let outcome = rt.run(run_request("hello"), &RouteHints::default()).await.unwrap();
        let run_id = outcome.payload["run_id"].as_str().unwrap();

        let transcript = rt.load_transcript(run_id).expect("transcript persisted");
        assert_eq!(transcript["run_id"], outcome.payload["run_id"]);
        assert_eq!(transcript["request_hash"], outcome.payload["request_hash"]);

        assert_eq!(rt.load_transcript("run-missing").unwrap_err().kind(), "replay_not_found");
    }
}
