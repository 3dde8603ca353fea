//! Tool bus — validation, execution, logging and replay of tool invocations.
//!
//! Execution is declared-only: a tool must be a builtin or a registry entry
//! to run, and must additionally sit in the caller's effective allowlist
//! (intersection of global configuration and per-token policy). Allowlist
//! misses return the same `unknown_tool` shape whether or not the tool
//! exists — probing reveals nothing.
//!
//! The execute pipeline: allowlist → declaration → schema validation →
//! global concurrency permit (bounded wait) → invoke → normalise →
//! log → respond. Tool failures are not HTTP errors; they come back as
//! `ok: false` envelopes with a normalised `error_type`/`error_message`
//! pair. Every invocation is logged under a freshly minted `replay_id`
//! and can be fetched back verbatim through [`ToolBus::replay`].

pub mod builtin;
pub mod registry;
pub mod schema;
pub mod subprocess;

use std::{
    collections::HashSet,
    io::Write as _,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{
    canonical::{canonical_json, request_hash},
    error::GatewayError,
    ids::{new_id, now_unix},
    metrics::Metrics,
    request_log::round1,
    settings::{Settings, ToolLogMode},
};

use self::registry::ToolRegistry;

/// Per-bearer-token token bucket. Refill is lazy on access.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// A resolved tool declaration: where it came from and how to run it.
struct Declared {
    version: String,
    parameters: Value,
    source: &'static str,
    exec: Option<registry::SubprocessSpec>,
}

/// The tool bus. One per process, owned by the gateway context.
pub struct ToolBus {
    settings: Arc<Settings>,
    registry: ToolRegistry,
    semaphore: Arc<Semaphore>,
    buckets: DashMap<String, Bucket>,
    metrics: Arc<Metrics>,
}

impl ToolBus {
    pub fn new(settings: Arc<Settings>, metrics: Arc<Metrics>) -> Self {
        let registry = ToolRegistry::new(
            settings.tools_registry_path.clone(),
            settings.tools_registry_sha256.clone(),
        );
        let semaphore = Arc::new(Semaphore::new(settings.tools_max_concurrent.max(1)));
        Self { settings, registry, semaphore, buckets: DashMap::new(), metrics }
    }

    // -----------------------------------------------------------------------
    // Allowlists and rate limits
    // -----------------------------------------------------------------------

    /// The tools a caller may execute: an explicit allowlist (per-token
    /// policy first, then global) wins outright; otherwise the set is derived
    /// from capability flags, with `noop` always present for verification.
    pub fn effective_allowlist(&self, policy: Option<&Value>) -> HashSet<String> {
        let policy_str = |key: &str| -> Option<String> {
            policy?.get(key)?.as_str().map(String::from)
        };
        let policy_bool = |key: &str, default: bool| -> bool {
            policy
                .and_then(|p| p.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(default)
        };

        let raw = policy_str("tools_allowlist")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.settings.tools_allowlist.clone());
        if !raw.trim().is_empty() {
            return raw.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect();
        }

        let mut allowed: HashSet<String> = HashSet::from(["noop".to_string()]);
        if policy_bool("tools_allow_shell", self.settings.tools_allow_shell) {
            allowed.insert("shell".into());
        }
        if policy_bool("tools_allow_fs", self.settings.tools_allow_fs) {
            allowed.insert("read_file".into());
            allowed.insert("write_file".into());
        }
        if policy_bool("tools_allow_http_fetch", self.settings.tools_allow_http_fetch) {
            allowed.insert("http_fetch".into());
            allowed.insert("http_fetch_local".into());
        }
        if policy_bool("tools_allow_git", self.settings.tools_allow_git) {
            allowed.insert("git".into());
        }
        if policy_bool("tools_allow_system_info", self.settings.tools_allow_system_info) {
            allowed.insert("system_info".into());
            allowed.insert("models_refresh".into());
        }
        allowed
    }

    /// Token-bucket rate limit for the /v1/tools surface. Disabled unless
    /// both rate and burst are positive (policy overrides settings).
    pub fn check_rate_limit(&self, token: &str, policy: Option<&Value>) -> Result<(), GatewayError> {
        let rps = policy
            .and_then(|p| p.get("tools_rate_limit_rps"))
            .and_then(Value::as_f64)
            .unwrap_or(self.settings.tools_rate_limit_rps);
        let burst = policy
            .and_then(|p| p.get("tools_rate_limit_burst"))
            .and_then(Value::as_u64)
            .unwrap_or(self.settings.tools_rate_limit_burst as u64);
        if rps <= 0.0 || burst == 0 || token.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(token.to_string())
            .or_insert_with(|| Bucket { tokens: burst as f64, last: now });

        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        let tokens = (bucket.tokens + elapsed * rps).min(burst as f64);
        if tokens < 1.0 {
            bucket.tokens = tokens;
            bucket.last = now;
            return Err(GatewayError::rate_limited("rate limited"));
        }
        bucket.tokens = tokens - 1.0;
        bucket.last = now;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    fn resolve_declared(&self, name: &str) -> Option<Declared> {
        if let Some(tool) = self.registry.get(name) {
            return Some(Declared {
                version: tool.version,
                parameters: tool.parameters,
                source: "registry",
                exec: Some(tool.exec),
            });
        }
        let schema = builtin::BUILTIN_SCHEMAS.get(name)?;
        Some(Declared {
            version: schema["version"].as_str().unwrap_or("1").to_string(),
            parameters: schema["parameters"].clone(),
            source: "builtin",
            exec: None,
        })
    }

    /// Listing for `GET /v1/tools`: every allowlisted name, with declared
    /// entries carrying their schema and undeclared ones surfaced explicitly.
    pub fn list(&self, allowed: &HashSet<String>) -> Value {
        let mut names: Vec<&String> = allowed.iter().collect();
        names.sort();

        let mut data = Vec::with_capacity(names.len());
        for name in names {
            match self.resolve_declared(name) {
                Some(declared) => {
                    let description = match declared.source {
                        "registry" => self
                            .registry
                            .get(name)
                            .map(|t| t.description)
                            .unwrap_or_default(),
                        _ => builtin::BUILTIN_SCHEMAS
                            .get(name.as_str())
                            .and_then(|s| s["description"].as_str())
                            .unwrap_or("")
                            .to_string(),
                    };
                    data.push(json!({
                        "name": name,
                        "version": declared.version,
                        "description": description,
                        "parameters": declared.parameters,
                        "declared": true,
                        "source": declared.source,
                    }));
                }
                None => {
                    warn!(tool = %name, "allowlisted but undeclared");
                    data.push(json!({
                        "name": name,
                        "version": "",
                        "description": "(undeclared)",
                        "parameters": { "type": "object" },
                        "declared": false,
                        "source": "missing",
                    }));
                }
            }
        }
        json!({ "object": "list", "data": data })
    }

    /// OpenAI-style tool specs for a set of names, for upstream chat calls.
    pub fn tool_specs(&self, names: &[String]) -> Vec<Value> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let Some(declared) = self.resolve_declared(name) else { continue };
            let description = builtin::BUILTIN_SCHEMAS
                .get(name.as_str())
                .and_then(|s| s["description"].as_str())
                .map(String::from)
                .or_else(|| self.registry.get(name).map(|t| t.description))
                .unwrap_or_default();
            out.push(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": description,
                    "parameters": declared.parameters,
                },
            }));
        }
        out
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// The canonical execute path. Returns the response body (replay id,
    /// hash, timings, and the tool's own fields) or a typed refusal.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        allowed: &HashSet<String>,
    ) -> Result<Value, GatewayError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::InvalidRequest("tool name must be a non-empty string".into()));
        }

        // Fail closed before revealing anything about declarations.
        if !allowed.contains(name) {
            return Err(GatewayError::UnknownTool(name.to_string()));
        }

        let Some(declared) = self.resolve_declared(name) else {
            return Err(GatewayError::UndeclaredTool(name.to_string()));
        };

        if !args.is_object() {
            return Err(GatewayError::InvalidArguments {
                issues: vec!["arguments must be a JSON object".into()],
            });
        }
        let issues = schema::validate(&declared.parameters, &args);
        if !issues.is_empty() {
            return Err(GatewayError::InvalidArguments { issues });
        }

        // Global concurrency gate with a bounded wait.
        let timeout = Duration::from_secs_f64(self.settings.tools_concurrency_timeout_sec.max(0.0));
        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(anyhow::anyhow!("tool semaphore closed").into()),
            Err(_) => return Err(GatewayError::rate_limited("tool capacity exceeded")),
        };

        let req_hash = request_hash(name, &declared.version, &args);
        let replay_id = new_id("tool");
        let ts = now_unix();
        let started = Instant::now();
        let cpu_before = subprocess::children_cpu_ms();

        let mut out = match &declared.exec {
            Some(spec) => subprocess::run(spec, &args, &self.settings).await,
            None => builtin::invoke(name, &args, &self.settings)
                .await
                .unwrap_or_else(|| json!({ "ok": false, "error": "tool implementation missing" })),
        };
        drop(permit);

        normalize_tool_result(&mut out);
        attach_stdout_json(&mut out);
        normalize_tool_error(&mut out);

        let runtime_ms = round1(started.elapsed().as_secs_f64() * 1_000.0);
        let cpu_ms = match (cpu_before, subprocess::children_cpu_ms()) {
            (Some(before), Some(after)) => Some(round1((after - before).max(0.0))),
            _ => None,
        };

        // Prefer the tool's own byte accounting, falling back to capture sizes.
        let io_bytes = match out.as_object_mut().and_then(|o| o.remove("__io_bytes")) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            _ => {
                let stdout = out.get("stdout").and_then(Value::as_str).map(str::len).unwrap_or(0);
                let stderr = out.get("stderr").and_then(Value::as_str).map(str::len).unwrap_or(0);
                (stdout + stderr) as u64
            }
        };

        let ok = out.get("ok").and_then(Value::as_bool).unwrap_or(false);
        let event = json!({
            "ts": ts,
            "replay_id": replay_id,
            "request_hash": req_hash,
            "tool": name,
            "version": declared.version,
            "ok": ok,
            "tool_runtime_ms": runtime_ms,
            "tool_cpu_ms": cpu_ms,
            "tool_io_bytes": io_bytes,
            "args": truncate_value(args, 10_000),
            "result": truncate_value(out.clone(), 20_000),
        });
        if let Err(e) = self.log_event(&replay_id, &event) {
            warn!(replay_id = %replay_id, error = %e, "tool invocation logging failed");
        }
        self.metrics.observe_tool(name, ok, runtime_ms);

        let mut response = json!({
            "replay_id": replay_id,
            "request_hash": req_hash,
            "tool_runtime_ms": runtime_ms,
            "tool_cpu_ms": cpu_ms,
            "tool_io_bytes": io_bytes,
        });
        if let (Some(resp_map), Some(out_map)) = (response.as_object_mut(), out.as_object()) {
            for (k, v) in out_map {
                resp_map.insert(k.clone(), v.clone());
            }
        }
        Ok(response)
    }

    /// Execution seam for model-driven tool calls (chat tool loop, agent
    /// runtime): arguments arrive as a JSON string and every refusal becomes
    /// an `ok: false` envelope instead of an HTTP error.
    pub async fn run_tool_call(
        &self,
        name: &str,
        arguments_json: &str,
        allowed: &HashSet<String>,
    ) -> Value {
        let args: Value = if arguments_json.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments_json) {
                Ok(v) => v,
                Err(_) => {
                    return json!({
                        "ok": false,
                        "error": "tool arguments must be valid JSON",
                        "error_type": "invalid_arguments",
                        "error_message": "tool arguments must be valid JSON",
                    })
                }
            }
        };
        if !args.is_object() {
            return json!({
                "ok": false,
                "error": "tool arguments must be a JSON object",
                "error_type": "invalid_arguments",
                "error_message": "tool arguments must be a JSON object",
            });
        }

        match self.execute(name, args, allowed).await {
            Ok(response) => response,
            Err(err) => {
                let message = err.to_string();
                let mut envelope = json!({
                    "ok": false,
                    "error": message,
                    "error_type": err.kind(),
                    "error_message": message,
                });
                if let GatewayError::InvalidArguments { issues } = &err {
                    envelope["issues"] = json!(issues);
                }
                envelope
            }
        }
    }

    // -----------------------------------------------------------------------
    // Logging and replay
    // -----------------------------------------------------------------------

    fn log_event(&self, replay_id: &str, event: &Value) -> anyhow::Result<()> {
        let mode = self.settings.tools_log_mode;
        if matches!(mode, ToolLogMode::Ndjson | ToolLogMode::Both) {
            append_ndjson_line(Path::new(&self.settings.tools_log_path), event)?;
        }
        if matches!(mode, ToolLogMode::PerInvocation | ToolLogMode::Both) {
            write_json_file_atomic(Path::new(&self.settings.tools_log_dir), replay_id, event)?;
        }
        Ok(())
    }

    /// Fetch a previously logged invocation event. Prefers the per-invocation
    /// file; falls back to scanning the NDJSON log for the last match.
    pub fn replay(&self, replay_id: &str) -> Result<Value, GatewayError> {
        let rid = replay_id.trim();
        if rid.is_empty() {
            return Err(GatewayError::InvalidRequest("replay_id must be a non-empty string".into()));
        }

        let per_invocation = Path::new(&self.settings.tools_log_dir).join(format!("{rid}.json"));
        if let Ok(raw) = std::fs::read_to_string(&per_invocation) {
            if let Ok(event) = serde_json::from_str::<Value>(&raw) {
                return Ok(event);
            }
        }

        if let Some(event) = scan_ndjson_for(Path::new(&self.settings.tools_log_path), "replay_id", rid) {
            return Ok(event);
        }

        Err(GatewayError::ReplayNotFound(rid.to_string()))
    }
}

/// Append one canonical-JSON line. Single-line appends within the pipe buffer
/// are atomic at the OS level, which is the durability story for NDJSON logs.
pub fn append_ndjson_line(path: &Path, event: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(canonical_json(event).as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Write `{dir}/{id}.json` via temp-file-then-rename, so readers never see a
/// partial record.
pub fn write_json_file_atomic(dir: &Path, id: &str, event: &Value) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(canonical_json(event).as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.persist(dir.join(format!("{id}.json")))?;
    Ok(())
}

/// Scan an NDJSON log for the last record whose `key` equals `value`.
pub fn scan_ndjson_for(path: &Path, key: &str, value: &str) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut last = None;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else { continue };
        if obj.get(key).and_then(Value::as_str) == Some(value) {
            last = Some(obj);
        }
    }
    last
}

/// Tool implementations must return an object with a boolean `ok`; anything
/// else is replaced with an invalid-result envelope (bounded, for debugging).
fn normalize_tool_result(out: &mut Value) {
    let ok_is_bool = out.get("ok").map(Value::is_boolean).unwrap_or(false);
    if out.is_object() && ok_is_bool {
        return;
    }
    let preserved = truncate_value(out.clone(), 10_000);
    *out = json!({
        "ok": false,
        "error": "invalid tool result",
        "error_type": "invalid_tool_result",
        "error_message": if out.is_object() {
            "tool result missing boolean 'ok'"
        } else {
            "tool returned a non-object result"
        },
        "result": preserved,
    });
}

/// Expose parsed `stdout_json` for tools that return stdout but did not set
/// the field themselves.
fn attach_stdout_json(out: &mut Value) {
    let Some(map) = out.as_object_mut() else { return };
    if map.contains_key("stdout_json") {
        return;
    }
    let stdout_is_string = map.get("stdout").map(Value::is_string).unwrap_or(false);
    if !stdout_is_string {
        return;
    }
    let parsed = map
        .get("stdout")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str::<Value>(s).ok());
    map.insert("stdout_json".into(), parsed.unwrap_or(Value::Null));
}

/// Ensure failures carry `error_type` and `error_message`, derived from the
/// most specific available signal: explicit error, non-zero exit, stderr,
/// generic fallback.
fn normalize_tool_error(out: &mut Value) {
    let Some(map) = out.as_object_mut() else { return };
    if map.get("ok").and_then(Value::as_bool) == Some(true) {
        return;
    }
    let has = |k: &str| map.get(k).and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);
    if has("error_type") && has("error_message") {
        return;
    }

    if let Some(err) = map.get("error").and_then(Value::as_str).filter(|e| !e.is_empty()) {
        // Errors are often formatted as "TypeName: message".
        let (error_type, error_message) = match err.split_once(": ") {
            Some((head, tail)) if !head.trim().is_empty() => {
                (head.trim().to_string(), tail.trim().to_string())
            }
            _ => ("tool_error".to_string(), err.to_string()),
        };
        map.entry("error_type").or_insert(json!(error_type));
        map.entry("error_message").or_insert(json!(error_message));
        return;
    }

    if let Some(code) = map.get("exit_code").and_then(Value::as_i64).filter(|&c| c != 0) {
        map.entry("error_type").or_insert(json!("subprocess_nonzero_exit"));
        map.entry("error_message").or_insert(json!(format!("exit_code={code}")));
        return;
    }

    if let Some(stderr) =
        map.get("stderr").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
    {
        let stderr = stderr.to_string();
        map.entry("error_type").or_insert(json!("stderr"));
        map.entry("error_message").or_insert(json!(stderr));
        return;
    }

    map.entry("error_type").or_insert(json!("tool_error"));
    map.entry("error_message").or_insert(json!("tool failed"));
}

/// Bound string values for persisted records; non-strings pass through.
pub(crate) fn truncate_value(v: Value, max_chars: usize) -> Value {
    match v {
        Value::String(s) if s.chars().count() > max_chars => {
            let truncated: String = s.chars().take(max_chars).collect();
            Value::String(truncated + "…")
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with(settings: Settings) -> ToolBus {
        ToolBus::new(Arc::new(settings), Arc::new(Metrics::new(true)))
    }

    fn bus_in(dir: &Path) -> ToolBus {
        let mut s = Settings::default();
        s.tools_log_mode = ToolLogMode::Both;
        s.tools_log_path = dir.join("invocations.ndjson").to_string_lossy().into_owned();
        s.tools_log_dir = dir.to_string_lossy().into_owned();
        bus_with(s)
    }

    fn allow(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // Allowlists
    // -----------------------------------------------------------------------

    #[test]
    fn default_allowlist_is_noop_only() {
        let bus = bus_with(Settings::default());
        assert_eq!(bus.effective_allowlist(None), allow(&["noop"]));
    }

    #[test]
    fn capability_flags_expand_the_allowlist() {
        let mut s = Settings::default();
        s.tools_allow_fs = true;
        s.tools_allow_git = true;
        let bus = bus_with(s);
        let allowed = bus.effective_allowlist(None);
        assert!(allowed.contains("read_file"));
        assert!(allowed.contains("write_file"));
        assert!(allowed.contains("git"));
        assert!(!allowed.contains("shell"));
    }

    #[test]
    fn explicit_allowlist_wins_over_flags() {
        let mut s = Settings::default();
        s.tools_allow_shell = true;
        s.tools_allowlist = "noop,read_file".into();
        let bus = bus_with(s);
        assert_eq!(bus.effective_allowlist(None), allow(&["noop", "read_file"]));
    }

    #[test]
    fn policy_overrides_settings() {
        let bus = bus_with(Settings::default());
        let policy = json!({ "tools_allow_shell": true });
        assert!(bus.effective_allowlist(Some(&policy)).contains("shell"));

        let policy = json!({ "tools_allowlist": "noop" });
        assert_eq!(bus.effective_allowlist(Some(&policy)), allow(&["noop"]));
    }

    // -----------------------------------------------------------------------
    // Execute pipeline
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn noop_executes_with_replay_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());
        let out = bus
            .execute("noop", json!({ "text": "x" }), &allow(&["noop"]))
            .await
            .expect("noop executes");

        assert_eq!(out["ok"], true);
        assert_eq!(out["text"], "x");
        assert!(out["replay_id"].as_str().unwrap().starts_with("tool-"));
        assert_eq!(
            out["request_hash"].as_str().unwrap(),
            request_hash("noop", "1", &json!({ "text": "x" })),
        );
        assert!(out["tool_runtime_ms"].is_number());
    }

    #[tokio::test]
    async fn disallowed_tool_is_unknown_even_when_declared() {
        let bus = bus_with(Settings::default());
        let err = bus.execute("shell", json!({ "cmd": "ls" }), &allow(&["noop"])).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_tool");
    }

    #[tokio::test]
    async fn allowed_but_undeclared_tool_is_undeclared() {
        let bus = bus_with(Settings::default());
        let err = bus.execute("mystery", json!({}), &allow(&["mystery"])).await.unwrap_err();
        assert_eq!(err.kind(), "undeclared_tool");
    }

    #[tokio::test]
    async fn schema_violations_name_the_field() {
        let bus = bus_with(Settings::default());
        let err = bus
            .execute("shell", json!({}), &allow(&["shell"]))
            .await
            .unwrap_err();
        match err {
            GatewayError::InvalidArguments { issues } => {
                assert!(issues.contains(&"missing required field: cmd".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_arguments_are_rejected() {
        let bus = bus_with(Settings::default());
        let err = bus
            .execute("noop", json!({ "text": "x", "extra": 1 }), &allow(&["noop"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }

    #[tokio::test]
    async fn concurrency_timeout_maps_to_rate_limited() {
        let mut s = Settings::default();
        s.tools_max_concurrent = 1;
        s.tools_concurrency_timeout_sec = 0.05;
        let bus = Arc::new(bus_with(s));

        // Hold the only permit.
        let permit = Arc::clone(&bus.semaphore).acquire_owned().await.unwrap();
        let err = bus.execute("noop", json!({}), &allow(&["noop"])).await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        drop(permit);

        assert!(bus.execute("noop", json!({}), &allow(&["noop"])).await.is_ok());
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn replay_round_trips_through_per_invocation_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());

        let out = bus.execute("noop", json!({ "text": "x" }), &allow(&["noop"])).await.unwrap();
        let replay_id = out["replay_id"].as_str().unwrap();

        let event = bus.replay(replay_id).expect("replay present");
        assert_eq!(event["replay_id"], out["replay_id"]);
        assert_eq!(event["request_hash"], out["request_hash"]);
        assert_eq!(event["tool"], "noop");
        assert_eq!(event["args"]["text"], "x");
    }

    #[tokio::test]
    async fn replay_falls_back_to_ndjson_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.tools_log_mode = ToolLogMode::Ndjson;
        s.tools_log_path = dir.path().join("inv.ndjson").to_string_lossy().into_owned();
        s.tools_log_dir = dir.path().join("per").to_string_lossy().into_owned();
        let bus = bus_with(s);

        let out = bus.execute("noop", json!({}), &allow(&["noop"])).await.unwrap();
        let replay_id = out["replay_id"].as_str().unwrap();
        // No per-invocation file in ndjson mode.
        assert!(!dir.path().join("per").join(format!("{replay_id}.json")).exists());

        let event = bus.replay(replay_id).expect("found in ndjson");
        assert_eq!(event["tool"], "noop");
    }

    #[tokio::test]
    async fn replay_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());
        assert_eq!(bus.replay("tool-doesnotexist").unwrap_err().kind(), "replay_not_found");
        assert_eq!(bus.replay("  ").unwrap_err().kind(), "invalid_request");
    }

    // -----------------------------------------------------------------------
    // run_tool_call envelopes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn run_tool_call_wraps_refusals_as_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus_in(dir.path());

        let out = bus.run_tool_call("nope", "{}", &allow(&["noop"])).await;
        assert_eq!(out["ok"], false);
        assert_eq!(out["error_type"], "unknown_tool");

        let out = bus.run_tool_call("noop", "not json", &allow(&["noop"])).await;
        assert_eq!(out["error_type"], "invalid_arguments");

        let out = bus.run_tool_call("noop", "[1,2]", &allow(&["noop"])).await;
        assert_eq!(out["error_type"], "invalid_arguments");

        let out = bus.run_tool_call("noop", r#"{"text":"y"}"#, &allow(&["noop"])).await;
        assert_eq!(out["ok"], true);
        assert_eq!(out["text"], "y");
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    #[test]
    fn list_marks_declared_and_missing_tools() {
        let bus = bus_with(Settings::default());
        let listing = bus.list(&allow(&["noop", "ghost"]));
        let data = listing["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        // Sorted: ghost first.
        assert_eq!(data[0]["name"], "ghost");
        assert_eq!(data[0]["declared"], false);
        assert_eq!(data[0]["source"], "missing");
        assert_eq!(data[1]["name"], "noop");
        assert_eq!(data[1]["declared"], true);
        assert_eq!(data[1]["source"], "builtin");
    }

    #[test]
    fn tool_specs_render_openai_shape() {
        let bus = bus_with(Settings::default());
        let specs = bus.tool_specs(&["noop".to_string(), "ghost".to_string()]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0]["type"], "function");
        assert_eq!(specs[0]["function"]["name"], "noop");
        assert!(specs[0]["function"]["parameters"].is_object());
    }

    // -----------------------------------------------------------------------
    // Rate limiting
    // -----------------------------------------------------------------------

    #[test]
    fn rate_limit_disabled_by_default() {
        let bus = bus_with(Settings::default());
        for _ in 0..100 {
            assert!(bus.check_rate_limit("tok", None).is_ok());
        }
    }

    #[test]
    fn rate_limit_exhausts_burst_then_refuses() {
        let mut s = Settings::default();
        s.tools_rate_limit_rps = 1.0;
        s.tools_rate_limit_burst = 3;
        let bus = bus_with(s);

        for _ in 0..3 {
            assert!(bus.check_rate_limit("tok", None).is_ok());
        }
        assert_eq!(bus.check_rate_limit("tok", None).unwrap_err().kind(), "rate_limited");
        // Other tokens have independent buckets.
        assert!(bus.check_rate_limit("other", None).is_ok());
    }

    #[test]
    fn rate_limit_policy_overrides_settings() {
        let bus = bus_with(Settings::default());
        let policy = json!({ "tools_rate_limit_rps": 1.0, "tools_rate_limit_burst": 1 });
        assert!(bus.check_rate_limit("tok", Some(&policy)).is_ok());
        assert!(bus.check_rate_limit("tok", Some(&policy)).is_err());
    }

    // -----------------------------------------------------------------------
    // Normalisation helpers
    // -----------------------------------------------------------------------

    #[test]
    fn non_object_results_become_invalid_tool_result() {
        let mut v = json!("just a string");
        normalize_tool_result(&mut v);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error_type"], "invalid_tool_result");
    }

    #[test]
    fn missing_ok_becomes_invalid_tool_result() {
        let mut v = json!({ "data": 1 });
        normalize_tool_result(&mut v);
        assert_eq!(v["error_message"], "tool result missing boolean 'ok'");
    }

    #[test]
    fn error_envelope_derivation_prefers_specific_signals() {
        let mut v = json!({ "ok": false, "error": "ValueError: bad input" });
        normalize_tool_error(&mut v);
        assert_eq!(v["error_type"], "ValueError");
        assert_eq!(v["error_message"], "bad input");

        let mut v = json!({ "ok": false, "exit_code": 3 });
        normalize_tool_error(&mut v);
        assert_eq!(v["error_type"], "subprocess_nonzero_exit");
        assert_eq!(v["error_message"], "exit_code=3");

        let mut v = json!({ "ok": false, "stderr": "boom\n" });
        normalize_tool_error(&mut v);
        assert_eq!(v["error_type"], "stderr");
        assert_eq!(v["error_message"], "boom");

        let mut v = json!({ "ok": false });
        normalize_tool_error(&mut v);
        assert_eq!(v["error_type"], "tool_error");

        let mut v = json!({ "ok": true, "result": 1 });
        normalize_tool_error(&mut v);
        assert!(v.get("error_type").is_none());
    }

    #[test]
    fn attach_stdout_json_parses_best_effort() {
        let mut v = json!({ "ok": true, "stdout": "{\"a\":1}" });
        attach_stdout_json(&mut v);
        assert_eq!(v["stdout_json"]["a"], 1);

        let mut v = json!({ "ok": true, "stdout": "plain" });
        attach_stdout_json(&mut v);
        assert_eq!(v["stdout_json"], Value::Null);

        let mut v = json!({ "ok": true });
        attach_stdout_json(&mut v);
        assert!(v.get("stdout_json").is_none());
    }

    #[test]
    fn truncate_value_bounds_strings_only() {
        assert_eq!(truncate_value(json!("abcdef"), 3), json!("abc…"));
        assert_eq!(truncate_value(json!("ab"), 3), json!("ab"));
        assert_eq!(truncate_value(json!({ "k": "long" }), 1), json!({ "k": "long" }));
    }
}
