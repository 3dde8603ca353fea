//! Request routing — the pure decision core of the gateway.
//!
//! [`decide_route`] maps `(request model, hints, messages, has_tools)` to a
//! concrete `(backend, upstream model)` pair plus a short stable reason
//! string. It is a pure function: no I/O, no clock, no global state — the
//! same inputs always produce the same [`RouteDecision`], which is what makes
//! routing testable and the agent runtime deterministic.
//!
//! Decision order (first match wins):
//! 1. `X-Backend` header override
//! 2. alias key match (after stripping the `"auto"` sentinel)
//! 3. explicit backend pin (`ollama:…`, `mlx:…`, or a backend sentinel)
//! 4. policy disabled ⇒ direct
//! 5. policy heuristics: tools → long context → request type → fast
//!
//! Sentinels (`auto`, `default`, bare backend names) are always folded into
//! the configured strong model — they are never forwarded upstream.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::{
    aliases::AliasTable,
    settings::{Backend, Settings},
};

/// Immutable router inputs derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_backend: Backend,
    pub ollama_strong_model: String,
    pub ollama_fast_model: String,
    pub mlx_strong_model: String,
    pub mlx_fast_model: String,
    pub long_context_chars_threshold: usize,
    pub enable_policy: bool,
    pub enable_request_type: bool,
}

impl RouterConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_backend: settings.default_backend,
            ollama_strong_model: settings.ollama_model_strong.clone(),
            ollama_fast_model: settings.ollama_model_fast.clone(),
            mlx_strong_model: settings.mlx_model_strong.clone(),
            mlx_fast_model: settings.mlx_model_fast.clone(),
            long_context_chars_threshold: settings.router_long_context_chars,
            enable_policy: settings.router_enable_policy,
            enable_request_type: settings.router_enable_request_type,
        }
    }

    fn strong_model(&self, backend: Backend) -> &str {
        match backend {
            Backend::Ollama => &self.ollama_strong_model,
            Backend::Mlx => &self.mlx_strong_model,
        }
    }

    fn fast_model(&self, backend: Backend) -> &str {
        match backend {
            Backend::Ollama => &self.ollama_fast_model,
            Backend::Mlx => &self.mlx_fast_model,
        }
    }
}

/// Routing hints extracted from request headers by the handler layer, so the
/// router itself never touches HTTP types.
#[derive(Debug, Clone, Default)]
pub struct RouteHints {
    /// Lowercased `X-Backend` header value, when present.
    pub backend_override: Option<String>,
    /// Lowercased `X-Request-Type` header value, when present.
    pub request_type: Option<String>,
}

/// The routing outcome. `reason` is a short stable string surfaced in the
/// `X-Router-Reason` response header and the request log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub backend: Backend,
    pub model: String,
    pub reason: &'static str,
}

impl RouteDecision {
    fn new(backend: Backend, model: impl Into<String>, reason: &'static str) -> Self {
        Self { backend, model: model.into(), reason }
    }
}

/// Approximate character size of a message list. String content counts its
/// length; structured content counts its JSON encoding.
fn approx_text_size(messages: &[Value]) -> usize {
    messages
        .iter()
        .map(|m| match m.get("content") {
            Some(Value::String(s)) => s.len(),
            Some(Value::Null) | None => 0,
            Some(other) => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        })
        .sum()
}

fn choose_backend_by_model(model: &str, default_backend: Backend) -> Backend {
    let m = model.trim().to_lowercase();
    if m.starts_with("ollama:") || m == "ollama" || m == "ollama-default" {
        return Backend::Ollama;
    }
    if m.starts_with("mlx:") || m == "mlx" || m == "mlx-default" {
        return Backend::Mlx;
    }
    default_backend
}

/// Fold sentinels and backend prefixes into a concrete upstream model name.
/// Guarantees the sentinel never leaks upstream.
fn normalize_model(model: &str, backend: Backend, cfg: &RouterConfig) -> String {
    let mut m = model.trim();
    let prefix = match backend {
        Backend::Ollama => "ollama:",
        Backend::Mlx => "mlx:",
    };
    if let Some(stripped) = m.strip_prefix(prefix) {
        m = stripped;
    }
    let key = m.to_lowercase();
    let is_sentinel = matches!(key.as_str(), "default" | "auto" | "")
        || key == backend.as_str()
        || key == format!("{backend}-default");
    if is_sentinel {
        cfg.strong_model(backend).to_string()
    } else {
        m.to_string()
    }
}

static CODE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(typescript|javascript|python|py|node|npm|pip|pytest|uvicorn|fastapi|dockerfile|kubernetes|terraform|ansible|git)\b")
        .expect("code hint regex")
});
static CODE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(traceback|stack trace|exception|segmentation fault|syntaxerror|typeerror|valueerror|nullpointerexception|panic:)\b")
        .expect("code error regex")
});
static CODE_EXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(py|js|ts|tsx|jsx|java|go|rs|cs|cpp|cxx|hpp|h|sql|yaml|yml|toml|json)\b")
        .expect("code ext regex")
});
static CODE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|\s)(def|class|import|from|function|const|let|var|public|private)\b")
        .expect("code token regex")
});

fn last_user_text(messages: &[Value]) -> String {
    for m in messages.iter().rev() {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
        if role != "user" {
            continue;
        }
        return match m.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => continue,
            Some(other) => serde_json::to_string(other).unwrap_or_default(),
        };
    }
    String::new()
}

/// Conservative, deterministic heuristic for "this is a coding request".
/// Only consulted when request-type routing is enabled.
fn is_probably_coding_request(messages: &[Value]) -> bool {
    let text = last_user_text(messages);
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    if text.contains("```") {
        return true;
    }
    if CODE_ERROR.is_match(text) {
        return true;
    }
    if CODE_EXT.is_match(text) {
        return true;
    }
    if CODE_TOKEN.is_match(text) && (text.contains('{') || text.contains(':') || text.contains('(')) {
        return true;
    }
    let lower = text.to_lowercase();
    if CODE_HINT.is_match(text)
        && (lower.contains("error") || lower.contains("debug") || lower.contains("fix"))
    {
        return true;
    }
    false
}

/// Select `(backend, model)` with simple, stable rules. Pure and deterministic.
pub fn decide_route(
    cfg: &RouterConfig,
    aliases: &AliasTable,
    request_model: &str,
    hints: &RouteHints,
    messages: &[Value],
    has_tools: bool,
) -> RouteDecision {
    // 1. Header override pins the backend; the model is normalized within it.
    if let Some(backend) = hints.backend_override.as_deref().and_then(Backend::parse) {
        let model = normalize_model(request_model, backend, cfg);
        return RouteDecision::new(backend, model, "override:x-backend");
    }

    // "auto" means "let policy pick".
    let mut request_model = request_model.trim();
    if request_model.eq_ignore_ascii_case("auto") {
        request_model = "";
    }
    let request_key = request_model.to_lowercase();

    // 2. Alias keys resolve directly to a stable backend + upstream model.
    if let Some(alias) = aliases.get(&request_key) {
        let model = normalize_model(&alias.upstream_model, alias.backend, cfg);
        return RouteDecision::new(alias.backend, model, "alias:model");
    }

    let backend = choose_backend_by_model(request_model, cfg.default_backend);

    // 3. Explicit pins are honored, with sentinel folding only.
    let explicitly_pinned = request_key.starts_with("ollama:")
        || request_key.starts_with("mlx:")
        || matches!(request_key.as_str(), "ollama" | "mlx" | "ollama-default" | "mlx-default");
    if explicitly_pinned {
        let model = normalize_model(request_model, backend, cfg);
        return RouteDecision::new(backend, model, "pinned:model");
    }

    // 4. No policy: direct passthrough.
    if !cfg.enable_policy {
        let model = normalize_model(request_model, backend, cfg);
        return RouteDecision::new(backend, model, "direct:model");
    }

    // 5. Policy heuristics.
    if has_tools {
        if let Some(a) = aliases.get("default").filter(|a| a.tools != Some(false)) {
            return RouteDecision::new(
                a.backend,
                normalize_model(&a.upstream_model, a.backend, cfg),
                "policy:tools->alias:default",
            );
        }
        if let Some(a) = aliases.get("coder").filter(|a| a.tools != Some(false)) {
            return RouteDecision::new(
                a.backend,
                normalize_model(&a.upstream_model, a.backend, cfg),
                "policy:tools->alias:coder",
            );
        }
        return RouteDecision::new(backend, cfg.strong_model(backend), "policy:tools->strong");
    }

    let size = approx_text_size(messages);
    let long_threshold = aliases
        .get("long")
        .and_then(|a| a.context_window)
        .unwrap_or(cfg.long_context_chars_threshold);

    if size >= long_threshold {
        if let Some(a) = aliases.get("long") {
            return RouteDecision::new(
                a.backend,
                normalize_model(&a.upstream_model, a.backend, cfg),
                "policy:long_context->alias:long",
            );
        }
        if !cfg.mlx_strong_model.is_empty() {
            return RouteDecision::new(
                Backend::Mlx,
                cfg.mlx_strong_model.clone(),
                "policy:long_context->mlx",
            );
        }
        return RouteDecision::new(backend, cfg.strong_model(backend), "policy:long_context->strong");
    }

    let is_coding = cfg.enable_request_type
        && match hints.request_type.as_deref() {
            Some("coding" | "code" | "dev") => true,
            Some("chat" | "general") => false,
            _ => is_probably_coding_request(messages),
        };

    if is_coding {
        if let Some(a) = aliases.get("coder") {
            return RouteDecision::new(
                a.backend,
                normalize_model(&a.upstream_model, a.backend, cfg),
                "policy:coding->alias:coder",
            );
        }
        return RouteDecision::new(backend, cfg.strong_model(backend), "policy:coding->strong");
    }

    if let Some(a) = aliases.get("fast") {
        return RouteDecision::new(
            a.backend,
            normalize_model(&a.upstream_model, a.backend, cfg),
            "policy:fast->alias:fast",
        );
    }
    RouteDecision::new(backend, cfg.fast_model(backend), "policy:fast")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(enable_policy: bool) -> RouterConfig {
        RouterConfig {
            default_backend: Backend::Ollama,
            ollama_strong_model: "qwen2.5:32b".into(),
            ollama_fast_model: "qwen2.5:7b".into(),
            mlx_strong_model: "gemma-2-9b".into(),
            mlx_fast_model: "gemma-2-2b".into(),
            long_context_chars_threshold: 40_000,
            enable_policy,
            enable_request_type: false,
        }
    }

    fn aliases() -> AliasTable {
        AliasTable::load(&Settings::default())
    }

    fn user(content: &str) -> Vec<Value> {
        vec![json!({ "role": "user", "content": content })]
    }

    // -----------------------------------------------------------------------
    // Overrides and pins
    // -----------------------------------------------------------------------

    #[test]
    fn header_override_pins_backend() {
        let hints = RouteHints { backend_override: Some("mlx".into()), ..Default::default() };
        let d = decide_route(&cfg(false), &aliases(), "auto", &hints, &[], false);
        assert_eq!(d.backend, Backend::Mlx);
        assert_eq!(d.model, "gemma-2-9b");
        assert_eq!(d.reason, "override:x-backend");
    }

    #[test]
    fn model_prefix_pins_backend_and_strips_prefix() {
        let d = decide_route(
            &cfg(false),
            &aliases(),
            "ollama:qwen2.5:7b",
            &RouteHints::default(),
            &[],
            false,
        );
        assert_eq!(d.backend, Backend::Ollama);
        assert_eq!(d.model, "qwen2.5:7b");
        assert_eq!(d.reason, "pinned:model");
    }

    #[test]
    fn bare_backend_name_pins_and_folds_to_strong() {
        let d = decide_route(&cfg(false), &aliases(), "mlx", &RouteHints::default(), &[], false);
        assert_eq!(d.backend, Backend::Mlx);
        assert_eq!(d.model, "gemma-2-9b");
        assert_eq!(d.reason, "pinned:model");
    }

    // -----------------------------------------------------------------------
    // Aliases and direct mode
    // -----------------------------------------------------------------------

    #[test]
    fn alias_key_resolves_case_insensitively() {
        let d = decide_route(&cfg(false), &aliases(), "CODER", &RouteHints::default(), &[], false);
        assert_eq!(d.reason, "alias:model");
        assert_eq!(d.backend, Backend::Ollama);
    }

    #[test]
    fn policy_disabled_routes_direct() {
        let d = decide_route(
            &cfg(false),
            &aliases(),
            "some-exact-model",
            &RouteHints::default(),
            &[],
            false,
        );
        assert_eq!(d.reason, "direct:model");
        assert_eq!(d.model, "some-exact-model");
        assert_eq!(d.backend, Backend::Ollama);
    }

    // -----------------------------------------------------------------------
    // Policy heuristics
    // -----------------------------------------------------------------------

    #[test]
    fn tools_route_to_default_alias() {
        let d = decide_route(&cfg(true), &aliases(), "auto", &RouteHints::default(), &[], true);
        assert_eq!(d.reason, "policy:tools->alias:default");
    }

    #[test]
    fn tools_fall_back_to_coder_when_default_refuses_tools() {
        let mut settings = Settings::default();
        settings.model_aliases_json =
            r#"{"default":{"backend":"ollama","model":"qwen2.5:32b","tools":false}}"#.into();
        let table = AliasTable::load(&settings);
        let d = decide_route(&cfg(true), &table, "auto", &RouteHints::default(), &[], true);
        assert_eq!(d.reason, "policy:tools->alias:coder");
    }

    #[test]
    fn long_context_routes_to_long_alias() {
        let big = "x".repeat(50_000);
        let d = decide_route(&cfg(true), &aliases(), "auto", &RouteHints::default(), &user(&big), false);
        assert_eq!(d.reason, "policy:long_context->alias:long");
        assert_eq!(d.backend, Backend::Mlx);
    }

    #[test]
    fn structured_content_counts_toward_size() {
        let messages = vec![json!({
            "role": "user",
            "content": [{ "type": "text", "text": "y".repeat(50_000) }],
        })];
        let d = decide_route(&cfg(true), &aliases(), "auto", &RouteHints::default(), &messages, false);
        assert!(d.reason.starts_with("policy:long_context"));
    }

    #[test]
    fn short_plain_chat_routes_fast() {
        let d = decide_route(
            &cfg(true),
            &aliases(),
            "auto",
            &RouteHints::default(),
            &user("what's for dinner?"),
            false,
        );
        assert_eq!(d.reason, "policy:fast->alias:fast");
    }

    #[test]
    fn request_type_header_selects_coder() {
        let mut c = cfg(true);
        c.enable_request_type = true;
        let hints = RouteHints { request_type: Some("coding".into()), ..Default::default() };
        let d = decide_route(&c, &aliases(), "auto", &hints, &user("please help"), false);
        assert_eq!(d.reason, "policy:coding->alias:coder");
    }

    #[test]
    fn request_type_chat_header_suppresses_heuristic() {
        let mut c = cfg(true);
        c.enable_request_type = true;
        let hints = RouteHints { request_type: Some("chat".into()), ..Default::default() };
        let d = decide_route(&c, &aliases(), "auto", &hints, &user("```py\nprint(1)\n```"), false);
        assert_eq!(d.reason, "policy:fast->alias:fast");
    }

    #[test]
    fn coding_heuristic_detects_code_markers() {
        assert!(is_probably_coding_request(&user("```rust\nfn main() {}\n```")));
        assert!(is_probably_coding_request(&user("I got a Traceback in my script")));
        assert!(is_probably_coding_request(&user("open src/main.rs and look")));
        assert!(is_probably_coding_request(&user("def handler(): return 1")));
        assert!(is_probably_coding_request(&user("npm build keeps throwing an error")));
        assert!(!is_probably_coding_request(&user("what's the weather like?")));
        assert!(!is_probably_coding_request(&[]));
    }

    // -----------------------------------------------------------------------
    // Sentinel leak freedom and purity
    // -----------------------------------------------------------------------

    #[test]
    fn sentinels_never_leak_upstream() {
        let table = aliases();
        let sentinels = ["auto", "default", "ollama", "mlx", "ollama-default", "mlx-default", ""];
        for c in [cfg(false), cfg(true)] {
            for model in sentinels {
                for has_tools in [false, true] {
                    let d = decide_route(&c, &table, model, &RouteHints::default(), &[], has_tools);
                    assert!(
                        !sentinels.contains(&d.model.as_str()),
                        "sentinel {model:?} leaked as {:?} (reason {})",
                        d.model,
                        d.reason,
                    );
                    assert!(!d.model.is_empty());
                }
            }
        }
    }

    #[test]
    fn decisions_are_deterministic() {
        let c = cfg(true);
        let table = aliases();
        let messages = user("fix this TypeError in utils.py please");
        let first = decide_route(&c, &table, "auto", &RouteHints::default(), &messages, false);
        for _ in 0..10 {
            let again = decide_route(&c, &table, "auto", &RouteHints::default(), &messages, false);
            assert_eq!(first, again);
        }
    }
}
