//! Process-wide settings for the gateway.
//!
//! Settings are loaded once at startup: a TOML file first (when present),
//! then environment variables override individual keys (env wins). The
//! resulting [`Settings`] is validated before the server opens any ports and
//! is immutable afterwards — no locks, no reload.
//!
//! # Example
//! ```toml
//! gateway_port = 8800
//! gateway_bearer_token = "dev-token"
//!
//! ollama_base_url = "http://127.0.0.1:11434"
//! mlx_base_url = "http://127.0.0.1:10240/v1"
//!
//! router_enable_policy = true
//! tools_allow_shell = false
//! ```

use std::{path::Path, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which chat backend family an alias or route targets.
///
/// Distinct from a backend *class* (registry key, e.g. `gpu_heavy`): this is
/// the wire protocol family the chat adapters speak.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Line-delimited JSON protocol (`/api/chat`).
    #[default]
    Ollama,
    /// OpenAI-style protocol (`/chat/completions` + SSE).
    Mlx,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Mlx => "mlx",
        }
    }

    /// Parse the spellings accepted on the wire (`x-backend` header, model
    /// prefixes). Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "mlx" => Some(Self::Mlx),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool-invocation log destinations.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolLogMode {
    /// Append-only newline-delimited JSON at `tools_log_path`.
    #[default]
    Ndjson,
    /// One JSON file per replay id under `tools_log_dir`.
    PerInvocation,
    Both,
}

/// Agent transcript destinations.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunLogMode {
    Ndjson,
    /// One JSON file per run id under `agent_runs_log_dir`.
    #[default]
    PerRun,
    Both,
}

/// Immutable process-wide configuration.
///
/// Field names double as the TOML keys; the env overlay uses the same names
/// uppercased (`gateway_port` ← `GATEWAY_PORT`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    // Listeners
    pub gateway_host: String,
    pub gateway_port: u16,
    pub observability_enabled: bool,
    pub observability_host: String,
    pub observability_port: u16,

    // Auth
    /// Single-token mode; ignored when `gateway_bearer_tokens` is set.
    pub gateway_bearer_token: String,
    /// Comma-separated multi-token mode.
    pub gateway_bearer_tokens: String,
    /// Per-token policy JSON: `{"<token>": { ...policy... }, ...}`.
    pub gateway_token_policies_json: String,
    /// Fail closed (500) when the policy JSON is set but malformed.
    pub gateway_token_policies_strict: bool,
    /// Comma-separated IPs and/or CIDRs; empty allows all.
    pub ip_allowlist: String,

    // Request guardrails
    /// 0 disables; otherwise requests over this size return 413.
    pub max_request_bytes: u64,
    /// Prefix for absolute URLs in API responses (e.g. stored image URLs).
    pub public_base_url: String,

    // Chat upstreams
    pub ollama_base_url: String,
    pub mlx_base_url: String,
    pub default_backend: Backend,
    pub ollama_model_strong: String,
    pub ollama_model_fast: String,
    pub mlx_model_strong: String,
    pub mlx_model_fast: String,

    // Router
    pub router_enable_policy: bool,
    pub router_enable_request_type: bool,
    pub router_long_context_chars: usize,
    /// Inline alias JSON; takes precedence over the file.
    pub model_aliases_json: String,
    pub model_aliases_path: String,

    // Backend registry
    pub backends_config_path: String,

    // Embeddings / rerank
    pub embeddings_backend: Backend,
    pub embeddings_model: String,

    // Images
    pub images_backend_class: String,
    pub images_http_base_url: String,
    pub images_http_timeout_sec: f64,
    pub images_max_pixels: u64,
    pub images_dir: String,

    // Music
    pub music_backend_class: String,
    pub heartmula_base_url: String,
    pub heartmula_timeout_sec: f64,
    pub heartmula_generate_path: String,

    // TTS
    pub tts_backend_class: String,
    pub tts_base_url: String,
    pub tts_timeout_sec: f64,
    pub tts_generate_path: String,

    // Tools
    pub tools_allow_shell: bool,
    pub tools_allow_fs: bool,
    pub tools_allow_fs_write: bool,
    pub tools_allow_http_fetch: bool,
    pub tools_allow_git: bool,
    pub tools_allow_system_info: bool,
    /// Explicit allowlist; when set, only these tools may execute.
    pub tools_allowlist: String,
    pub tools_shell_cwd: String,
    pub tools_shell_timeout_sec: u64,
    /// Comma-separated executables the shell tool may run.
    pub tools_shell_allowed_cmds: String,
    /// Comma-separated roots the fs tools may touch.
    pub tools_fs_roots: String,
    pub tools_fs_max_bytes: u64,
    pub tools_http_allowed_hosts: String,
    pub tools_http_timeout_sec: u64,
    pub tools_http_max_bytes: u64,
    pub tools_git_cwd: String,
    pub tools_git_timeout_sec: u64,
    pub tools_log_path: String,
    pub tools_log_mode: ToolLogMode,
    pub tools_log_dir: String,
    pub tools_max_concurrent: usize,
    pub tools_concurrency_timeout_sec: f64,
    pub tools_subprocess_stdout_max_chars: usize,
    pub tools_subprocess_stderr_max_chars: usize,
    /// Infra-owned declared-tool registry (JSON). Empty disables.
    pub tools_registry_path: String,
    /// Expected sha256 of the registry file; mismatch ⇒ registry ignored.
    pub tools_registry_sha256: String,
    /// Per-bearer-token rate limit for /v1/tools. Disabled when <= 0.
    pub tools_rate_limit_rps: f64,
    pub tools_rate_limit_burst: u32,

    // Observability
    pub metrics_enabled: bool,
    pub request_log_enabled: bool,
    pub request_log_path: String,

    // Agent runtime
    pub agent_specs_path: String,
    pub agent_runs_log_path: String,
    pub agent_runs_log_dir: String,
    pub agent_runs_log_mode: RunLogMode,
    pub agent_backend_concurrency_ollama: u32,
    pub agent_backend_concurrency_mlx: u32,
    pub agent_queue_max: u32,
    pub agent_queue_timeout_sec: f64,
    /// Refuse tier>=1 agents outright while set.
    pub agent_shed_heavy: bool,

    // User store (CLI surface)
    pub user_db_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_host: "0.0.0.0".into(),
            gateway_port: 8800,
            observability_enabled: true,
            observability_host: "127.0.0.1".into(),
            observability_port: 8801,

            gateway_bearer_token: String::new(),
            gateway_bearer_tokens: String::new(),
            gateway_token_policies_json: String::new(),
            gateway_token_policies_strict: false,
            ip_allowlist: String::new(),

            max_request_bytes: 1_000_000,
            public_base_url: String::new(),

            ollama_base_url: "http://127.0.0.1:11434".into(),
            mlx_base_url: "http://127.0.0.1:10240/v1".into(),
            default_backend: Backend::Ollama,
            ollama_model_strong: "qwen2.5:32b".into(),
            ollama_model_fast: "qwen2.5:7b".into(),
            mlx_model_strong: "mlx-community/gemma-2-2b-it-8bit".into(),
            mlx_model_fast: "mlx-community/gemma-2-2b-it-8bit".into(),

            router_enable_policy: false,
            router_enable_request_type: false,
            router_long_context_chars: 40_000,
            model_aliases_json: String::new(),
            model_aliases_path: String::new(),

            backends_config_path: String::new(),

            embeddings_backend: Backend::Ollama,
            embeddings_model: "nomic-embed-text".into(),

            images_backend_class: "gpu_heavy".into(),
            images_http_base_url: String::new(),
            images_http_timeout_sec: 120.0,
            images_max_pixels: 2_000_000,
            images_dir: "data/images".into(),

            music_backend_class: "heartmula_music".into(),
            heartmula_base_url: String::new(),
            heartmula_timeout_sec: 120.0,
            heartmula_generate_path: "/v1/music/generations".into(),

            tts_backend_class: "pocket_tts".into(),
            tts_base_url: String::new(),
            tts_timeout_sec: 60.0,
            tts_generate_path: "/v1/audio/speech".into(),

            tools_allow_shell: false,
            tools_allow_fs: false,
            tools_allow_fs_write: false,
            tools_allow_http_fetch: false,
            tools_allow_git: false,
            tools_allow_system_info: false,
            tools_allowlist: String::new(),
            tools_shell_cwd: "data/tools-work".into(),
            tools_shell_timeout_sec: 20,
            tools_shell_allowed_cmds: String::new(),
            tools_fs_roots: String::new(),
            tools_fs_max_bytes: 200_000,
            tools_http_allowed_hosts: "127.0.0.1,localhost".into(),
            tools_http_timeout_sec: 10,
            tools_http_max_bytes: 200_000,
            tools_git_cwd: String::new(),
            tools_git_timeout_sec: 20,
            tools_log_path: "data/tools/invocations.ndjson".into(),
            tools_log_mode: ToolLogMode::Ndjson,
            tools_log_dir: "data/tools".into(),
            tools_max_concurrent: 8,
            tools_concurrency_timeout_sec: 5.0,
            tools_subprocess_stdout_max_chars: 20_000,
            tools_subprocess_stderr_max_chars: 20_000,
            tools_registry_path: String::new(),
            tools_registry_sha256: String::new(),
            tools_rate_limit_rps: 0.0,
            tools_rate_limit_burst: 0,

            metrics_enabled: true,
            request_log_enabled: true,
            request_log_path: "data/requests.ndjson".into(),

            agent_specs_path: String::new(),
            agent_runs_log_path: "data/agent/runs.ndjson".into(),
            agent_runs_log_dir: "data/agent".into(),
            agent_runs_log_mode: RunLogMode::PerRun,
            agent_backend_concurrency_ollama: 4,
            agent_backend_concurrency_mlx: 2,
            agent_queue_max: 32,
            agent_queue_timeout_sec: 2.0,
            agent_shed_heavy: true,

            user_db_path: "data/users.json".into(),
        }
    }
}

impl Settings {
    /// Load from a TOML file (missing file ⇒ defaults), overlay the
    /// environment, then validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                toml::from_str(&content).context("parsing settings TOML")?
            }
            _ => Self::default(),
        };
        settings.apply_env_overlay();
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.bearer_tokens().is_empty(),
            "no bearer token configured; set GATEWAY_BEARER_TOKEN or GATEWAY_BEARER_TOKENS"
        );
        anyhow::ensure!(self.images_max_pixels > 0, "images_max_pixels must be > 0");
        anyhow::ensure!(self.tools_max_concurrent > 0, "tools_max_concurrent must be > 0");
        Ok(())
    }

    /// The set of accepted bearer tokens (multi-token list wins over the
    /// single-token field).
    pub fn bearer_tokens(&self) -> Vec<String> {
        let multi: Vec<String> = self
            .gateway_bearer_tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        if !multi.is_empty() {
            return multi;
        }
        if self.gateway_bearer_token.trim().is_empty() {
            Vec::new()
        } else {
            vec![self.gateway_bearer_token.trim().to_string()]
        }
    }

    /// Base URL for a chat backend family.
    pub fn base_url(&self, backend: Backend) -> &str {
        match backend {
            Backend::Ollama => &self.ollama_base_url,
            Backend::Mlx => &self.mlx_base_url,
        }
    }

    /// Strong (default) model for a chat backend family.
    pub fn strong_model(&self, backend: Backend) -> &str {
        match backend {
            Backend::Ollama => &self.ollama_model_strong,
            Backend::Mlx => &self.mlx_model_strong,
        }
    }

    /// Fast (cheap) model for a chat backend family.
    pub fn fast_model(&self, backend: Backend) -> &str {
        match backend {
            Backend::Ollama => &self.ollama_model_fast,
            Backend::Mlx => &self.mlx_model_fast,
        }
    }

    /// Second-pass `${VAR}` lookup for registry base_url placeholders: when a
    /// variable is absent from the process environment, these settings keys
    /// can still resolve it.
    pub fn placeholder_value(&self, name: &str) -> Option<&str> {
        let v = match name {
            "OLLAMA_BASE_URL" => &self.ollama_base_url,
            "MLX_BASE_URL" => &self.mlx_base_url,
            "HEARTMULA_BASE_URL" => &self.heartmula_base_url,
            "TTS_BASE_URL" => &self.tts_base_url,
            "IMAGES_HTTP_BASE_URL" => &self.images_http_base_url,
            "PUBLIC_BASE_URL" => &self.public_base_url,
            _ => return None,
        };
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    }

    /// Overlay environment variables onto the current values. Each field's
    /// uppercased name is its env key; unset or unparseable values leave the
    /// field unchanged.
    pub fn apply_env_overlay(&mut self) {
        str_env(&mut self.gateway_host, "GATEWAY_HOST");
        parse_env(&mut self.gateway_port, "GATEWAY_PORT");
        bool_env(&mut self.observability_enabled, "OBSERVABILITY_ENABLED");
        str_env(&mut self.observability_host, "OBSERVABILITY_HOST");
        parse_env(&mut self.observability_port, "OBSERVABILITY_PORT");

        str_env(&mut self.gateway_bearer_token, "GATEWAY_BEARER_TOKEN");
        str_env(&mut self.gateway_bearer_tokens, "GATEWAY_BEARER_TOKENS");
        str_env(&mut self.gateway_token_policies_json, "GATEWAY_TOKEN_POLICIES_JSON");
        bool_env(&mut self.gateway_token_policies_strict, "GATEWAY_TOKEN_POLICIES_STRICT");
        str_env(&mut self.ip_allowlist, "IP_ALLOWLIST");

        parse_env(&mut self.max_request_bytes, "MAX_REQUEST_BYTES");
        str_env(&mut self.public_base_url, "PUBLIC_BASE_URL");

        str_env(&mut self.ollama_base_url, "OLLAMA_BASE_URL");
        str_env(&mut self.mlx_base_url, "MLX_BASE_URL");
        backend_env(&mut self.default_backend, "DEFAULT_BACKEND");
        str_env(&mut self.ollama_model_strong, "OLLAMA_MODEL_STRONG");
        str_env(&mut self.ollama_model_fast, "OLLAMA_MODEL_FAST");
        str_env(&mut self.mlx_model_strong, "MLX_MODEL_STRONG");
        str_env(&mut self.mlx_model_fast, "MLX_MODEL_FAST");

        bool_env(&mut self.router_enable_policy, "ROUTER_ENABLE_POLICY");
        bool_env(&mut self.router_enable_request_type, "ROUTER_ENABLE_REQUEST_TYPE");
        parse_env(&mut self.router_long_context_chars, "ROUTER_LONG_CONTEXT_CHARS");
        str_env(&mut self.model_aliases_json, "MODEL_ALIASES_JSON");
        str_env(&mut self.model_aliases_path, "MODEL_ALIASES_PATH");

        str_env(&mut self.backends_config_path, "BACKENDS_CONFIG_PATH");

        backend_env(&mut self.embeddings_backend, "EMBEDDINGS_BACKEND");
        str_env(&mut self.embeddings_model, "EMBEDDINGS_MODEL");

        str_env(&mut self.images_backend_class, "IMAGES_BACKEND_CLASS");
        str_env(&mut self.images_http_base_url, "IMAGES_HTTP_BASE_URL");
        parse_env(&mut self.images_http_timeout_sec, "IMAGES_HTTP_TIMEOUT_SEC");
        parse_env(&mut self.images_max_pixels, "IMAGES_MAX_PIXELS");
        str_env(&mut self.images_dir, "IMAGES_DIR");

        str_env(&mut self.music_backend_class, "MUSIC_BACKEND_CLASS");
        str_env(&mut self.heartmula_base_url, "HEARTMULA_BASE_URL");
        parse_env(&mut self.heartmula_timeout_sec, "HEARTMULA_TIMEOUT_SEC");
        str_env(&mut self.heartmula_generate_path, "HEARTMULA_GENERATE_PATH");

        str_env(&mut self.tts_backend_class, "TTS_BACKEND_CLASS");
        str_env(&mut self.tts_base_url, "TTS_BASE_URL");
        parse_env(&mut self.tts_timeout_sec, "TTS_TIMEOUT_SEC");
        str_env(&mut self.tts_generate_path, "TTS_GENERATE_PATH");

        bool_env(&mut self.tools_allow_shell, "TOOLS_ALLOW_SHELL");
        bool_env(&mut self.tools_allow_fs, "TOOLS_ALLOW_FS");
        bool_env(&mut self.tools_allow_fs_write, "TOOLS_ALLOW_FS_WRITE");
        bool_env(&mut self.tools_allow_http_fetch, "TOOLS_ALLOW_HTTP_FETCH");
        bool_env(&mut self.tools_allow_git, "TOOLS_ALLOW_GIT");
        bool_env(&mut self.tools_allow_system_info, "TOOLS_ALLOW_SYSTEM_INFO");
        str_env(&mut self.tools_allowlist, "TOOLS_ALLOWLIST");
        str_env(&mut self.tools_shell_cwd, "TOOLS_SHELL_CWD");
        parse_env(&mut self.tools_shell_timeout_sec, "TOOLS_SHELL_TIMEOUT_SEC");
        str_env(&mut self.tools_shell_allowed_cmds, "TOOLS_SHELL_ALLOWED_CMDS");
        str_env(&mut self.tools_fs_roots, "TOOLS_FS_ROOTS");
        parse_env(&mut self.tools_fs_max_bytes, "TOOLS_FS_MAX_BYTES");
        str_env(&mut self.tools_http_allowed_hosts, "TOOLS_HTTP_ALLOWED_HOSTS");
        parse_env(&mut self.tools_http_timeout_sec, "TOOLS_HTTP_TIMEOUT_SEC");
        parse_env(&mut self.tools_http_max_bytes, "TOOLS_HTTP_MAX_BYTES");
        str_env(&mut self.tools_git_cwd, "TOOLS_GIT_CWD");
        parse_env(&mut self.tools_git_timeout_sec, "TOOLS_GIT_TIMEOUT_SEC");
        str_env(&mut self.tools_log_path, "TOOLS_LOG_PATH");
        tool_log_mode_env(&mut self.tools_log_mode, "TOOLS_LOG_MODE");
        str_env(&mut self.tools_log_dir, "TOOLS_LOG_DIR");
        parse_env(&mut self.tools_max_concurrent, "TOOLS_MAX_CONCURRENT");
        parse_env(&mut self.tools_concurrency_timeout_sec, "TOOLS_CONCURRENCY_TIMEOUT_SEC");
        parse_env(&mut self.tools_subprocess_stdout_max_chars, "TOOLS_SUBPROCESS_STDOUT_MAX_CHARS");
        parse_env(&mut self.tools_subprocess_stderr_max_chars, "TOOLS_SUBPROCESS_STDERR_MAX_CHARS");
        str_env(&mut self.tools_registry_path, "TOOLS_REGISTRY_PATH");
        str_env(&mut self.tools_registry_sha256, "TOOLS_REGISTRY_SHA256");
        parse_env(&mut self.tools_rate_limit_rps, "TOOLS_RATE_LIMIT_RPS");
        parse_env(&mut self.tools_rate_limit_burst, "TOOLS_RATE_LIMIT_BURST");

        bool_env(&mut self.metrics_enabled, "METRICS_ENABLED");
        bool_env(&mut self.request_log_enabled, "REQUEST_LOG_ENABLED");
        str_env(&mut self.request_log_path, "REQUEST_LOG_PATH");

        str_env(&mut self.agent_specs_path, "AGENT_SPECS_PATH");
        str_env(&mut self.agent_runs_log_path, "AGENT_RUNS_LOG_PATH");
        str_env(&mut self.agent_runs_log_dir, "AGENT_RUNS_LOG_DIR");
        run_log_mode_env(&mut self.agent_runs_log_mode, "AGENT_RUNS_LOG_MODE");
        parse_env(&mut self.agent_backend_concurrency_ollama, "AGENT_BACKEND_CONCURRENCY_OLLAMA");
        parse_env(&mut self.agent_backend_concurrency_mlx, "AGENT_BACKEND_CONCURRENCY_MLX");
        parse_env(&mut self.agent_queue_max, "AGENT_QUEUE_MAX");
        parse_env(&mut self.agent_queue_timeout_sec, "AGENT_QUEUE_TIMEOUT_SEC");
        bool_env(&mut self.agent_shed_heavy, "AGENT_SHED_HEAVY");

        str_env(&mut self.user_db_path, "USER_DB_PATH");
    }
}

fn str_env(field: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *field = v;
        }
    }
}

fn parse_env<T: FromStr>(field: &mut T, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.trim().parse() {
            *field = parsed;
        }
    }
}

fn bool_env(field: &mut bool, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *field = true,
            "0" | "false" | "no" | "off" => *field = false,
            _ => {}
        }
    }
}

fn backend_env(field: &mut Backend, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Some(b) = Backend::parse(&v) {
            *field = b;
        }
    }
}

fn tool_log_mode_env(field: &mut ToolLogMode, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.trim() {
            "ndjson" => *field = ToolLogMode::Ndjson,
            "per_invocation" => *field = ToolLogMode::PerInvocation,
            "both" => *field = ToolLogMode::Both,
            _ => {}
        }
    }
}

fn run_log_mode_env(field: &mut RunLogMode, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.trim() {
            "ndjson" => *field = RunLogMode::Ndjson,
            "per_run" => *field = RunLogMode::PerRun,
            "both" => *field = RunLogMode::Both,
            _ => {}
        }
    }
}
