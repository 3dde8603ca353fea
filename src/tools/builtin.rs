//! Built-in tool implementations and their declared schemas.
//!
//! Every builtin is gated by a settings flag and fails closed with a plain
//! `ok: false` envelope when disabled or misconfigured. Implementations never
//! panic and never return HTTP errors — a tool that ran and failed is still a
//! 200 at the bus boundary.

use std::{collections::HashMap, path::PathBuf, sync::LazyLock, time::Duration};

use base64::Engine as _;
use serde_json::{json, Value};

use crate::settings::Settings;

use super::registry::SubprocessSpec;

/// Declared schemas for the builtins, keyed by tool name. Shape matches the
/// on-disk registry entries so `/v1/tools` can render both uniformly.
pub static BUILTIN_SCHEMAS: LazyLock<HashMap<&'static str, Value>> = LazyLock::new(|| {
    HashMap::from([
        (
            "noop",
            json!({
                "name": "noop",
                "version": "1",
                "description": "No-op tool for end-to-end verification.",
                "parameters": {
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": [],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "shell",
            json!({
                "name": "shell",
                "version": "1",
                "description": "Run an allowlisted command locally.",
                "parameters": {
                    "type": "object",
                    "properties": { "cmd": { "type": "string", "description": "Command string to execute." } },
                    "required": ["cmd"],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "read_file",
            json!({
                "name": "read_file",
                "version": "1",
                "description": "Read a local text file.",
                "parameters": {
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "write_file",
            json!({
                "name": "write_file",
                "version": "1",
                "description": "Write a local text file.",
                "parameters": {
                    "type": "object",
                    "properties": { "path": { "type": "string" }, "content": { "type": "string" } },
                    "required": ["path", "content"],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "git",
            json!({
                "name": "git",
                "version": "1",
                "description": "Run a limited set of git subcommands in a configured repo directory.",
                "parameters": {
                    "type": "object",
                    "properties": { "args": { "type": "array", "items": { "type": "string" } } },
                    "required": ["args"],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "http_fetch",
            json!({
                "name": "http_fetch",
                "version": "1",
                "description": "Fetch a URL via GET with host allowlist and size limits.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "url": { "type": "string" },
                        "method": { "type": "string", "enum": ["GET"] },
                        "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                    },
                    "required": ["url"],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "http_fetch_local",
            json!({
                "name": "http_fetch_local",
                "version": "1",
                "description": "Fetch a URL via GET, restricted to localhost only.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "url": { "type": "string" },
                        "method": { "type": "string", "enum": ["GET"] },
                        "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                    },
                    "required": ["url"],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "system_info",
            json!({
                "name": "system_info",
                "version": "1",
                "description": "Return non-sensitive runtime and feature information.",
                "parameters": {
                    "type": "object",
                    "properties": {},
                    "required": [],
                    "additionalProperties": false,
                },
            }),
        ),
        (
            "models_refresh",
            json!({
                "name": "models_refresh",
                "version": "1",
                "description": "Ping upstream model endpoints to confirm reachability.",
                "parameters": {
                    "type": "object",
                    "properties": {},
                    "required": [],
                    "additionalProperties": false,
                },
            }),
        ),
    ])
});

/// Dispatch one builtin by name. `None` means "no such builtin".
pub async fn invoke(name: &str, args: &Value, settings: &Settings) -> Option<Value> {
    let out = match name {
        "noop" => noop(args),
        "shell" => shell(args, settings).await,
        "read_file" => read_file(args, settings).await,
        "write_file" => write_file(args, settings).await,
        "http_fetch" => http_fetch(args, settings, None).await,
        "http_fetch_local" => http_fetch_local(args, settings).await,
        "git" => git(args, settings).await,
        "system_info" => system_info(settings),
        "models_refresh" => models_refresh(settings).await,
        _ => return None,
    };
    Some(out)
}

/// Always succeeds; echoes a single string back. The safe end-to-end probe.
fn noop(args: &Value) -> Value {
    match args.get("text") {
        None | Some(Value::Null) => json!({ "ok": true, "text": "" }),
        Some(Value::String(s)) => json!({ "ok": true, "text": s }),
        Some(_) => json!({ "ok": false, "error": "text must be a string" }),
    }
}

async fn shell(args: &Value, settings: &Settings) -> Value {
    if !settings.tools_allow_shell {
        return json!({ "ok": false, "error": "shell tool disabled" });
    }
    let Some(cmd) = args.get("cmd").and_then(Value::as_str).filter(|c| !c.trim().is_empty())
    else {
        return json!({ "ok": false, "error": "cmd must be a non-empty string" });
    };

    let allowed: Vec<&str> = settings
        .tools_shell_allowed_cmds
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if allowed.is_empty() {
        return json!({ "ok": false, "error": "shell tool not configured (tools_shell_allowed_cmds empty)" });
    }

    let parts: Vec<String> = cmd.split_whitespace().map(String::from).collect();
    let Some(exe) = parts.first() else {
        return json!({ "ok": false, "error": "cmd must be a non-empty string" });
    };
    if !allowed.contains(&exe.as_str()) {
        return json!({ "ok": false, "error": format!("command not allowed: {exe}") });
    }

    run_captured(
        parts,
        settings.tools_shell_cwd.clone(),
        settings.tools_shell_timeout_sec,
        settings,
    )
    .await
}

async fn git(args: &Value, settings: &Settings) -> Value {
    if !settings.tools_allow_git {
        return json!({ "ok": false, "error": "git tool disabled" });
    }
    let argv: Option<Vec<String>> = args.get("args").and_then(Value::as_array).map(|a| {
        a.iter().filter_map(|v| v.as_str()).map(String::from).collect()
    });
    let Some(argv) = argv.filter(|a| !a.is_empty() && a.iter().all(|s| !s.is_empty())) else {
        return json!({ "ok": false, "error": "args must be a non-empty list of strings" });
    };

    const ALLOWED_SUBCMDS: [&str; 6] = ["status", "diff", "log", "show", "rev-parse", "ls-files"];
    let subcmd = argv[0].trim();
    if !ALLOWED_SUBCMDS.contains(&subcmd) {
        return json!({ "ok": false, "error": format!("git subcommand not allowed: {subcmd}") });
    }

    let cwd = if settings.tools_git_cwd.trim().is_empty() {
        settings.tools_shell_cwd.clone()
    } else {
        settings.tools_git_cwd.trim().to_string()
    };

    let mut full = vec!["git".to_string()];
    full.extend(argv);
    run_captured(full, cwd, settings.tools_git_timeout_sec, settings).await
}

/// Shared captured-subprocess runner for shell/git: no stdin, bounded tails.
async fn run_captured(
    argv: Vec<String>,
    cwd: String,
    timeout_sec: u64,
    settings: &Settings,
) -> Value {
    if let Err(e) = std::fs::create_dir_all(&cwd) {
        return json!({ "ok": false, "error": format!("cwd not writable: {e}") });
    }
    let spec = SubprocessSpec { argv, timeout_sec: Some(timeout_sec as f64), cwd: Some(cwd) };
    let out = super::subprocess::run(&spec, &json!({}), settings).await;

    // shell/git report success whenever the command ran; the exit code is
    // data, not an error.
    if out.get("exit_code").map(|c| !c.is_null()).unwrap_or(false) {
        return json!({
            "ok": true,
            "returncode": out["exit_code"],
            "stdout": out["stdout"],
            "stderr": out["stderr"],
            "__io_bytes": out["__io_bytes"],
        });
    }
    out
}

fn fs_roots(settings: &Settings) -> Vec<PathBuf> {
    settings
        .tools_fs_roots
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Resolve a path against the configured roots; `None` when it escapes them.
/// Canonicalizes through the nearest existing ancestor so `..` cannot escape
/// even for paths that do not exist yet.
fn resolve_under_roots(path: &str, roots: &[PathBuf]) -> Option<PathBuf> {
    let p = PathBuf::from(path);
    let p = if p.is_absolute() { p } else { roots.first()?.join(p) };

    let canonical = p.canonicalize().ok().or_else(|| {
        let mut suffix = vec![p.file_name()?.to_os_string()];
        let mut ancestor = p.parent();
        while let Some(current) = ancestor {
            if let Ok(canon) = current.canonicalize() {
                let mut out = canon;
                for part in suffix.iter().rev() {
                    out.push(part);
                }
                return Some(out);
            }
            suffix.push(current.file_name()?.to_os_string());
            ancestor = current.parent();
        }
        None
    })?;

    for root in roots {
        if let Ok(root) = root.canonicalize() {
            if canonical.starts_with(&root) {
                return Some(canonical);
            }
        }
    }
    None
}

async fn read_file(args: &Value, settings: &Settings) -> Value {
    if !settings.tools_allow_fs {
        return json!({ "ok": false, "error": "fs tool disabled" });
    }
    let Some(path) = args.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) else {
        return json!({ "ok": false, "error": "path must be a non-empty string" });
    };
    let roots = fs_roots(settings);
    if roots.is_empty() {
        return json!({ "ok": false, "error": "fs tool not configured (tools_fs_roots empty)" });
    }
    let Some(resolved) = resolve_under_roots(path, &roots) else {
        return json!({ "ok": false, "error": "path outside allowed roots" });
    };

    let max_bytes = settings.tools_fs_max_bytes as usize;
    match tokio::fs::read(&resolved).await {
        Ok(data) => {
            let truncated = data.len() > max_bytes;
            let data = &data[..data.len().min(max_bytes)];
            json!({
                "ok": true,
                "path": resolved.to_string_lossy(),
                "truncated": truncated,
                "content": String::from_utf8_lossy(data),
                "__io_bytes": data.len(),
            })
        }
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

async fn write_file(args: &Value, settings: &Settings) -> Value {
    if !settings.tools_allow_fs {
        return json!({ "ok": false, "error": "fs tool disabled" });
    }
    if !settings.tools_allow_fs_write {
        return json!({ "ok": false, "error": "fs write disabled" });
    }
    let Some(path) = args.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) else {
        return json!({ "ok": false, "error": "path must be a non-empty string" });
    };
    let Some(content) = args.get("content").and_then(Value::as_str) else {
        return json!({ "ok": false, "error": "content must be a string" });
    };
    let roots = fs_roots(settings);
    if roots.is_empty() {
        return json!({ "ok": false, "error": "fs tool not configured (tools_fs_roots empty)" });
    }
    let Some(resolved) = resolve_under_roots(path, &roots) else {
        return json!({ "ok": false, "error": "path outside allowed roots" });
    };

    let bytes = content.as_bytes();
    if bytes.len() as u64 > settings.tools_fs_max_bytes {
        return json!({ "ok": false, "error": format!("content too large (>{} bytes)", settings.tools_fs_max_bytes) });
    }
    if let Some(parent) = resolved.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return json!({ "ok": false, "error": e.to_string() });
        }
    }
    match tokio::fs::write(&resolved, bytes).await {
        Ok(()) => json!({
            "ok": true,
            "path": resolved.to_string_lossy(),
            "__io_bytes": bytes.len(),
        }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

const LOCAL_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "::1"];

/// Fetch a URL via GET, hard-restricted to localhost. The safer variant for
/// internal self-checks (e.g. fetching /health).
async fn http_fetch_local(args: &Value, settings: &Settings) -> Value {
    let Some(url) = args.get("url").and_then(Value::as_str).filter(|u| !u.trim().is_empty())
    else {
        return json!({ "ok": false, "error": "url must be a non-empty string" });
    };
    let Some(host) = url_host(url) else {
        return json!({ "ok": false, "error": "url must include a hostname" });
    };
    if !LOCAL_HOSTS.contains(&host.as_str()) {
        return json!({ "ok": false, "error": format!("host not allowed: {host}") });
    }
    http_fetch(args, settings, Some(&LOCAL_HOSTS.map(String::from))).await
}

async fn http_fetch(args: &Value, settings: &Settings, override_hosts: Option<&[String]>) -> Value {
    if override_hosts.is_none() && !settings.tools_allow_http_fetch {
        return json!({ "ok": false, "error": "http_fetch tool disabled" });
    }
    let Some(url) = args.get("url").and_then(Value::as_str).filter(|u| !u.trim().is_empty())
    else {
        return json!({ "ok": false, "error": "url must be a non-empty string" });
    };
    let method = args.get("method").and_then(Value::as_str).unwrap_or("GET").trim().to_uppercase();
    if method != "GET" {
        return json!({ "ok": false, "error": "only GET is supported" });
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return json!({ "ok": false, "error": "only http/https URLs are allowed" });
    }
    let Some(host) = url_host(url) else {
        return json!({ "ok": false, "error": "url must include a hostname" });
    };

    let allowed: Vec<String> = match override_hosts {
        Some(hosts) => hosts.to_vec(),
        None => settings
            .tools_http_allowed_hosts
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect(),
    };
    if !allowed.contains(&host) {
        return json!({ "ok": false, "error": format!("host not allowed: {host}") });
    }

    let headers = match args.get("headers") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => {
            let mut out = Vec::with_capacity(map.len());
            for (k, v) in map {
                let Some(v) = v.as_str() else {
                    return json!({ "ok": false, "error": "headers must be an object of string:string" });
                };
                out.push((k.clone(), v.to_string()));
            }
            out
        }
        Some(_) => {
            return json!({ "ok": false, "error": "headers must be an object of string:string" })
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.tools_http_timeout_sec))
        .build()
    {
        Ok(c) => c,
        Err(e) => return json!({ "ok": false, "error": e.to_string() }),
    };

    let mut request = client.get(url);
    for (k, v) in headers {
        request = request.header(k, v);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return json!({ "ok": false, "error": e.to_string() }),
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let max_bytes = settings.tools_http_max_bytes as usize;
    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => return json!({ "ok": false, "error": e.to_string() }),
    };
    let truncated = body.len() >= max_bytes;
    let body = &body[..body.len().min(max_bytes)];

    match std::str::from_utf8(body) {
        Ok(text) => json!({
            "ok": true,
            "status": status,
            "content_type": content_type,
            "truncated": truncated,
            "body_text": text,
            "body_base64": null,
            "__io_bytes": body.len(),
        }),
        Err(_) => json!({
            "ok": true,
            "status": status,
            "content_type": content_type,
            "truncated": truncated,
            "body_text": null,
            "body_base64": base64::engine::general_purpose::STANDARD.encode(body),
            "__io_bytes": body.len(),
        }),
    }
}

fn url_host(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let authority = rest.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    // Bracketed IPv6 first, then host:port.
    let host = host.strip_prefix('[').and_then(|h| h.split(']').next()).unwrap_or_else(|| {
        host.split(':').next().unwrap_or(host)
    });
    let host = host.trim().to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn system_info(settings: &Settings) -> Value {
    if !settings.tools_allow_system_info {
        return json!({ "ok": false, "error": "system_info tool disabled" });
    }
    json!({
        "ok": true,
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "pid": std::process::id(),
        "cwd": std::env::current_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
        "features": {
            "tools_allow_shell": settings.tools_allow_shell,
            "tools_allow_fs": settings.tools_allow_fs,
            "tools_allow_http_fetch": settings.tools_allow_http_fetch,
            "tools_allow_git": settings.tools_allow_git,
        },
    })
}

async fn models_refresh(settings: &Settings) -> Value {
    if !settings.tools_allow_system_info {
        return json!({ "ok": false, "error": "models_refresh tool disabled" });
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.tools_http_timeout_sec))
        .build()
    {
        Ok(c) => c,
        Err(e) => return json!({ "ok": false, "error": e.to_string() }),
    };

    let mut ok = true;
    let mut upstreams = serde_json::Map::new();

    for (name, url) in [
        ("ollama", format!("{}/api/tags", settings.ollama_base_url.trim_end_matches('/'))),
        ("mlx", format!("{}/models", settings.mlx_base_url.trim_end_matches('/'))),
    ] {
        match client.get(&url).send().await {
            Ok(r) => {
                let status = r.status().as_u16();
                if status != 200 {
                    ok = false;
                }
                upstreams.insert(name.into(), json!({ "ok": status == 200, "status": status }));
            }
            Err(e) => {
                ok = false;
                upstreams.insert(name.into(), json!({ "ok": false, "error": e.to_string() }));
            }
        }
    }

    json!({ "ok": ok, "upstreams": upstreams })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn noop_echoes_text() {
        let out = invoke("noop", &json!({ "text": "x" }), &settings()).await.unwrap();
        assert_eq!(out, json!({ "ok": true, "text": "x" }));
        let out = invoke("noop", &json!({}), &settings()).await.unwrap();
        assert_eq!(out["text"], "");
        let out = invoke("noop", &json!({ "text": 42 }), &settings()).await.unwrap();
        assert_eq!(out["ok"], false);
    }

    #[tokio::test]
    async fn unknown_builtin_is_none() {
        assert!(invoke("nope", &json!({}), &settings()).await.is_none());
    }

    #[tokio::test]
    async fn disabled_tools_fail_closed() {
        let s = settings();
        for (name, args) in [
            ("shell", json!({ "cmd": "ls" })),
            ("read_file", json!({ "path": "/etc/hosts" })),
            ("write_file", json!({ "path": "x", "content": "y" })),
            ("http_fetch", json!({ "url": "http://127.0.0.1/" })),
            ("git", json!({ "args": ["status"] })),
            ("system_info", json!({})),
        ] {
            let out = invoke(name, &args, &s).await.unwrap();
            assert_eq!(out["ok"], false, "{name} should be disabled by default");
            assert!(out["error"].as_str().unwrap().contains("disabled"), "{name}");
        }
    }

    #[tokio::test]
    async fn shell_rejects_commands_outside_allowlist() {
        let mut s = settings();
        s.tools_allow_shell = true;
        s.tools_shell_allowed_cmds = "echo".into();
        s.tools_shell_cwd = std::env::temp_dir().join("gw-shell-test").to_string_lossy().into_owned();

        let out = invoke("shell", &json!({ "cmd": "rm -rf /" }), &s).await.unwrap();
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().contains("not allowed"));

        let out = invoke("shell", &json!({ "cmd": "echo hello" }), &s).await.unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["returncode"], 0);
        assert!(out["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn git_rejects_mutating_subcommands() {
        let mut s = settings();
        s.tools_allow_git = true;
        let out = invoke("git", &json!({ "args": ["push", "origin"] }), &s).await.unwrap();
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn read_file_respects_roots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inside.txt"), "contents").unwrap();

        let mut s = settings();
        s.tools_allow_fs = true;
        s.tools_fs_roots = dir.path().to_string_lossy().into_owned();

        let out = invoke("read_file", &json!({ "path": "inside.txt" }), &s).await.unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["content"], "contents");
        assert_eq!(out["truncated"], false);

        let out = invoke("read_file", &json!({ "path": "/etc/hostname" }), &s).await.unwrap();
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().contains("outside allowed roots"));

        let out = invoke("read_file", &json!({ "path": "../escape.txt" }), &s).await.unwrap();
        assert_eq!(out["ok"], false);
    }

    #[tokio::test]
    async fn read_file_truncates_at_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(100)).unwrap();

        let mut s = settings();
        s.tools_allow_fs = true;
        s.tools_fs_roots = dir.path().to_string_lossy().into_owned();
        s.tools_fs_max_bytes = 10;

        let out = invoke("read_file", &json!({ "path": "big.txt" }), &s).await.unwrap();
        assert_eq!(out["truncated"], true);
        assert_eq!(out["content"].as_str().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn write_file_round_trips_and_enforces_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings();
        s.tools_allow_fs = true;
        s.tools_allow_fs_write = true;
        s.tools_fs_roots = dir.path().to_string_lossy().into_owned();

        let out = invoke("write_file", &json!({ "path": "sub/out.txt", "content": "data" }), &s)
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(std::fs::read_to_string(dir.path().join("sub/out.txt")).unwrap(), "data");

        s.tools_fs_max_bytes = 2;
        let out = invoke("write_file", &json!({ "path": "big.txt", "content": "toolong" }), &s)
            .await
            .unwrap();
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().contains("too large"));
    }

    #[tokio::test]
    async fn http_fetch_enforces_method_scheme_and_host() {
        let mut s = settings();
        s.tools_allow_http_fetch = true;

        let out = invoke("http_fetch", &json!({ "url": "http://127.0.0.1/", "method": "POST" }), &s)
            .await
            .unwrap();
        assert!(out["error"].as_str().unwrap().contains("only GET"));

        let out = invoke("http_fetch", &json!({ "url": "ftp://127.0.0.1/" }), &s).await.unwrap();
        assert!(out["error"].as_str().unwrap().contains("http/https"));

        let out = invoke("http_fetch", &json!({ "url": "http://evil.example.com/" }), &s)
            .await
            .unwrap();
        assert!(out["error"].as_str().unwrap().contains("host not allowed"));
    }

    #[tokio::test]
    async fn http_fetch_local_only_allows_loopback() {
        let s = settings(); // note: works even when http_fetch is disabled
        let out = invoke("http_fetch_local", &json!({ "url": "http://example.com/" }), &s)
            .await
            .unwrap();
        assert!(out["error"].as_str().unwrap().contains("host not allowed"));
    }

    #[tokio::test]
    async fn http_fetch_reads_bounded_body() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello world"))
            .mount(&server)
            .await;

        let host_port = server.uri().strip_prefix("http://").unwrap().to_string();
        let mut s = settings();
        s.tools_allow_http_fetch = true;
        s.tools_http_allowed_hosts = "127.0.0.1".into();

        let out = invoke("http_fetch", &json!({ "url": format!("http://{host_port}/page") }), &s)
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["status"], 200);
        assert_eq!(out["body_text"], "hello world");
    }

    #[tokio::test]
    async fn system_info_reports_feature_flags() {
        let mut s = settings();
        s.tools_allow_system_info = true;
        s.tools_allow_git = true;
        let out = invoke("system_info", &json!({}), &s).await.unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["features"]["tools_allow_git"], true);
        assert_eq!(out["features"]["tools_allow_shell"], false);
    }

    #[test]
    fn url_host_parses_variants() {
        assert_eq!(url_host("http://example.com/x"), Some("example.com".into()));
        assert_eq!(url_host("https://Example.COM:8443/"), Some("example.com".into()));
        assert_eq!(url_host("http://user@host/"), Some("host".into()));
        assert_eq!(url_host("http://[::1]:8080/"), Some("::1".into()));
        assert_eq!(url_host("nope"), None);
    }
}
