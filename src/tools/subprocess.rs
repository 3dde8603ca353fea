//! Subprocess tool execution.
//!
//! Arguments are passed as canonical JSON on stdin; stdout and stderr are
//! captured with bounded tails; the child inherits the gateway's environment
//! and is killed when its timeout elapses (`kill_on_drop` guarantees cleanup
//! even on cancellation). Exit code 0 means `ok: true`; stdout is parsed as
//! JSON best-effort into `stdout_json`.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt as _;

use crate::{canonical::canonical_json, settings::Settings};

use super::registry::SubprocessSpec;

/// Run one subprocess tool to completion. Always returns a result envelope,
/// never an error — failures are `ok: false` payloads.
pub async fn run(spec: &SubprocessSpec, args: &Value, settings: &Settings) -> Value {
    if spec.argv.is_empty() {
        return json!({ "ok": false, "error": "invalid exec spec (argv)" });
    }

    let timeout_sec = spec
        .timeout_sec
        .filter(|t| *t > 0.0)
        .unwrap_or(settings.tools_shell_timeout_sec as f64);

    let (cwd, using_default_cwd) = match &spec.cwd {
        Some(c) if !c.trim().is_empty() => (c.trim().to_string(), false),
        _ => (settings.tools_shell_cwd.clone(), true),
    };

    let cwd = match std::fs::create_dir_all(&cwd) {
        Ok(()) => cwd,
        Err(e) if using_default_cwd => {
            // Fall back to a scratch dir when the configured default is not
            // writable; an explicit per-tool cwd failing is the tool's error.
            match tempfile::Builder::new().prefix("gateway-tools-").tempdir() {
                Ok(dir) => dir.keep().to_string_lossy().into_owned(),
                Err(_) => {
                    return json!({ "ok": false, "error": format!("cwd not writable: {e}") });
                }
            }
        }
        Err(e) => {
            return json!({ "ok": false, "error": format!("cwd not writable: {e}") });
        }
    };

    let stdin_text = canonical_json(args);
    let stdin_bytes = stdin_text.len() as u64;

    let mut command = tokio::process::Command::new(&spec.argv[0]);
    command
        .args(&spec.argv[1..])
        .current_dir(&cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return json!({ "ok": false, "error": format!("spawn failed: {e}"), "__io_bytes": stdin_bytes }),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(stdin_text.as_bytes()).await;
        // Dropping stdin closes the pipe so the child sees EOF.
    }

    let waited =
        tokio::time::timeout(Duration::from_secs_f64(timeout_sec), child.wait_with_output()).await;

    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return json!({ "ok": false, "error": format!("wait failed: {e}"), "__io_bytes": stdin_bytes })
        }
        Err(_) => {
            // The child handle was dropped with the timed-out future;
            // kill_on_drop reaps the process.
            return json!({
                "ok": false,
                "exit_code": null,
                "stdout": "",
                "stdout_json": null,
                "stderr": format!("timeout after {timeout_sec}s"),
                "__io_bytes": stdin_bytes,
            });
        }
    };

    let stdout = tail_chars(
        &String::from_utf8_lossy(&output.stdout),
        settings.tools_subprocess_stdout_max_chars.max(1),
    );
    let stderr = tail_chars(
        &String::from_utf8_lossy(&output.stderr),
        settings.tools_subprocess_stderr_max_chars.max(1),
    );

    let stdout_json: Value = match stdout.trim() {
        "" => Value::Null,
        s => serde_json::from_str(s).unwrap_or(Value::Null),
    };

    let exit_code = output.status.code();
    json!({
        "ok": exit_code == Some(0),
        "exit_code": exit_code,
        "stdout": stdout,
        "stdout_json": stdout_json,
        "stderr": stderr,
        "__io_bytes": stdin_bytes + stdout.len() as u64 + stderr.len() as u64,
    })
}

/// Keep the last `max_chars` characters of a capture.
fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

/// Cumulative CPU time of reaped children, in milliseconds. Best-effort:
/// concurrent tool executions may attribute each other's CPU, so deltas of
/// this value are reported but never enforced against budgets.
#[cfg(unix)]
pub fn children_cpu_ms() -> Option<f64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let usage = unsafe { usage.assume_init() };
    let to_ms = |tv: libc::timeval| tv.tv_sec as f64 * 1_000.0 + tv.tv_usec as f64 / 1_000.0;
    Some(to_ms(usage.ru_utime) + to_ms(usage.ru_stime))
}

#[cfg(not(unix))]
pub fn children_cpu_ms() -> Option<f64> {
    None
}
