//! Process-wide counters rendered as Prometheus text.
//!
//! Deliberately dependency-free: a mutex-guarded map of counters and a
//! hand-rendered exposition, which is all the internal listener needs. Label
//! cardinality stays bounded because paths come from the fixed route table
//! and tool names from the declared registry.

use std::{collections::HashMap, sync::Mutex};

/// Coarse runtime buckets for tool invocations, in milliseconds.
const TOOL_BUCKETS_MS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];
/// Sentinel bucket bound rendered as `+Inf`.
const BUCKET_INF: u64 = 10_000_000;

#[derive(Default)]
struct Inner {
    req_count: HashMap<(String, u16), u64>,
    req_dur_ms_sum: HashMap<(String, u16), f64>,
    tool_count: HashMap<(String, &'static str), u64>,
    tool_runtime_ms_sum: HashMap<(String, &'static str), f64>,
    tool_runtime_ms_bucket: HashMap<(String, &'static str, u64), u64>,
}

/// Shared metrics sink. All observers are best-effort and never fail the
/// request path.
pub struct Metrics {
    enabled: bool,
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, inner: Mutex::new(Inner::default()) }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record one completed HTTP request.
    pub fn observe_request(&self, path: &str, status: u16, duration_ms: f64) {
        if !self.enabled || path.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("metrics poisoned");
        let key = (path.to_string(), status);
        *inner.req_count.entry(key.clone()).or_default() += 1;
        *inner.req_dur_ms_sum.entry(key).or_default() += duration_ms.max(0.0);
    }

    /// Record one tool invocation with its runtime histogram buckets.
    pub fn observe_tool(&self, tool: &str, ok: bool, runtime_ms: f64) {
        if !self.enabled || tool.is_empty() {
            return;
        }
        let status = if ok { "ok" } else { "error" };
        let runtime_ms = runtime_ms.max(0.0);
        let mut inner = self.inner.lock().expect("metrics poisoned");
        *inner.tool_count.entry((tool.to_string(), status)).or_default() += 1;
        *inner.tool_runtime_ms_sum.entry((tool.to_string(), status)).or_default() += runtime_ms;
        for le in TOOL_BUCKETS_MS {
            if runtime_ms <= le as f64 {
                *inner
                    .tool_runtime_ms_bucket
                    .entry((tool.to_string(), status, le))
                    .or_default() += 1;
            }
        }
        *inner
            .tool_runtime_ms_bucket
            .entry((tool.to_string(), status, BUCKET_INF))
            .or_default() += 1;
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        let inner = self.inner.lock().expect("metrics poisoned");
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("# gateway_metrics_generated {}", crate::ids::now_unix()));

        lines.push("# TYPE gateway_requests_total counter".into());
        let mut rows: Vec<_> = inner.req_count.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for ((path, status), n) in rows {
            lines.push(format!(
                "gateway_requests_total{{path=\"{}\",status=\"{status}\"}} {n}",
                escape_label(path)
            ));
        }

        lines.push("# TYPE gateway_request_duration_ms_sum counter".into());
        let mut rows: Vec<_> = inner.req_dur_ms_sum.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for ((path, status), sum) in rows {
            lines.push(format!(
                "gateway_request_duration_ms_sum{{path=\"{}\",status=\"{status}\"}} {sum:.1}",
                escape_label(path)
            ));
        }

        lines.push("# TYPE gateway_tool_invocations_total counter".into());
        let mut rows: Vec<_> = inner.tool_count.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for ((tool, status), n) in rows {
            lines.push(format!(
                "gateway_tool_invocations_total{{tool=\"{}\",status=\"{status}\"}} {n}",
                escape_label(tool)
            ));
        }

        lines.push("# TYPE gateway_tool_runtime_ms_sum counter".into());
        let mut rows: Vec<_> = inner.tool_runtime_ms_sum.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for ((tool, status), sum) in rows {
            lines.push(format!(
                "gateway_tool_runtime_ms_sum{{tool=\"{}\",status=\"{status}\"}} {sum:.1}",
                escape_label(tool)
            ));
        }

        lines.push("# TYPE gateway_tool_runtime_ms_bucket counter".into());
        let mut rows: Vec<_> = inner.tool_runtime_ms_bucket.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for ((tool, status, le), n) in rows {
            let le_label =
                if *le == BUCKET_INF { "+Inf".to_string() } else { le.to_string() };
            lines.push(format!(
                "gateway_tool_runtime_ms_bucket{{tool=\"{}\",status=\"{status}\",le=\"{le_label}\"}} {n}",
                escape_label(tool)
            ));
        }

        lines.join("\n") + "\n"
    }
}

fn escape_label(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
