//! Request instrumentation — NDJSON event log and stream metrics.
//!
//! One line per completed request. Streaming responses are measured during
//! body iteration (time to first token, chunk and byte counts, abort reason);
//! non-streams record a plain duration. Writing is best-effort: a full disk
//! or unwritable path never fails the user-visible request.

use std::{
    path::PathBuf,
    time::Instant,
};

use serde_json::Value;

use crate::{canonical::canonical_json, tools::truncate_value};

/// Best-effort NDJSON request logger.
pub struct RequestLog {
    enabled: bool,
    path: PathBuf,
}

impl RequestLog {
    pub fn new(enabled: bool, path: impl Into<PathBuf>) -> Self {
        Self { enabled, path: path.into() }
    }

    /// Append one event. String values are bounded; errors are swallowed.
    pub fn write(&self, event: Value) {
        if !self.enabled || self.path.as_os_str().is_empty() {
            return;
        }
        let bounded = match event {
            Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, truncate_value(v, 20_000))).collect(),
            ),
            other => other,
        };
        let line = canonical_json(&bounded);
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            use std::io::Write as _;
            let mut file =
                std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::debug!(error = %e, "request log write failed");
        }
    }
}

/// Measurements taken while iterating a streamed response body.
pub struct StreamMetrics {
    started: Instant,
    first_chunk: Option<Instant>,
    chunks: u64,
    bytes: u64,
    pub abort_reason: Option<String>,
}

impl StreamMetrics {
    pub fn new(started: Instant) -> Self {
        Self { started, first_chunk: None, chunks: 0, bytes: 0, abort_reason: None }
    }

    pub fn on_chunk(&mut self, len: usize) {
        if self.first_chunk.is_none() {
            self.first_chunk = Some(Instant::now());
        }
        self.chunks += 1;
        self.bytes += len as u64;
    }

    /// Fields to merge into the request event when the stream finishes.
    pub fn finish(&self) -> Value {
        let mut out = serde_json::json!({
            "stream": true,
            "duration_ms": round1(self.started.elapsed().as_secs_f64() * 1_000.0),
            "chunks_out": self.chunks,
            "bytes_out": self.bytes,
        });
        if let Some(first) = self.first_chunk {
            out["ttft_ms"] =
                serde_json::json!(round1(first.duration_since(self.started).as_secs_f64() * 1_000.0));
        }
        if let Some(reason) = &self.abort_reason {
            out["abort_reason"] = serde_json::json!(reason);
        }
        out
    }
}

pub(crate) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
