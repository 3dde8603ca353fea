//! Identifier minting, timestamps, and SSE wire encoding.
//!
//! Every identifier the gateway mints (`req-…`, `tool-…`, `run-…`,
//! `chatcmpl-…`) is `"{prefix}-{24 hex chars}"` — short enough for log lines,
//! random enough that collisions are a non-concern, and safe to embed in
//! filenames (replay and transcript files are keyed by these ids).

use bytes::Bytes;
use serde_json::Value;

/// Mint a fresh identifier with the given prefix, e.g. `new_id("tool")` →
/// `"tool-3f9a60c1d24b85e7a0f41c22"`.
pub fn new_id(prefix: &str) -> String {
    let raw: [u8; 12] = rand::random();
    format!("{prefix}-{}", hex::encode(raw))
}

/// Current unix time in whole seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Encode one SSE event: `data: <compact json>\n\n`.
///
/// Compact separators are load-bearing — clients and tests match on the exact
/// byte framing, and `serde_json::to_string` emits no whitespace.
pub fn sse_event(data: &Value) -> Bytes {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

/// The stream terminator. Exactly one of these ends every chat stream.
pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Terminator as [`Bytes`] for channel senders.
pub fn sse_done() -> Bytes {
    Bytes::from_static(SSE_DONE)
}
