//! On-disk declared-tool registry.
//!
//! Tools beyond the builtins are declared in an infra-owned JSON file — this
//! is *not* discovery; an entry must carry a name, a version, a parameter
//! schema and a subprocess exec spec to be loadable. The file is re-read only
//! when its mtime changes, and when `tools_registry_sha256` is configured a
//! digest mismatch discards the registry entirely.
//!
//! Expected format:
//! ```json
//! {"tools": [
//!   {
//!     "name": "my_tool",
//!     "version": "1",
//!     "description": "…",
//!     "parameters": { "type": "object", "properties": {}, "required": [] },
//!     "exec": {"type": "subprocess", "argv": ["/usr/local/bin/my-tool"],
//!              "timeout_sec": 10, "cwd": "/tmp"}
//!   }
//! ]}
//! ```

use std::{
    collections::HashMap,
    path::Path,
    sync::Mutex,
    time::SystemTime,
};

use serde_json::Value;
use tracing::warn;

use crate::canonical::sha256_hex;

/// Subprocess execution spec for a registry tool.
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub argv: Vec<String>,
    pub timeout_sec: Option<f64>,
    pub cwd: Option<String>,
}

/// One declared external tool.
#[derive(Debug, Clone)]
pub struct RegistryTool {
    pub name: String,
    pub version: String,
    pub description: String,
    pub parameters: Value,
    pub exec: SubprocessSpec,
}

#[derive(Default)]
struct Cache {
    mtime: Option<SystemTime>,
    tools: HashMap<String, RegistryTool>,
}

/// mtime-cached registry loader.
pub struct ToolRegistry {
    path: String,
    expected_sha256: String,
    cache: Mutex<Cache>,
    warned_mismatch: Mutex<bool>,
}

impl ToolRegistry {
    pub fn new(path: String, expected_sha256: String) -> Self {
        Self {
            path,
            expected_sha256: expected_sha256.trim().to_lowercase(),
            cache: Mutex::new(Cache::default()),
            warned_mismatch: Mutex::new(false),
        }
    }

    /// Current declared tools. Missing or invalid registry means no external
    /// tools — never an error.
    pub fn tools(&self) -> HashMap<String, RegistryTool> {
        let path = self.path.trim();
        if path.is_empty() {
            return HashMap::new();
        }

        let Ok(meta) = std::fs::metadata(path) else {
            return HashMap::new();
        };
        let mtime = meta.modified().ok();

        {
            let cache = self.cache.lock().expect("registry cache poisoned");
            if cache.mtime.is_some() && cache.mtime == mtime {
                return cache.tools.clone();
            }
        }

        let tools = self.load(Path::new(path));
        let mut cache = self.cache.lock().expect("registry cache poisoned");
        cache.mtime = mtime;
        cache.tools = tools.clone();
        tools
    }

    pub fn get(&self, name: &str) -> Option<RegistryTool> {
        self.tools().get(name).cloned()
    }

    fn load(&self, path: &Path) -> HashMap<String, RegistryTool> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return HashMap::new();
        };

        if !self.expected_sha256.is_empty() {
            let actual = sha256_hex(&raw);
            if actual != self.expected_sha256 {
                let mut warned = self.warned_mismatch.lock().expect("warn flag poisoned");
                if !*warned {
                    warn!(
                        expected = %self.expected_sha256,
                        actual = %actual,
                        "tools registry sha256 mismatch, ignoring registry"
                    );
                    *warned = true;
                }
                return HashMap::new();
            }
        }

        let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
            return HashMap::new();
        };
        let Some(items) = payload.get("tools").and_then(Value::as_array) else {
            return HashMap::new();
        };

        let mut out = HashMap::new();
        for item in items {
            let Some(tool) = parse_entry(item) else { continue };
            out.insert(tool.name.clone(), tool);
        }
        out
    }
}

/// Parse one registry entry, or `None` when any required part is missing.
fn parse_entry(item: &Value) -> Option<RegistryTool> {
    let name = item.get("name")?.as_str()?.trim();
    let version = item.get("version")?.as_str()?.trim();
    if name.is_empty() || version.is_empty() {
        return None;
    }
    let parameters = item.get("parameters")?.as_object()?;

    let exec = item.get("exec")?.as_object()?;
    if exec.get("type").and_then(Value::as_str) != Some("subprocess") {
        return None;
    }
    let argv: Vec<String> = exec
        .get("argv")?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(String::from))
        .collect::<Option<Vec<_>>>()?;
    if argv.is_empty() || argv.iter().any(String::is_empty) {
        return None;
    }

    Some(RegistryTool {
        name: name.to_string(),
        version: version.to_string(),
        description: item
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        parameters: Value::Object(parameters.clone()),
        exec: SubprocessSpec {
            argv,
            timeout_sec: exec.get("timeout_sec").and_then(Value::as_f64),
            cwd: exec.get("cwd").and_then(Value::as_str).map(String::from),
        },
    })
}
