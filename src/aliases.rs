//! Model aliases — user-visible routing names.
//!
//! An alias (`fast`, `coder`, `long`, `default`, …) resolves to a concrete
//! `(backend, upstream_model)` pair plus optional caps. The table is built
//! once at startup: defaults derived from [`Settings`], then overlaid from
//! inline JSON (`model_aliases_json`) or a JSON file (`model_aliases_path`).
//! Lookup is case-insensitive on the alias key. Entries that fail to parse
//! are ignored rather than treated as errors, so an experimental alias in the
//! file cannot take the gateway down.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::settings::{Backend, Settings};

/// One named routing shortcut.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAlias {
    pub backend: Backend,
    pub upstream_model: String,
    pub context_window: Option<usize>,
    /// `Some(false)` refuses tool-bearing requests at entry.
    pub tools: Option<bool>,
    pub max_tokens_cap: Option<u64>,
    pub temperature_cap: Option<f64>,
}

impl ModelAlias {
    fn plain(backend: Backend, upstream_model: impl Into<String>) -> Self {
        Self {
            backend,
            upstream_model: upstream_model.into(),
            context_window: None,
            tools: None,
            max_tokens_cap: None,
            temperature_cap: None,
        }
    }
}

/// Immutable alias table, keyed by lowercase alias name.
#[derive(Debug, Default)]
pub struct AliasTable {
    aliases: HashMap<String, ModelAlias>,
}

impl AliasTable {
    /// Build the table: Settings-derived defaults, then the JSON overlay
    /// (inline JSON wins over the file).
    pub fn load(settings: &Settings) -> Self {
        let mut aliases = default_aliases(settings);

        let payload: Option<Value> = if !settings.model_aliases_json.trim().is_empty() {
            serde_json::from_str(settings.model_aliases_json.trim())
                .map_err(|e| warn!(error = %e, "model_aliases_json unparseable, ignoring"))
                .ok()
        } else if !settings.model_aliases_path.trim().is_empty() {
            std::fs::read_to_string(settings.model_aliases_path.trim())
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
        } else {
            None
        };

        // Accept both `{"aliases": {...}}` and a bare alias map.
        let payload = payload.map(|p| match p.get("aliases") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => p,
        });

        if let Some(Value::Object(map)) = payload {
            for (key, value) in map {
                if let Some(alias) = parse_alias_value(&value) {
                    aliases.insert(key.trim().to_lowercase(), alias);
                }
            }
        }

        Self { aliases }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&ModelAlias> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        self.aliases.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModelAlias)> {
        self.aliases.iter()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// The canonical policy surface: these four names are what the router's
/// heuristics reach for.
fn default_aliases(settings: &Settings) -> HashMap<String, ModelAlias> {
    let default_backend = settings.default_backend;
    let mut out = HashMap::new();
    out.insert(
        "default".to_string(),
        ModelAlias {
            tools: Some(true),
            ..ModelAlias::plain(default_backend, settings.strong_model(default_backend))
        },
    );
    out.insert(
        "fast".to_string(),
        ModelAlias {
            tools: Some(false),
            ..ModelAlias::plain(default_backend, settings.fast_model(default_backend))
        },
    );
    out.insert(
        "coder".to_string(),
        ModelAlias {
            tools: Some(true),
            ..ModelAlias::plain(Backend::Ollama, settings.ollama_model_strong.clone())
        },
    );
    out.insert(
        "long".to_string(),
        ModelAlias {
            context_window: Some(settings.router_long_context_chars),
            tools: Some(false),
            ..ModelAlias::plain(Backend::Mlx, settings.mlx_model_strong.clone())
        },
    );
    out
}

/// Parse one alias value. Accepts the string form `"<backend>:<model>"` and
/// the object form `{"backend": …, "model": …, …}`. Returns `None` for
/// anything unrecognised.
fn parse_alias_value(value: &Value) -> Option<ModelAlias> {
    if let Some(s) = value.as_str() {
        let s = s.trim();
        let (backend_str, model) = s.split_once(':')?;
        let backend = Backend::parse(backend_str)?;
        if model.is_empty() {
            return None;
        }
        return Some(ModelAlias::plain(backend, model));
    }

    let obj = value.as_object()?;
    let backend = Backend::parse(obj.get("backend")?.as_str()?)?;
    let mut model = obj
        .get("model")
        .or_else(|| obj.get("upstream_model"))?
        .as_str()?
        .trim()
        .to_string();
    if model.is_empty() {
        return None;
    }
    // A redundant backend prefix in the model string is folded away.
    for prefix in ["ollama:", "mlx:"] {
        if let Some(stripped) = model.strip_prefix(prefix) {
            model = stripped.to_string();
        }
    }

    let context_window = ["context", "context_window", "window"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_u64)
        .filter(|&v| v > 0)
        .map(|v| v as usize);
    let tools = obj.get("tools").and_then(Value::as_bool);
    let max_tokens_cap = ["max_tokens_cap", "max_tokens", "max_output_tokens"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_u64)
        .filter(|&v| v > 0);
    let temperature_cap = ["temperature_cap", "temp_cap"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_f64)
        .filter(|&v| v >= 0.0);

    Some(ModelAlias {
        backend,
        upstream_model: model,
        context_window,
        tools,
        max_tokens_cap,
        temperature_cap,
    })
}
