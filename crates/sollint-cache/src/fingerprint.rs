use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sollint_core::Result;
use std::path::{Component, Path, PathBuf};

/// SHA-256 hex digest of source text.
pub fn hash_content(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// SHA-256 hex digest of a configuration value.
///
/// The value is serialized to JSON with object keys sorted at every level,
/// so two configurations that differ only in key order hash the same.
pub fn hash_config<C: Serialize + ?Sized>(config: &C) -> Result<String> {
    let value = serde_json::to_value(config)?;
    let canonical = serde_json::to_string(&canonicalize(value))?;
    Ok(hash_bytes(canonical.as_bytes()))
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Canonical cache key for a file path: repeated separators and `.`
/// components collapse, trailing separators are dropped.
pub fn normalize_path(path: impl AsRef<Path>) -> String {
    let mut out = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir if out.as_os_str().is_empty() => out.push("."),
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().into_owned()
}
