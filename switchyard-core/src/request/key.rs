//! Path keys and canonical cache keys.
//!
//! A cache key is the canonical serialization of a request's path followed by
//! its arguments. Every element is written as JSON with object keys sorted,
//! elements joined by `,`. Because path segments are written as quoted JSON
//! strings, a prefix key can only match whole segments: `"Client1"` is not a
//! prefix of `"Client12"`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// A single path segment.
///
/// Keys always have a stable string identity so the same key serializes
/// identically in every process that renders or hydrates a cache.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    /// Create a key from its string identity.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The string identity of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&String> for Key {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical, key-order independent identity of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a full request (path and arguments).
    pub fn for_request(path: &[Key], args: &[Value]) -> Self {
        let mut out = String::new();
        for (i, key) in path.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_string(key.as_str(), &mut out);
        }
        for arg in args {
            if !out.is_empty() {
                out.push(',');
            }
            write_canonical(arg, &mut out);
        }
        Self(out)
    }

    /// Build the key for a path prefix. Matches every request beneath it.
    pub fn for_prefix(path: &[Key]) -> Self {
        Self::for_request(path, &[])
    }

    /// Wrap an already canonical key, e.g. one read back from a snapshot.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Whether `self` lies beneath `prefix`.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The canonical string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the canonical string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value::String's Display is the quoted, escaped JSON form.
    out.push_str(&Value::String(s.to_owned()).to_string());
}
