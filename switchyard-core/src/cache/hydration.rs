//! Cache snapshots.
//!
//! A snapshot maps canonical cache keys to the last known value of each
//! entry. Server-rendered markup embeds it as one or more inline JSON script
//! blocks, which the client merges back into its cache at startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, Result};

const SCRIPT_OPEN: &str = r#"<script type="application/json" data-switchyard-cache>"#;
const SCRIPT_CLOSE: &str = "</script>";

/// Canonical cache key -> value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Add every entry of `other`, replacing entries with the same key.
    pub fn merge(&mut self, other: Snapshot) {
        self.0.extend(other.0);
    }

    /// MessagePack encoding, for snapshots kept outside of markup.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|err| CoreError::Serialization(err.to_string()))
    }
}

impl IntoIterator for Snapshot {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Render `snapshot` as an inline script block.
///
/// `<` is escaped as a JSON unicode escape so no value can close the block
/// early.
pub fn render_script(snapshot: &Snapshot) -> Result<String> {
    let json = serde_json::to_string(snapshot)?.replace('<', "\\u003c");
    Ok(format!("{SCRIPT_OPEN}{json}{SCRIPT_CLOSE}"))
}

/// Collect and merge every snapshot block found in `html`. Later blocks win
/// on duplicate keys. Blocks that fail to parse are skipped.
pub fn extract_scripts(html: &str) -> Snapshot {
    let mut merged = Snapshot::new();
    let mut rest = html;
    while let Some(start) = rest.find(SCRIPT_OPEN) {
        let body = &rest[start + SCRIPT_OPEN.len()..];
        let Some(end) = body.find(SCRIPT_CLOSE) else {
            break;
        };
        match serde_json::from_str::<Snapshot>(&body[..end]) {
            Ok(snapshot) => merged.merge(snapshot),
            Err(err) => warn!(error = %err, "skipping malformed cache snapshot block"),
        }
        rest = &body[end + SCRIPT_CLOSE.len()..];
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(entries: &[(&str, Value)]) -> Snapshot {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn script_blocks_escape_markup() {
        let rendered = render_script(&snapshot(&[(r#""a""#, json!("</script><b>"))])).unwrap();
        assert_eq!(rendered.matches("</script>").count(), 1);
        assert!(rendered.ends_with("</script>"));

        let parsed = extract_scripts(&rendered);
        assert_eq!(parsed.get(r#""a""#), Some(&json!("</script><b>")));
    }

    #[test]
    fn blocks_are_merged_in_document_order() {
        let first = render_script(&snapshot(&[("k1", json!(1)), ("k2", json!(2))])).unwrap();
        let second = render_script(&snapshot(&[("k2", json!(20))])).unwrap();
        let broken = format!("{SCRIPT_OPEN}{{not json{SCRIPT_CLOSE}");
        let html = format!("<html><body>{first}<p>text</p>{broken}{second}</body></html>");

        let merged = extract_scripts(&html);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("k1"), Some(&json!(1)));
        assert_eq!(merged.get("k2"), Some(&json!(20)));
    }

    #[test]
    fn msgpack_keeps_nested_values() {
        let original = snapshot(&[(r#""Catalog","list""#, json!([{"id": 1, "tags": ["a"]}]))]);
        let bytes = original.to_msgpack().unwrap();
        assert_eq!(Snapshot::from_msgpack(&bytes).unwrap(), original);
        assert!(Snapshot::from_msgpack(&[0xc1]).is_err());
    }
}
