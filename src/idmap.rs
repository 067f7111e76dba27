//! Append-only mapping from batch-local ids to server-assigned ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `local_id -> remote_id`, grown as resources are created.
///
/// The map only ever grows; a local id absent after the create phase means
/// that resource was never created on the server. This is the single source
/// of truth both phases consult.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap {
    entries: BTreeMap<String, String>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly assigned remote id. Local ids are unique within a
    /// batch, so recording the same id twice indicates a caller bug; the
    /// first mapping wins and the duplicate is ignored.
    pub fn record(&mut self, local_id: impl Into<String>, remote_id: impl Into<String>) {
        self.entries.entry(local_id.into()).or_insert_with(|| remote_id.into());
    }

    pub fn resolve(&self, local_id: &str) -> Option<&str> {
        self.entries.get(local_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All recorded pairs, sorted by local id.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_resolve() {
        let mut map = IdMap::new();
        map.record("res-1", "srv_001");
        assert_eq!(map.resolve("res-1"), Some("srv_001"));
        assert_eq!(map.resolve("res-2"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_first_mapping_wins() {
        let mut map = IdMap::new();
        map.record("res-1", "srv_001");
        map.record("res-1", "srv_999");
        assert_eq!(map.resolve("res-1"), Some("srv_001"));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut map = IdMap::new();
        map.record("a", "srv_a");
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["a"], "srv_a");
    }
}
