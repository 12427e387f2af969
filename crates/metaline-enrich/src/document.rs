//! Flat multi-value documents, the shape the downstream indexer consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Field → ordered values map produced by record drivers and enrichment.
///
/// Values are not de-duplicated here; the indexer normalizes.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatDocument(BTreeMap<String, Vec<String>>);

impl FlatDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, field: &str, value: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(value.into());
    }

    pub fn values(&self, field: &str) -> &[String] {
        self.0.get(field).map_or(&[], Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_keeps_order_and_duplicates() {
        let mut doc = FlatDocument::new();
        doc.append("topic", "a");
        doc.append("topic", "b");
        doc.append("topic", "a");
        assert_eq!(doc.values("topic"), ["a", "b", "a"]);
    }

    #[test]
    fn missing_field_is_empty() {
        let doc = FlatDocument::new();
        assert!(doc.values("nope").is_empty());
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut doc = FlatDocument::new();
        doc.append("title", "Atlas");
        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, r#"{"title":["Atlas"]}"#);
        let back: FlatDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
