//! Label cache interface.
//!
//! The production cache is database-backed and external; entries are
//! immutable once written and idempotent on key, so concurrent writers are
//! harmless. An in-memory implementation is provided for tests and small
//! runs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

/// Cached labels for one vocabulary fetch URL, pipe-delimited.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CachedLabels {
    pub pref_labels: String,
    pub alt_labels: String,
}

impl CachedLabels {
    /// All labels, split on the `|` delimiter.
    pub fn labels(&self) -> Vec<String> {
        self.pref_labels
            .split('|')
            .chain(self.alt_labels.split('|'))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Lookup keyed by the canonical vocabulary fetch URL.
pub trait LabelCache {
    fn get(&self, url: &str) -> Option<CachedLabels>;
    fn put(&self, url: &str, labels: CachedLabels) -> Result<()>;
}

/// In-memory cache.
#[derive(Debug, Default)]
pub struct MemoryLabelCache {
    entries: Mutex<HashMap<String, CachedLabels>>,
}

impl LabelCache for MemoryLabelCache {
    fn get(&self, url: &str) -> Option<CachedLabels> {
        self.entries.lock().unwrap().get(url).cloned()
    }

    fn put(&self, url: &str, labels: CachedLabels) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(url.to_string(), labels);
        Ok(())
    }
}
