//! Per-record vocabulary enrichment.
//!
//! For each vocabulary URI found in a record the orchestrator records the
//! URI itself, filters against the configured prefix whitelist, and then
//! resolves labels either from the local cache or from the vocabulary
//! service, following `skos:exactMatch` links for configured URI prefixes.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::cache::{CachedLabels, LabelCache};
use crate::document::FlatDocument;

/// Suffix of the field that records every seen vocabulary URI.
pub const URI_FIELD_SUFFIX: &str = "_uri_str_mv";

/// Enrichment service configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EnrichConfig {
    /// Vocabulary service base URL.
    pub base_url: String,
    /// URI prefixes eligible for enrichment.
    pub url_prefix_whitelist: Vec<String>,
    /// URI prefixes whose concepts have their `exactMatch` links followed.
    pub uri_prefix_exact_matches: Vec<String>,
}

/// HTTP access to the vocabulary service.
pub trait VocabularyClient {
    fn fetch_json(&self, url: &str) -> Result<String>;
}

impl VocabularyClient for metaline_core::Fetcher {
    fn fetch_json(&self, url: &str) -> Result<String> {
        let (_status, body) = self.get(url, &[])?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Orchestrates cache lookups, remote fetches and label accumulation.
pub struct Enricher<'a, C: LabelCache, V: VocabularyClient> {
    config: &'a EnrichConfig,
    cache: &'a C,
    client: &'a V,
}

impl<'a, C: LabelCache, V: VocabularyClient> Enricher<'a, C, V> {
    pub fn new(config: &'a EnrichConfig, cache: &'a C, client: &'a V) -> Self {
        Self {
            config,
            cache,
            client,
        }
    }

    /// Enrich `field` of `doc` with labels for `uri`.
    ///
    /// The URI lands in `<field>_uri_str_mv` whether or not enrichment
    /// succeeds; labels are appended without de-duplication.
    pub fn enrich(
        &self,
        source: &str,
        doc: &mut FlatDocument,
        uri: &str,
        field: &str,
    ) -> Result<()> {
        doc.append(&format!("{field}{URI_FIELD_SUFFIX}"), uri);

        if !self.whitelisted(uri) {
            log::debug!("{source}: vocabulary URI {uri} not whitelisted, skipped");
            return Ok(());
        }

        let fetch_url = self.fetch_url(uri);
        if let Some(hit) = self.cache.get(&fetch_url) {
            for label in hit.labels() {
                doc.append(field, label);
            }
            return Ok(());
        }

        let mut pref_labels = Vec::new();
        let mut alt_labels = Vec::new();

        let graph = self.fetch_graph(&fetch_url)?;
        if let Some(concept) = concept_with_uri(&graph, uri) {
            alt_labels.extend(label_values(concept, "altLabel"));

            if self.follows_exact_matches(uri) {
                for matched_uri in exact_match_uris(concept) {
                    let matched_graph = self.fetch_graph(&self.fetch_url(&matched_uri))?;
                    if let Some(matched) = concept_with_uri(&matched_graph, &matched_uri) {
                        alt_labels.extend(label_values(matched, "altLabel"));
                        pref_labels.extend(label_values(matched, "prefLabel"));
                    }
                }
            }
        }

        for label in pref_labels.iter().chain(&alt_labels) {
            doc.append(field, label.clone());
        }
        self.cache.put(
            &fetch_url,
            CachedLabels {
                pref_labels: pref_labels.join("|"),
                alt_labels: alt_labels.join("|"),
            },
        )?;
        Ok(())
    }

    fn whitelisted(&self, uri: &str) -> bool {
        self.config
            .url_prefix_whitelist
            .iter()
            .any(|p| uri.starts_with(p.as_str()))
    }

    fn follows_exact_matches(&self, uri: &str) -> bool {
        self.config
            .uri_prefix_exact_matches
            .iter()
            .any(|p| uri.starts_with(p.as_str()))
    }

    /// Canonical fetch URL, also the cache key.
    fn fetch_url(&self, uri: &str) -> String {
        format!(
            "{}/data?format=application%2Fjson&uri={}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(uri)
        )
    }

    fn fetch_graph(&self, url: &str) -> Result<Vec<Value>> {
        let body = self.client.fetch_json(url)?;
        let json: Value = serde_json::from_str(&body).context("invalid vocabulary JSON")?;
        Ok(json
            .get("graph")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn is_concept(item: &Value) -> bool {
    match item.get("type") {
        Some(Value::String(s)) => s.as_str() == "skos:Concept",
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("skos:Concept")),
        _ => false,
    }
}

fn concept_with_uri<'g>(graph: &'g [Value], uri: &str) -> Option<&'g Value> {
    graph
        .iter()
        .find(|item| is_concept(item) && item.get("uri").and_then(Value::as_str) == Some(uri))
}

/// Label values under `key`, which may be a single object, an array of
/// objects, or a bare string.
fn label_values(item: &Value, key: &str) -> Vec<String> {
    match item.get(key) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Object(o)) => o
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .into_iter()
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                other => other
                    .get("value")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn exact_match_uris(item: &Value) -> Vec<String> {
    match item.get("exactMatch") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                other => other
                    .get("uri")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(other) => other
            .get("uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}
