//! Metaline Enrich - vocabulary enrichment for harvested records
//!
//! Resolves SKOS concept URIs found in flat documents to their preferred and
//! alternate labels, with a local cache in front of the vocabulary service.

pub mod cache;
pub mod document;
pub mod enricher;

// Re-exports
pub use cache::{CachedLabels, LabelCache, MemoryLabelCache};
pub use document::FlatDocument;
pub use enricher::{EnrichConfig, Enricher, URI_FIELD_SUFFIX, VocabularyClient};
