//! Metaline OAI - incremental OAI-PMH harvester
//!
//! Drives the server-issued resumption-token cursor over ListRecords /
//! ListIdentifiers, tolerates malformed repositories, and hands records to a
//! downstream callback with upsert/delete semantics.
//!
//! # Example
//!
//! ```ignore
//! use metaline_oai::{Harvester, HttpBackend, MemoryState};
//!
//! let backend = HttpBackend::new(&config.url, &fetcher);
//! let mut harvester = Harvester::new("example", &config, &backend)?;
//! let summary = harvester.harvest(None, None, &mut state, &mut |envelope| {
//!     Ok(sink.store(envelope)?)
//! })?;
//! ```

pub mod config;
pub mod dom;
pub mod error;
pub mod harvester;
pub mod ident;
pub mod response;
pub mod state;

// Re-exports
pub use config::{GranularitySetting, SourceConfig};
pub use error::HarvestError;
pub use harvester::{
    Granularity, Harvester, HttpBackend, OaiBackend, RecordEnvelope, RecordHandler, Summary,
};
pub use ident::IdNormalizer;
pub use response::ResponseTransform;
pub use state::{FileState, HarvestState, MemoryState};
