//! Fatal harvest errors.
//!
//! Everything here stops the harvest for the affected source; recoverable
//! conditions (record without header or metadata) are logged and skipped at
//! the point of occurrence.

use std::path::PathBuf;

use metaline_core::FetchError;

#[derive(Debug)]
pub enum HarvestError {
    /// All HTTP retries exhausted.
    Transport(FetchError),
    /// Response stayed unparseable even after encoding repair.
    Malformed { errors: String, dump: PathBuf },
    /// Server-reported protocol error (tolerated `noRecordsMatch` excepted).
    Oai { code: String, message: String },
    /// The same resumption token kept coming back.
    StuckResumptionToken { token: String, seen: u32 },
    /// Configured response transform failed.
    Transform(anyhow::Error),
    /// A date that should be in OAI format was not.
    BadDate(String),
    /// Shutdown was requested mid-harvest.
    Cancelled,
    /// The record callback failed.
    Sink(anyhow::Error),
    /// The harvest-state store failed.
    State(anyhow::Error),
    /// Invalid per-source configuration.
    Config(String),
}

impl std::fmt::Display for HarvestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Malformed { errors, dump } => write!(
                f,
                "malformed OAI response ({errors}); raw payload written to {}",
                dump.display()
            ),
            Self::Oai { code, message } => write!(f, "OAI-PMH error {code}: {message}"),
            Self::StuckResumptionToken { token, seen } => write!(
                f,
                "resumption token {token:?} returned {seen} times in a row, aborting"
            ),
            Self::Transform(e) => write!(f, "response transform failed: {e}"),
            Self::BadDate(value) => write!(f, "cannot interpret date {value:?}"),
            Self::Cancelled => write!(f, "harvest cancelled"),
            Self::Sink(e) => write!(f, "record callback failed: {e}"),
            Self::State(e) => write!(f, "harvest state store failed: {e}"),
            Self::Config(msg) => write!(f, "invalid source configuration: {msg}"),
        }
    }
}

impl std::error::Error for HarvestError {}

impl From<FetchError> for HarvestError {
    fn from(e: FetchError) -> Self {
        Self::Transport(e)
    }
}
