//! Per-source harvest configuration.

use std::path::PathBuf;

use anyhow::{Result, ensure};
use serde::Deserialize;

/// Default bound on consecutive identical resumption tokens.
pub const DEFAULT_TOKEN_LIMIT: u32 = 100;

/// Date precision for `from`/`until` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GranularitySetting {
    /// Negotiate with the server's Identify response.
    #[default]
    Auto,
    /// `YYYY-MM-DD`
    Date,
    /// `YYYY-MM-DDThh:mm:ssZ`
    Seconds,
}

impl TryFrom<String> for GranularitySetting {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "" | "auto" => Ok(Self::Auto),
            "YYYY-MM-DD" => Ok(Self::Date),
            "YYYY-MM-DDThh:mm:ssZ" => Ok(Self::Seconds),
            other => Err(format!(
                "unknown date_granularity {other:?} (expected auto, YYYY-MM-DD or YYYY-MM-DDThh:mm:ssZ)"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for GranularitySetting {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Configuration of one harvested data source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// OAI-PMH base URL.
    pub url: String,
    /// Optional set filter.
    pub set: Option<String>,
    /// Metadata prefix requested from the server.
    pub metadata_prefix: String,
    /// Prefix stripped from record identifiers.
    pub id_prefix: Option<String>,
    /// Ordered rewrite patterns, position-correlated with `id_replace`.
    pub id_search: Vec<String>,
    pub id_replace: Vec<String>,
    pub date_granularity: GranularitySetting,
    /// Append request/response traces to this path.
    pub debug_log: Option<PathBuf>,
    /// Identifier of a registered response transform.
    pub transformation: Option<String>,
    /// Tolerate `noRecordsMatch` on the initial request.
    pub ignore_no_records_match: bool,
    pub same_resumption_token_limit: u32,
    /// Start the harvest from this token instead of the first page.
    pub resumption_token: Option<String>,
    /// Fields whose vocabulary URIs are enriched downstream.
    pub enrich_fields: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            set: None,
            metadata_prefix: "oai_dc".to_string(),
            id_prefix: None,
            id_search: Vec::new(),
            id_replace: Vec::new(),
            date_granularity: GranularitySetting::Auto,
            debug_log: None,
            transformation: None,
            ignore_no_records_match: false,
            same_resumption_token_limit: DEFAULT_TOKEN_LIMIT,
            resumption_token: None,
            enrich_fields: Vec::new(),
        }
    }
}

impl SourceConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        ensure!(!self.url.is_empty(), "source {name}: url is required");
        ensure!(
            self.id_search.len() == self.id_replace.len(),
            "source {name}: id_search and id_replace must pair up"
        );
        ensure!(
            self.same_resumption_token_limit >= 1,
            "source {name}: same_resumption_token_limit must be at least 1"
        );
        Ok(())
    }

    /// Configured resumption-token override, ignoring empty strings.
    pub fn resume_token(&self) -> Option<&str> {
        self.resumption_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Configured transform id, ignoring empty strings.
    pub fn transformation(&self) -> Option<&str> {
        self.transformation.as_deref().filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_parses_known_values() {
        assert_eq!(
            GranularitySetting::try_from("auto".to_string()),
            Ok(GranularitySetting::Auto)
        );
        assert_eq!(
            GranularitySetting::try_from("YYYY-MM-DD".to_string()),
            Ok(GranularitySetting::Date)
        );
        assert_eq!(
            GranularitySetting::try_from("YYYY-MM-DDThh:mm:ssZ".to_string()),
            Ok(GranularitySetting::Seconds)
        );
        assert!(GranularitySetting::try_from("hourly".to_string()).is_err());
    }

    #[test]
    fn source_from_toml() {
        let cfg: SourceConfig = toml::from_str(
            r#"
url = "https://repo.example.org/oai"
set = "books"
metadata_prefix = "marc21"
id_prefix = "oai:repo.example.org:"
id_search = ["/^x/"]
id_replace = ["y"]
date_granularity = "YYYY-MM-DD"
ignore_no_records_match = true
same_resumption_token_limit = 10
"#,
        )
        .unwrap();
        assert_eq!(cfg.metadata_prefix, "marc21");
        assert_eq!(cfg.set.as_deref(), Some("books"));
        assert_eq!(cfg.date_granularity, GranularitySetting::Date);
        assert!(cfg.ignore_no_records_match);
        assert_eq!(cfg.same_resumption_token_limit, 10);
        cfg.validate("test").unwrap();
    }

    #[test]
    fn validate_rejects_missing_url() {
        let cfg = SourceConfig::default();
        assert!(cfg.validate("test").is_err());
    }

    #[test]
    fn validate_rejects_unpaired_rules() {
        let mut cfg = SourceConfig::default();
        cfg.url = "https://example.org/oai".into();
        cfg.id_search = vec!["a".into()];
        assert!(cfg.validate("test").is_err());
    }

    #[test]
    fn empty_resume_token_is_none() {
        let mut cfg = SourceConfig::default();
        cfg.resumption_token = Some(String::new());
        assert_eq!(cfg.resume_token(), None);
        cfg.resumption_token = Some("t9".into());
        assert_eq!(cfg.resume_token(), Some("t9"));
    }
}
