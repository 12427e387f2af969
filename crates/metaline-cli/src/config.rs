//! Configuration loading from TOML files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use metaline_enrich::EnrichConfig;
use metaline_oai::SourceConfig;

/// Global configuration for metaline.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub workers: WorkersConfig,
    pub state: StateConfig,
    pub output: OutputConfig,
    pub enrichment: EnrichConfig,
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Attempts per request before giving up.
    pub max_tries: u32,
    /// Fixed wait between attempts, in seconds.
    pub retry_wait_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            retry_wait_secs: 30,
            user_agent: format!("metaline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub max_queue: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            count: cpus.min(8),
            max_queue: metaline_core::DEFAULT_MAX_QUEUE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/harvest-state.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
        }
    }
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Search order:
    /// 1. ./metaline.toml (current directory)
    /// 2. ~/.config/metaline/config.toml
    ///
    /// Falls back to defaults when no file is found.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("metaline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "metaline") {
            let user_config = dirs.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, source) in &self.sources {
            source.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.http.max_tries, 5);
        assert!(config.workers.count >= 1);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[http]
max_tries = 3
retry_wait_secs = 1

[workers]
count = 2
max_queue = 4

[state]
path = "/tmp/state.json"

[enrichment]
base_url = "https://vocab.example.org"
url_prefix_whitelist = ["http://vocab.example.org/"]

[sources.alpha]
url = "https://repo.example.org/oai"
set = "maps"
ignore_no_records_match = true

[sources.beta]
url = "https://other.example.org/oai"
metadata_prefix = "marc21"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.http.max_tries, 3);
        assert_eq!(config.workers.count, 2);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources["alpha"].set.as_deref(), Some("maps"));
        assert_eq!(config.sources["beta"].metadata_prefix, "marc21");
        // Defaults flow into partially specified sources.
        assert_eq!(config.sources["alpha"].metadata_prefix, "oai_dc");
        assert_eq!(config.sources["alpha"].same_resumption_token_limit, 100);
    }

    #[test]
    fn validate_flags_bad_source() {
        let toml = r#"
[sources.broken]
id_search = ["a"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
