//! Persistence of per-source harvest positions.
//!
//! Only the last harvested date is tracked; it is written exclusively on
//! clean completion of a full harvest, so a crashed run re-harvests overlap
//! instead of losing records.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Narrow interface to wherever harvest positions live.
pub trait HarvestState {
    fn last_harvested_date(&self, source: &str) -> Option<String>;
    fn set_last_harvested_date(&mut self, source: &str, date: &str) -> Result<()>;
}

/// JSON-file-backed state store with atomic tmp→rename writes.
#[derive(Debug)]
pub struct FileState {
    path: PathBuf,
    dates: BTreeMap<String, String>,
}

impl FileState {
    pub fn open(path: &Path) -> Result<Self> {
        let dates = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("cannot read state file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("corrupt state file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            dates,
        })
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create state dir {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.dates)?;
        fs::write(&tmp, json).with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot rename {} into place", tmp.display()))?;
        Ok(())
    }
}

impl HarvestState for FileState {
    fn last_harvested_date(&self, source: &str) -> Option<String> {
        self.dates.get(source).cloned()
    }

    fn set_last_harvested_date(&mut self, source: &str, date: &str) -> Result<()> {
        self.dates.insert(source.to_string(), date.to_string());
        self.save()
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryState {
    dates: BTreeMap<String, String>,
}

impl HarvestState for MemoryState {
    fn last_harvested_date(&self, source: &str) -> Option<String> {
        self.dates.get(source).cloned()
    }

    fn set_last_harvested_date(&mut self, source: &str, date: &str) -> Result<()> {
        self.dates.insert(source.to_string(), date.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = FileState::open(&path).unwrap();
        assert_eq!(state.last_harvested_date("src"), None);
        state.set_last_harvested_date("src", "2024-06-01").unwrap();

        let reopened = FileState::open(&path).unwrap();
        assert_eq!(
            reopened.last_harvested_date("src"),
            Some("2024-06-01".to_string())
        );
    }

    #[test]
    fn file_state_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = FileState::open(&path).unwrap();
        state.set_last_harvested_date("src", "2024-01-01").unwrap();
        state.set_last_harvested_date("src", "2024-06-01").unwrap();
        assert_eq!(
            state.last_harvested_date("src"),
            Some("2024-06-01".to_string())
        );
    }

    #[test]
    fn file_state_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        let mut state = FileState::open(&path).unwrap();
        state.set_last_harvested_date("src", "2024-06-01").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileState::open(&path).is_err());
    }

    #[test]
    fn memory_state_roundtrip() {
        let mut state = MemoryState::default();
        state.set_last_harvested_date("a", "2024-01-01").unwrap();
        assert_eq!(
            state.last_harvested_date("a"),
            Some("2024-01-01".to_string())
        );
        assert_eq!(state.last_harvested_date("b"), None);
    }
}
