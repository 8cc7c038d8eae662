//! Global registry of governed repositories (`$STEM_HOME/registry.jsonl`).
//!
//! Repositories are registered explicitly by `init`; lookups resolve a path
//! against registered roots only and never scan the filesystem.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StemConfig;
use crate::constants::REGISTRY_FILENAME;
use crate::errors::StemError;

/// One registered repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub repo_root: PathBuf,
    pub registered_at: DateTime<Utc>,
}

/// Handle on the registry file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Open the registry at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the registry in the global stem directory.
    pub fn open_default() -> Result<Self, StemError> {
        let home = StemConfig::home_dir()
            .ok_or_else(|| StemError::Registry("Cannot determine home directory".to_string()))?;
        Ok(Self::new(home.join(REGISTRY_FILENAME)))
    }

    /// Path of the registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> Result<Vec<RegistryEntry>, StemError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| StemError::Registry(format!("Failed to read {}: {}", self.path.display(), e)))?;

        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RegistryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    "Skipping malformed registry line {}:{}: {}",
                    self.path.display(),
                    idx + 1,
                    e
                ),
            }
        }
        Ok(entries)
    }

    /// Register a repository root. Registering twice is a no-op.
    pub fn register(&self, repo_root: &Path) -> Result<RegistryEntry, StemError> {
        if let Some(existing) = self.entries()?.into_iter().find(|e| e.repo_root == repo_root) {
            return Ok(existing);
        }

        let entry = RegistryEntry {
            repo_root: repo_root.to_path_buf(),
            registered_at: Utc::now(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StemError::Registry(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StemError::Registry(format!("Failed to open {}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)
            .map_err(|e| StemError::Registry(e.to_string()))?;
        tracing::debug!("Registered {}", repo_root.display());
        Ok(entry)
    }

    /// Resolve a path to the registered repository that contains it.
    ///
    /// The innermost registered root wins when roots are nested.
    pub fn lookup(&self, path: &Path) -> Result<Option<RegistryEntry>, StemError> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| path.starts_with(&e.repo_root))
            .max_by_key(|e| e.repo_root.components().count()))
    }

    /// All registered repositories, newest first.
    pub fn list(&self) -> Result<Vec<RegistryEntry>, StemError> {
        let mut entries = self.entries()?;
        entries.reverse();
        Ok(entries)
    }
}

// ============================================================================
// Tests
// ============================================================================
