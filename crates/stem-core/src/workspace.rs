//! Repository workspace detection and layout.
//!
//! This module provides the [`Workspace`] type which represents a governed
//! repository on disk: its absolute root (the `repo_root` every metadata
//! record is scoped by) and the paths of stem's own files under `.stem/`.

use std::path::{Component, Path, PathBuf};

use crate::constants::{
    AGENT_DIR, ARCHIVE_DIR, BRANCH_INTENT_FILENAME, CONFIG_FILENAME, LEAF_INTENT_FILENAME,
    LOCK_FILENAME, LOG_FILENAME, QUEUE_DIR, STEM_DIR, VCS_DIR, WATCHER_HANDLE_FILENAME,
    WATCHER_LOG_FILENAME,
};
use crate::errors::StemError;

// ============================================================================
// Helper Functions
// ============================================================================

/// Check if a path is a disk root (e.g., C:\ on Windows, / on Unix).
///
/// Governing a whole filesystem would make every file on it a checkpoint
/// candidate, so such roots are rejected.
fn is_disk_root(path: &Path) -> bool {
    if path.parent().is_some() {
        return false;
    }

    #[cfg(windows)]
    {
        if let Some(s) = path.to_str() {
            if s.len() >= 2 && s.chars().nth(1) == Some(':') {
                return true;
            }
        }
    }

    #[cfg(not(windows))]
    {
        if path == Path::new("/") {
            return true;
        }
    }

    path.canonicalize().ok().is_some_and(|p| p.parent().is_none())
}

// ============================================================================
// Workspace
// ============================================================================

/// A resolved repository governed (or about to be governed) by stem.
///
/// # Example
///
/// ```ignore
/// use stem_core::Workspace;
/// use std::path::Path;
///
/// let workspace = Workspace::resolve(Path::new("."))?;
/// println!("Metadata log: {}", workspace.log_path().display());
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Absolute, canonical path to the repository root.
    root: PathBuf,

    /// Path to the metadata directory (`.stem`).
    stem_dir: PathBuf,

    /// Whether a `.git` directory exists at the root.
    has_vcs: bool,

    /// Whether `stem init` has run (`.stem` exists).
    initialized: bool,
}

impl Workspace {
    /// Create a `Workspace` from a root directory path.
    ///
    /// # Errors
    ///
    /// Returns [`StemError::InvalidArgument`] if the path does not exist, is
    /// not a directory, or is a disk root.
    pub fn from_root(root: &Path) -> Result<Self, StemError> {
        let root = root.canonicalize().map_err(|_| {
            StemError::InvalidArgument(format!("Path not found: {}", root.display()))
        })?;

        if !root.is_dir() {
            return Err(StemError::InvalidArgument(format!(
                "Not a directory: {}",
                root.display()
            )));
        }

        if is_disk_root(&root) {
            return Err(StemError::InvalidArgument(format!(
                "Refusing to govern disk root {}. Use a project directory instead.",
                root.display()
            )));
        }

        let stem_dir = root.join(STEM_DIR);
        let has_vcs = root.join(VCS_DIR).exists();
        let initialized = stem_dir.is_dir();

        Ok(Self {
            root,
            stem_dir,
            has_vcs,
            initialized,
        })
    }

    /// Resolve a workspace by walking up from the given directory.
    ///
    /// The nearest directory containing `.stem` or `.git` wins. If neither is
    /// found, the start directory itself becomes the candidate root so that
    /// `stem init` works anywhere.
    pub fn resolve(start_dir: &Path) -> Result<Self, StemError> {
        let start = start_dir.canonicalize().map_err(|_| {
            StemError::InvalidArgument(format!("Path not found: {}", start_dir.display()))
        })?;

        let mut current = start.as_path();
        loop {
            if is_disk_root(current) {
                break;
            }
            if current.join(STEM_DIR).is_dir() || current.join(VCS_DIR).exists() {
                return Self::from_root(current);
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        Self::from_root(&start)
    }

    /// Re-check the on-disk markers (after `init`).
    pub fn refreshed(&self) -> Result<Self, StemError> {
        Self::from_root(&self.root)
    }

    /// Fail with [`StemError::NotInitialized`] unless `stem init` has run.
    pub fn require_initialized(&self) -> Result<(), StemError> {
        if self.initialized {
            Ok(())
        } else {
            Err(StemError::NotInitialized(self.root.clone()))
        }
    }

    /// Get the absolute path to the repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to the `.stem` directory.
    pub fn stem_dir(&self) -> &Path {
        &self.stem_dir
    }

    /// Check if the root holds a VCS repository.
    pub fn has_vcs(&self) -> bool {
        self.has_vcs
    }

    /// Check if the repository has been initialized for stem.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `.stem/log.jsonl`
    pub fn log_path(&self) -> PathBuf {
        self.stem_dir.join(LOG_FILENAME)
    }

    /// `.stem/lock`
    pub fn lock_path(&self) -> PathBuf {
        self.stem_dir.join(LOCK_FILENAME)
    }

    /// `.stem/watcher.json`
    pub fn watcher_handle_path(&self) -> PathBuf {
        self.stem_dir.join(WATCHER_HANDLE_FILENAME)
    }

    /// `.stem/watcher.log`
    pub fn watcher_log_path(&self) -> PathBuf {
        self.stem_dir.join(WATCHER_LOG_FILENAME)
    }

    /// `.stem/config.yaml`
    pub fn config_path(&self) -> PathBuf {
        self.stem_dir.join(CONFIG_FILENAME)
    }

    /// `.stem/agent`
    pub fn agent_dir(&self) -> PathBuf {
        self.stem_dir.join(AGENT_DIR)
    }

    /// `.stem/agent/branch.json`
    pub fn branch_intent_path(&self) -> PathBuf {
        self.agent_dir().join(BRANCH_INTENT_FILENAME)
    }

    /// `.stem/agent/leaf.json`
    pub fn leaf_intent_path(&self) -> PathBuf {
        self.agent_dir().join(LEAF_INTENT_FILENAME)
    }

    /// `.stem/agent/queue`
    pub fn queue_dir(&self) -> PathBuf {
        self.agent_dir().join(QUEUE_DIR)
    }

    /// `.stem/agent/archive`
    pub fn archive_dir(&self) -> PathBuf {
        self.agent_dir().join(ARCHIVE_DIR)
    }

    /// Express an absolute path as a `/`-separated path relative to the root.
    ///
    /// Returns `None` for paths outside the repository.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Some(parts.join("/"))
    }
}

// ============================================================================
// Tests
// ============================================================================
