//! Declared intent: the agent-facing files under `.stem/agent/`.
//!
//! - `leaf.json` / `branch.json` declare the prompt and summary of the next
//!   checkpoint (and, for a new line, optionally `old_prompt`/`old_summary`
//!   closing out the current one).
//! - `queue/*.json` hold queued commands, drained in modification order.
//!
//! Both file kinds reject unknown fields instead of dropping them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::MAX_INTENT_LEN;
use crate::errors::StemError;
use crate::navigator::LeafSelector;

// ============================================================================
// Text helpers
// ============================================================================

/// Collapse whitespace to single spaces and cap at the intent length,
/// ending truncated text with an ellipsis.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_INTENT_LEN {
        return collapsed;
    }
    let head: String = collapsed.chars().take(MAX_INTENT_LEN - 1).collect();
    format!("{}…", head.trim_end())
}

/// Turn free text into a ref-safe slug: lowercase alphanumerics joined by `-`.
pub fn slugify(text: &str, max_len: usize, fallback: &str) -> String {
    let mut slug = String::new();
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.chars().take(max_len).collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug.to_string()
    }
}

// ============================================================================
// Intent
// ============================================================================

/// A normalized prompt/summary pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub prompt: String,
    pub summary: String,
}

impl Intent {
    /// Normalize and validate an intent. The prompt must not be empty.
    pub fn new(prompt: &str, summary: &str) -> Result<Self, StemError> {
        let prompt = normalize_text(prompt);
        if prompt.is_empty() {
            return Err(StemError::InvalidArgument(
                "Intent prompt must not be empty".to_string(),
            ));
        }
        Ok(Self {
            prompt,
            summary: normalize_text(summary),
        })
    }

    /// Build an intent from optional parts; `None` when no prompt is given.
    fn from_parts(prompt: Option<&str>, summary: Option<&str>) -> Option<Self> {
        let prompt = normalize_text(prompt?);
        if prompt.is_empty() {
            return None;
        }
        Some(Self {
            prompt,
            summary: normalize_text(summary.unwrap_or_default()),
        })
    }
}

fn validation(path: &Path, reason: impl Into<String>) -> StemError {
    StemError::IntentValidation {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

// ============================================================================
// IntentFile
// ============================================================================

/// Contents of `leaf.json` or `branch.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_summary: Option<String>,
}

impl IntentFile {
    /// Read an intent file. A missing file is `Ok(None)`: intent undeclared.
    ///
    /// # Errors
    ///
    /// Returns [`StemError::IntentValidation`] for malformed JSON, unknown
    /// fields, or a file that declares neither a new nor a closing intent.
    pub fn load(path: &Path) -> Result<Option<Self>, StemError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let file: Self =
            serde_json::from_str(&content).map_err(|e| validation(path, e.to_string()))?;

        if file.intent().is_none() && file.closing().is_none() {
            return Err(validation(path, "declares neither `prompt` nor `old_prompt`"));
        }
        if file.summary.is_some() && file.prompt.is_none() {
            return Err(validation(path, "`summary` given without `prompt`"));
        }
        if file.old_summary.is_some() && file.old_prompt.is_none() {
            return Err(validation(path, "`old_summary` given without `old_prompt`"));
        }
        Ok(Some(file))
    }

    /// Intent of the new checkpoint.
    pub fn intent(&self) -> Option<Intent> {
        Intent::from_parts(self.prompt.as_deref(), self.summary.as_deref())
    }

    /// Intent closing out the current line before a new one starts.
    pub fn closing(&self) -> Option<Intent> {
        Intent::from_parts(self.old_prompt.as_deref(), self.old_summary.as_deref())
    }

    /// Write the file (used by tests and agents driving stem from Rust).
    pub fn write(&self, path: &Path) -> Result<(), StemError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Command verbs accepted in queue files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCommandKind {
    /// Start a new line from `prompt`/`summary`.
    Branch,
    /// Save a revision described by `prompt`/`summary`.
    Update,
    /// Close the current line with `old_*`, then start a new one.
    UpdateBranch,
    /// Navigate to `branch_id` / `target`.
    Jump,
}

/// One queued command file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuedCommand {
    pub command: QueueCommandKind,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, alias = "prev_prompt", skip_serializing_if = "Option::is_none")]
    pub old_prompt: Option<String>,
    #[serde(default, alias = "prev_summary", skip_serializing_if = "Option::is_none")]
    pub old_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Jump target: a leaf selector, or `<branch>/<selector>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Informational timestamp set by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl QueuedCommand {
    /// Read and validate a queue file.
    pub fn load(path: &Path) -> Result<Self, StemError> {
        let content = fs::read_to_string(path)?;
        let command: Self =
            serde_json::from_str(&content).map_err(|e| validation(path, e.to_string()))?;
        command.validate().map_err(|reason| validation(path, reason))?;
        Ok(command)
    }

    fn validate(&self) -> Result<(), String> {
        if self.nonce.trim().is_empty() {
            return Err("`nonce` must not be empty".to_string());
        }
        match self.command {
            QueueCommandKind::Branch => {
                if self.intent().is_none() {
                    return Err("`branch` requires `prompt`".to_string());
                }
            }
            QueueCommandKind::Update => {
                if self.intent().is_none() {
                    return Err("`update` requires `prompt` or `old_prompt`".to_string());
                }
            }
            QueueCommandKind::UpdateBranch => {
                if self.intent().is_none() || self.closing().is_none() {
                    return Err("`update_branch` requires `prompt` and `old_prompt`".to_string());
                }
            }
            QueueCommandKind::Jump => {
                self.jump_target()?;
            }
        }
        Ok(())
    }

    /// Intent of the new checkpoint (`update` falls back to `old_*`).
    pub fn intent(&self) -> Option<Intent> {
        Intent::from_parts(self.prompt.as_deref(), self.summary.as_deref()).or_else(|| {
            if self.command == QueueCommandKind::Update {
                self.closing()
            } else {
                None
            }
        })
    }

    /// Intent closing the current line.
    pub fn closing(&self) -> Option<Intent> {
        Intent::from_parts(self.old_prompt.as_deref(), self.old_summary.as_deref())
    }

    /// Resolve the jump destination into a branch id and a leaf selector.
    pub fn jump_target(&self) -> Result<(String, LeafSelector), String> {
        let target = self.target.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let (branch, selector) = match (self.branch_id.as_deref(), target) {
            (Some(branch), Some(target)) => (branch.to_string(), target.to_string()),
            (Some(branch), None) => (branch.to_string(), "latest".to_string()),
            (None, Some(target)) => match target.split_once('/') {
                Some((branch, leaf)) => (branch.to_string(), leaf.to_string()),
                None => (target.to_string(), "latest".to_string()),
            },
            (None, None) => return Err("`jump` requires `branch_id` or `target`".to_string()),
        };
        let branch = branch.trim().to_string();
        if branch.is_empty() {
            return Err("`jump` target names no branch".to_string());
        }
        let selector = selector.parse::<LeafSelector>()?;
        Ok((branch, selector))
    }
}

/// Queue files in processing order: oldest modification first, then name.
pub fn list_queue(queue_dir: &Path) -> Result<Vec<PathBuf>, StemError> {
    if !queue_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(queue_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
            let modified = fs::metadata(&path)?.modified()?;
            files.push((modified, path));
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Move a consumed file into the archive as `<name>.<suffix>`.
///
/// An existing archive entry with the same name is never overwritten.
pub fn archive_file(archive_dir: &Path, path: &Path, suffix: &str) -> Result<PathBuf, StemError> {
    fs::create_dir_all(archive_dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "intent".to_string());

    let mut dest = archive_dir.join(format!("{}.{}", name, suffix));
    let mut counter = 1;
    while dest.exists() {
        dest = archive_dir.join(format!("{}.{}.{}", name, counter, suffix));
        counter += 1;
    }
    fs::rename(path, &dest)?;
    tracing::debug!("Archived {} to {}", path.display(), dest.display());
    Ok(dest)
}

// ============================================================================
// Tests
// ============================================================================
