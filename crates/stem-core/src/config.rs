//! Configuration types for stem.
//!
//! - [`StemConfig`]: the resolved configuration, loaded from the global file
//!   (`$STEM_HOME/config.yaml`, default `~/.stem/config.yaml`) and overridden
//!   field-by-field by the repository file (`.stem/config.yaml`).
//! - [`WatcherConfig`], [`LockConfig`], [`VcsConfig`]: the individual sections.
//!
//! Missing files yield defaults; malformed files are rejected.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{CONFIG_FILENAME, STEM_HOME_DIR, STEM_HOME_ENV};
use crate::errors::StemError;

/// Default idle interval before the watcher checkpoints (3 seconds).
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 3_000;

/// Default watcher poll tick.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default bounded wait for the serialization lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default retry interval while waiting for the lock.
pub const DEFAULT_LOCK_RETRY_MS: u64 = 50;

/// Default prompt used when an auto-checkpoint has no declared intent.
pub const DEFAULT_PLACEHOLDER_PROMPT: &str = "auto-checkpoint";

// ============================================================================
// MissingIntentPolicy
// ============================================================================

/// What the watcher does when no intent file is present at checkpoint time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingIntentPolicy {
    /// Checkpoint with a placeholder intent and record a warning.
    #[default]
    Placeholder,
    /// Skip the checkpoint until an intent is declared.
    Block,
}

impl std::fmt::Display for MissingIntentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placeholder => write!(f, "placeholder"),
            Self::Block => write!(f, "block"),
        }
    }
}

impl std::str::FromStr for MissingIntentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "placeholder" => Ok(Self::Placeholder),
            "block" => Ok(Self::Block),
            _ => Err(format!(
                "Unknown missing-intent policy: '{}'. Use 'placeholder' or 'block'.",
                s
            )),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Watcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    /// Quiet period after the last change before a checkpoint fires.
    /// No minimum: 0 means one checkpoint per discrete change.
    pub idle_interval_ms: u64,

    /// How often the watcher loop wakes up to advance its timer.
    pub poll_interval_ms: u64,

    /// Behavior when no intent was declared.
    pub missing_intent: MissingIntentPolicy,

    /// Prompt recorded for placeholder checkpoints.
    pub placeholder_prompt: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            missing_intent: MissingIntentPolicy::default(),
            placeholder_prompt: DEFAULT_PLACEHOLDER_PROMPT.to_string(),
        }
    }
}

impl WatcherConfig {
    /// Idle interval as a [`Duration`].
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Serialization lock tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    /// Bounded wait before giving up with a concurrency conflict.
    pub timeout_ms: u64,
    /// Sleep between acquisition attempts.
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_LOCK_RETRY_MS,
        }
    }
}

/// External VCS settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VcsConfig {
    /// Program invoked for VCS commands.
    pub program: String,
    /// First component of every ref stem creates.
    pub ref_prefix: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            ref_prefix: "stem".to_string(),
        }
    }
}

// ============================================================================
// StemConfig
// ============================================================================

/// Resolved stem configuration.
///
/// # Example YAML
///
/// ```yaml
/// watcher:
///   idleIntervalMs: 3000
///   missingIntent: placeholder
/// lock:
///   timeoutMs: 5000
/// vcs:
///   program: git
///   refPrefix: stem
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StemConfig {
    /// Watcher settings.
    pub watcher: WatcherConfig,
    /// Serialization lock settings.
    pub lock: LockConfig,
    /// VCS settings.
    pub vcs: VcsConfig,
}

/// A partially specified configuration file; `None` fields inherit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigOverride {
    #[serde(default)]
    watcher: WatcherOverride,
    #[serde(default)]
    lock: LockOverride,
    #[serde(default)]
    vcs: VcsOverride,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WatcherOverride {
    idle_interval_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    missing_intent: Option<MissingIntentPolicy>,
    placeholder_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LockOverride {
    timeout_ms: Option<u64>,
    retry_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct VcsOverride {
    program: Option<String>,
    ref_prefix: Option<String>,
}

impl StemConfig {
    /// Load the global configuration and apply the repository overrides.
    ///
    /// # Errors
    ///
    /// Returns [`StemError::InvalidConfig`] if either file exists but cannot
    /// be parsed or fails validation.
    pub fn load(global_path: Option<&Path>, repo_config_path: Option<&Path>) -> Result<Self, StemError> {
        let mut config = Self::default();
        if let Some(path) = global_path {
            config.merge_file(path)?;
        }
        if let Some(path) = repo_config_path {
            config.merge_file(path)?;
        }

        let warnings = config.validate().map_err(|reason| StemError::InvalidConfig {
            path: repo_config_path
                .or(global_path)
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            reason,
        })?;
        for warning in warnings {
            tracing::warn!("Config warning: {}", warning);
        }
        Ok(config)
    }

    /// Load using the default global location.
    pub fn load_default(repo_config_path: Option<&Path>) -> Result<Self, StemError> {
        let global = Self::default_path();
        Self::load(global.as_deref(), repo_config_path)
    }

    /// Get the global stem directory (`$STEM_HOME` or `~/.stem`).
    pub fn home_dir() -> Option<PathBuf> {
        if let Ok(value) = std::env::var(STEM_HOME_ENV) {
            if !value.trim().is_empty() {
                return Some(PathBuf::from(value));
            }
        }
        dirs::home_dir().map(|h| h.join(STEM_HOME_DIR))
    }

    /// Get the default global config file path.
    pub fn default_path() -> Option<PathBuf> {
        Self::home_dir().map(|d| d.join(CONFIG_FILENAME))
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), StemError> {
        if !path.exists() {
            tracing::debug!("Config not found at {}, using inherited values", path.display());
            return Ok(());
        }

        let content = fs::read_to_string(path).map_err(|e| StemError::InvalidConfig {
            path: path.to_path_buf(),
            reason: format!("Failed to read: {}", e),
        })?;
        if content.trim().is_empty() {
            return Ok(());
        }

        let layer: ConfigOverride =
            serde_yaml::from_str(&content).map_err(|e| StemError::InvalidConfig {
                path: path.to_path_buf(),
                reason: format!("Failed to parse: {}", e),
            })?;
        self.apply(layer);
        Ok(())
    }

    fn apply(&mut self, layer: ConfigOverride) {
        let w = layer.watcher;
        if let Some(v) = w.idle_interval_ms {
            self.watcher.idle_interval_ms = v;
        }
        if let Some(v) = w.poll_interval_ms {
            self.watcher.poll_interval_ms = v;
        }
        if let Some(v) = w.missing_intent {
            self.watcher.missing_intent = v;
        }
        if let Some(v) = w.placeholder_prompt {
            self.watcher.placeholder_prompt = v;
        }
        if let Some(v) = layer.lock.timeout_ms {
            self.lock.timeout_ms = v;
        }
        if let Some(v) = layer.lock.retry_interval_ms {
            self.lock.retry_interval_ms = v;
        }
        if let Some(v) = layer.vcs.program {
            self.vcs.program = v;
        }
        if let Some(v) = layer.vcs.ref_prefix {
            self.vcs.ref_prefix = v;
        }
    }

    /// Validate the configuration.
    ///
    /// Returns non-fatal warnings, or an error message for values the engine
    /// cannot run with.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.lock.timeout_ms > 0 && self.lock.retry_interval_ms == 0 {
            return Err("lock.retryIntervalMs must be > 0 when lock.timeoutMs > 0".to_string());
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err("watcher.pollIntervalMs must be > 0".to_string());
        }
        if self.vcs.program.trim().is_empty() {
            return Err("vcs.program must not be empty".to_string());
        }
        if self.vcs.ref_prefix.trim().is_empty() || self.vcs.ref_prefix.contains(' ') {
            return Err(format!(
                "vcs.refPrefix `{}` is not a valid ref component",
                self.vcs.ref_prefix
            ));
        }
        if self.watcher.placeholder_prompt.trim().is_empty() {
            return Err("watcher.placeholderPrompt must not be empty".to_string());
        }

        if self.watcher.idle_interval_ms == 0 {
            warnings.push(
                "watcher.idleIntervalMs is 0: every discrete change becomes a checkpoint".to_string(),
            );
        }
        if self.lock.timeout_ms == 0 {
            warnings.push("lock.timeoutMs is 0: contended commands fail immediately".to_string());
        }

        Ok(warnings)
    }
}

// ============================================================================
// Tests
// ============================================================================
