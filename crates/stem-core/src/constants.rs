//! Common constants used throughout stem-core.
//!
//! This module centralizes paths, directory names, and defaults to avoid
//! duplication and ensure consistency across the codebase.

// ============================================================================
// Directory and file names
// ============================================================================

/// The metadata directory at the repository root.
///
/// Everything stem writes inside a repository lives under `.stem/`. The
/// directory is excluded from the VCS and ignored by the watcher.
pub const STEM_DIR: &str = ".stem";

/// The VCS directory, ignored by the watcher.
pub const VCS_DIR: &str = ".git";

/// The append-only metadata log inside [`STEM_DIR`].
pub const LOG_FILENAME: &str = "log.jsonl";

/// The per-repository serialization lock file inside [`STEM_DIR`].
pub const LOCK_FILENAME: &str = "lock";

/// The watcher handle file inside [`STEM_DIR`].
pub const WATCHER_HANDLE_FILENAME: &str = "watcher.json";

/// Output of a detached watcher inside [`STEM_DIR`].
pub const WATCHER_LOG_FILENAME: &str = "watcher.log";

/// Agent-facing directory (intent files and command queue) inside [`STEM_DIR`].
pub const AGENT_DIR: &str = "agent";

/// Intent file declaring a new line of work.
pub const BRANCH_INTENT_FILENAME: &str = "branch.json";

/// Intent file declaring the next revision on the current line.
pub const LEAF_INTENT_FILENAME: &str = "leaf.json";

/// Queued command files live in `agent/queue/`.
pub const QUEUE_DIR: &str = "queue";

/// Consumed intent and queue files are moved to `agent/archive/`.
pub const ARCHIVE_DIR: &str = "archive";

/// The name of the global stem directory under the home directory.
pub const STEM_HOME_DIR: &str = ".stem";

/// Environment variable overriding the global stem directory.
pub const STEM_HOME_ENV: &str = "STEM_HOME";

/// The configuration file name (both global and per-repository).
pub const CONFIG_FILENAME: &str = "config.yaml";

/// The global repository registry file.
pub const REGISTRY_FILENAME: &str = "registry.jsonl";

// ============================================================================
// Checkpoint message trailers
// ============================================================================

/// Commit trailer carrying the idempotency nonce.
pub const NONCE_TRAILER: &str = "Stem-Nonce";

/// Commit trailer carrying the branch id.
pub const BRANCH_TRAILER: &str = "Stem-Branch";

/// Commit trailer carrying the leaf id.
pub const LEAF_TRAILER: &str = "Stem-Leaf";

// ============================================================================
// Text limits
// ============================================================================

/// Maximum length of a normalized prompt or summary.
pub const MAX_INTENT_LEN: usize = 140;

/// Maximum length of a branch slug.
pub const MAX_SLUG_LEN: usize = 40;

/// Maximum length of the user component of a VCS ref.
pub const MAX_USER_LEN: usize = 32;

/// Check whether a path relative to the repository root belongs to stem or
/// the VCS itself.
///
/// # Arguments
///
/// * `relative` - A `/`-separated path relative to the repository root.
pub fn is_internal_path(relative: &str) -> bool {
    let first = relative
        .trim_start_matches("./")
        .split('/')
        .next()
        .unwrap_or_default();
    first == STEM_DIR || first == VCS_DIR
}

// ============================================================================
// Tests
// ============================================================================
