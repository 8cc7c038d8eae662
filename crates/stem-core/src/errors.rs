//! Error types for stem-core.
//!
//! Every failure surfaced by the engine is a [`StemError`]. Duplicate commands
//! are not errors: they are absorbed by the idempotency gate and reported as
//! [`crate::engine::Outcome::Duplicate`].

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::CheckpointStep;

/// Domain-specific errors for stem operations.
#[derive(Error, Debug)]
pub enum StemError {
    /// The repository has not been initialized with `stem init`.
    #[error("Repository not initialized at {0}. Run `stem init`.")]
    NotInitialized(PathBuf),

    // =========================================================================
    // Not-found (user-correctable)
    // =========================================================================
    /// The requested branch does not exist for this repository.
    #[error("Unknown branch `{branch_id}` in {repo_root}")]
    UnknownBranch {
        /// Repository the lookup ran against.
        repo_root: PathBuf,
        /// The branch that was requested.
        branch_id: String,
    },

    /// The requested leaf does not exist under the given branch.
    #[error("Unknown leaf `{branch_id}/{leaf_id}` in {repo_root}")]
    UnknownLeaf {
        /// Repository the lookup ran against.
        repo_root: PathBuf,
        /// The branch the leaf was looked up under.
        branch_id: String,
        /// The leaf that was requested.
        leaf_id: String,
    },

    /// There is no current branch to save a revision on.
    #[error("No current branch in {0}. Start one with `stem branch`.")]
    NoCurrentBranch(PathBuf),

    /// A revision was requested while the working tree sits on a historical leaf.
    #[error("Working tree is at `{branch_id}/{leaf_id}`, not at the tip of `{branch_id}` ({tip}). Start a new branch to continue from here.")]
    NotAtBranchTip {
        /// Branch of the checked-out leaf.
        branch_id: String,
        /// The checked-out leaf.
        leaf_id: String,
        /// The latest leaf of the branch.
        tip: String,
    },

    // =========================================================================
    // VCS failures
    // =========================================================================
    /// An external VCS invocation failed.
    #[error("VCS step `{step}` failed in {repo_root}: `{command}` exited with {status}: {stderr}")]
    VcsCommandFailed {
        /// Repository the command ran in.
        repo_root: PathBuf,
        /// The checkpoint step the command belonged to.
        step: CheckpointStep,
        /// The command line that failed.
        command: String,
        /// Exit status (or `spawn` when the program could not be started).
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A multi-step checkpoint stopped after some durable steps succeeded.
    ///
    /// Replaying the same nonce resumes from `failed` without repeating
    /// `completed`.
    #[error("Partial checkpoint for nonce `{nonce}` in {repo_root}: `{completed}` succeeded but `{failed}` failed: {reason}. Re-run with the same nonce to complete it.")]
    PartialCheckpoint {
        /// Repository the checkpoint ran in.
        repo_root: PathBuf,
        /// Nonce of the interrupted command.
        nonce: String,
        /// Last step that completed durably.
        completed: CheckpointStep,
        /// Step that failed.
        failed: CheckpointStep,
        /// Description of the failure.
        reason: String,
    },

    /// Log and VCS disagree in a way the engine refuses to guess about.
    #[error("Cannot reconcile nonce `{nonce}` in {repo_root}: {detail}")]
    Unreconcilable {
        /// Repository being reconciled.
        repo_root: PathBuf,
        /// Nonce of the command that could not be reconciled.
        nonce: String,
        /// What was inconsistent.
        detail: String,
    },

    // =========================================================================
    // Input validation
    // =========================================================================
    /// An intent or queued command file is malformed.
    #[error("Invalid intent file `{path}`: {reason}")]
    IntentValidation {
        /// The offending file.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid argument provided to a command.
    #[error("{0}")]
    InvalidArgument(String),

    /// Configuration file could not be read or is invalid.
    #[error("Invalid configuration at {path}: {reason}")]
    InvalidConfig {
        /// The configuration file.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    // =========================================================================
    // Concurrency
    // =========================================================================
    /// The per-repository serialization lock could not be acquired in time.
    #[error("Repository {repo_root} is busy (waited {waited_ms}ms){}", .holder.as_ref().map(|h| format!(", held by {h}")).unwrap_or_default())]
    ConcurrencyConflict {
        /// Repository whose lock was contended.
        repo_root: PathBuf,
        /// How long the caller waited.
        waited_ms: u64,
        /// Description of the current holder, if readable.
        holder: Option<String>,
    },

    // =========================================================================
    // Metadata log, registry, watcher
    // =========================================================================
    /// The metadata log could not be read or written.
    #[error("Metadata log I/O error at {path}: {reason}")]
    LogIo {
        /// The log file.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// A metadata log line could not be parsed.
    #[error("Metadata log parse error at {path}:{line}: {reason}")]
    LogParse {
        /// The log file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Description of the failure.
        reason: String,
    },

    /// The global repository registry failed.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Watcher setup or process control failed.
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A wrapped generic error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StemError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "notInitialized",
            Self::UnknownBranch { .. } => "unknownBranch",
            Self::UnknownLeaf { .. } => "unknownLeaf",
            Self::NoCurrentBranch(_) => "noCurrentBranch",
            Self::NotAtBranchTip { .. } => "notAtBranchTip",
            Self::VcsCommandFailed { .. } => "vcsCommandFailed",
            Self::PartialCheckpoint { .. } => "partialCheckpoint",
            Self::Unreconcilable { .. } => "unreconcilable",
            Self::IntentValidation { .. } => "intentValidation",
            Self::InvalidArgument(_) => "invalidArgument",
            Self::InvalidConfig { .. } => "invalidConfig",
            Self::ConcurrencyConflict { .. } => "concurrencyConflict",
            Self::LogIo { .. } => "logIo",
            Self::LogParse { .. } => "logParse",
            Self::Registry(_) => "registry",
            Self::Watcher(_) => "watcher",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Yaml(_) => "yaml",
            Self::Other(_) => "other",
        }
    }

    /// Whether retrying the same command (same nonce) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VcsCommandFailed { .. }
                | Self::PartialCheckpoint { .. }
                | Self::ConcurrencyConflict { .. }
                | Self::Io(_)
        )
    }

    /// Structured view of the error for machine consumers.
    pub fn report(&self) -> ErrorReport {
        let mut report = ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            repo_root: None,
            nonce: None,
            branch_id: None,
            leaf_id: None,
            step: None,
            failed_step: None,
        };
        match self {
            Self::NotInitialized(root) | Self::NoCurrentBranch(root) => {
                report.repo_root = Some(root.clone());
            }
            Self::UnknownBranch {
                repo_root,
                branch_id,
            } => {
                report.repo_root = Some(repo_root.clone());
                report.branch_id = Some(branch_id.clone());
            }
            Self::UnknownLeaf {
                repo_root,
                branch_id,
                leaf_id,
            } => {
                report.repo_root = Some(repo_root.clone());
                report.branch_id = Some(branch_id.clone());
                report.leaf_id = Some(leaf_id.clone());
            }
            Self::NotAtBranchTip {
                branch_id, leaf_id, ..
            } => {
                report.branch_id = Some(branch_id.clone());
                report.leaf_id = Some(leaf_id.clone());
            }
            Self::VcsCommandFailed {
                repo_root, step, ..
            } => {
                report.repo_root = Some(repo_root.clone());
                report.failed_step = Some(*step);
            }
            Self::PartialCheckpoint {
                repo_root,
                nonce,
                completed,
                failed,
                ..
            } => {
                report.repo_root = Some(repo_root.clone());
                report.nonce = Some(nonce.clone());
                report.step = Some(*completed);
                report.failed_step = Some(*failed);
            }
            Self::Unreconcilable {
                repo_root, nonce, ..
            } => {
                report.repo_root = Some(repo_root.clone());
                report.nonce = Some(nonce.clone());
            }
            Self::ConcurrencyConflict { repo_root, .. } => {
                report.repo_root = Some(repo_root.clone());
            }
            _ => {}
        }
        report
    }
}

/// Serializable error context for agents and `--json` output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Stable kind name (see [`StemError::kind`]).
    pub kind: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Whether replaying the same nonce may succeed.
    pub retryable: bool,
    /// Repository root, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<PathBuf>,
    /// Nonce of the affected command, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Affected branch, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Affected leaf, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_id: Option<String>,
    /// Last step that completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<CheckpointStep>,
    /// Step that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<CheckpointStep>,
}
