//! Translation of checkpoint operations into VCS command sequences.
//!
//! The [`Orchestrator`] exposes three units of work: create a branch, commit a
//! checkpoint, and check out a ref or commit with uncommitted work shelved
//! first. Each VCS step either fully happens or not at all; atomicity across
//! steps is the engine's concern (see [`crate::errors::StemError::PartialCheckpoint`]).
//!
//! Both branch creation and committing are resumable: an existing ref is
//! reused and a commit already carrying the nonce trailer is returned instead
//! of committing again.

use serde::{Deserialize, Serialize};

use crate::constants::{BRANCH_TRAILER, LEAF_TRAILER, NONCE_TRAILER};
use crate::errors::StemError;
use crate::intent::slugify;
use crate::vcs::Vcs;

// ============================================================================
// CheckpointStep
// ============================================================================

/// One step of a checkpoint or navigation, as reported in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckpointStep {
    /// Repository initialization.
    Init,
    /// Read-only inspection of VCS state.
    Inspect,
    /// Creation of the branch ref.
    CreateBranch,
    /// Staging of working tree changes.
    StageAll,
    /// Creation of the checkpoint commit.
    Commit,
    /// Shelving of uncommitted work before navigation.
    Shelve,
    /// Moving the working tree.
    Checkout,
    /// Appending the metadata record.
    MetadataAppend,
}

impl std::fmt::Display for CheckpointStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Inspect => "inspect",
            Self::CreateBranch => "createBranch",
            Self::StageAll => "stageAll",
            Self::Commit => "commit",
            Self::Shelve => "shelve",
            Self::Checkout => "checkout",
            Self::MetadataAppend => "metadataAppend",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// CheckpointMessage
// ============================================================================

/// The commit message of a checkpoint.
///
/// ```text
/// stem(b1/2): <prompt>
///
/// <summary>
///
/// Stem-Nonce: <nonce>
/// Stem-Branch: b1
/// Stem-Leaf: 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMessage {
    pub branch_id: String,
    pub leaf_id: String,
    pub prompt: String,
    pub summary: String,
    pub nonce: String,
}

impl CheckpointMessage {
    /// Render the message as passed to the VCS.
    pub fn render(&self) -> String {
        let mut out = format!("stem({}/{}): {}\n\n", self.branch_id, self.leaf_id, self.prompt);
        if !self.summary.is_empty() {
            out.push_str(&self.summary);
            out.push_str("\n\n");
        }
        out.push_str(&format!("{}: {}\n", NONCE_TRAILER, self.nonce));
        out.push_str(&format!("{}: {}\n", BRANCH_TRAILER, self.branch_id));
        out.push_str(&format!("{}: {}\n", LEAF_TRAILER, self.leaf_id));
        out
    }

    /// Parse a commit message produced by [`CheckpointMessage::render`].
    ///
    /// Returns `None` for any other message, including one whose subject and
    /// trailers disagree.
    pub fn parse(message: &str) -> Option<Self> {
        let message = message.trim();
        let (subject, rest) = message.split_once('\n').unwrap_or((message, ""));

        let subject = subject.strip_prefix("stem(")?;
        let (node, prompt) = subject.split_once("): ")?;
        let (branch_id, leaf_id) = node.split_once('/')?;

        let paragraphs: Vec<&str> = rest
            .trim()
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let (trailers, body) = paragraphs.split_last()?;

        let mut nonce = None;
        let mut trailer_branch = None;
        let mut trailer_leaf = None;
        for line in trailers.lines() {
            let (key, value) = line.split_once(": ")?;
            match key {
                k if k == NONCE_TRAILER => nonce = Some(value.trim()),
                k if k == BRANCH_TRAILER => trailer_branch = Some(value.trim()),
                k if k == LEAF_TRAILER => trailer_leaf = Some(value.trim()),
                _ => {}
            }
        }

        if trailer_branch? != branch_id || trailer_leaf? != leaf_id {
            return None;
        }
        let nonce = nonce.filter(|n| !n.is_empty())?;

        Some(Self {
            branch_id: branch_id.to_string(),
            leaf_id: leaf_id.to_string(),
            prompt: prompt.to_string(),
            summary: body.join("\n\n"),
            nonce: nonce.to_string(),
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Where a checkout moves the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutTarget {
    /// Attach HEAD to a branch (the target is its tip).
    Branch(String),
    /// Detach HEAD at a historical commit.
    Commit(String),
}

/// Outcome of a checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutReport {
    /// Message of the shelved entry, when uncommitted work was shelved.
    pub shelved: Option<String>,
}

/// Side-effecting adapter from checkpoint operations to VCS commands.
#[derive(Debug)]
pub struct Orchestrator<'a, V: Vcs> {
    vcs: &'a V,
    ref_prefix: &'a str,
}

impl<'a, V: Vcs> Orchestrator<'a, V> {
    /// Create an orchestrator over a VCS adapter.
    pub fn new(vcs: &'a V, ref_prefix: &'a str) -> Self {
        Self { vcs, ref_prefix }
    }

    /// Name of the VCS ref paired with a branch.
    pub fn ref_name(&self, user: &str, branch_id: &str, slug: &str) -> String {
        format!(
            "{}/{}/{}-{}",
            self.ref_prefix,
            slugify(user, crate::constants::MAX_USER_LEN, "user"),
            branch_id,
            slugify(slug, crate::constants::MAX_SLUG_LEN, "feature")
        )
    }

    /// Create the ref `vcs_ref` at the current HEAD and switch to it.
    ///
    /// If the ref already exists (an earlier attempt with the same nonce got
    /// this far), it is checked out instead of created.
    pub fn create_branch(&self, vcs_ref: &str) -> Result<(), StemError> {
        if self.vcs.branch_commit(vcs_ref)?.is_some() {
            tracing::debug!("Ref {} already exists, resuming on it", vcs_ref);
            if self.vcs.current_branch()?.as_deref() != Some(vcs_ref) {
                self.vcs.checkout_branch(vcs_ref)?;
            }
            return Ok(());
        }
        if self.vcs.current_branch()?.as_deref() == Some(vcs_ref) {
            // Unborn branch from an earlier attempt on an empty repository.
            return Ok(());
        }
        self.vcs.create_branch(vcs_ref)
    }

    /// Stage everything and create one (possibly empty) commit.
    ///
    /// Returns the hash of an existing commit carrying the same nonce
    /// instead of committing twice.
    pub fn commit_checkpoint(&self, message: &CheckpointMessage) -> Result<String, StemError> {
        if let Some(existing) = self.vcs.find_checkpoint(&message.nonce)? {
            tracing::debug!(
                "Commit for nonce {} already exists ({}), not committing again",
                message.nonce,
                existing
            );
            return Ok(existing);
        }
        self.vcs.stage_all()?;
        self.vcs.commit(&message.render())
    }

    /// Move the working tree, shelving uncommitted work first.
    ///
    /// Shelved work is never restored automatically.
    pub fn checkout(&self, target: &CheckoutTarget, nonce: &str) -> Result<CheckoutReport, StemError> {
        let mut report = CheckoutReport::default();

        if self.vcs.has_changes()? {
            let message = format!("stem: shelved before jump {}", nonce);
            self.vcs.stash_push(&message)?;
            let listed = self.vcs.stash_list()?;
            if !listed.iter().any(|entry| entry.contains(&message)) {
                return Err(StemError::VcsCommandFailed {
                    repo_root: self.vcs.root().to_path_buf(),
                    step: CheckpointStep::Shelve,
                    command: "stash list".to_string(),
                    status: "0".to_string(),
                    stderr: format!("shelved entry `{}` not found", message),
                });
            }
            tracing::info!("Shelved uncommitted work as `{}`", message);
            report.shelved = Some(message);
        }

        match target {
            CheckoutTarget::Branch(name) => self.vcs.checkout_branch(name)?,
            CheckoutTarget::Commit(commit) => self.vcs.checkout_detached(commit)?,
        }
        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================
