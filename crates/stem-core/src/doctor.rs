//! Repository health checks.
//!
//! [`diagnose`] compares every recorded branch and leaf against the VCS and
//! reports what no longer lines up: refs deleted outside stem, leaf commits
//! that are gone or no longer on their line, drift, a dirty working tree and
//! commands that never completed. It never repairs anything.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::StemError;
use crate::state::ProcessState;
use crate::store::{NodeRef, Snapshot};
use crate::vcs::Vcs;

/// How bad a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    /// Recorded history points at something the VCS no longer has.
    Error,
    /// Worth attention, but every recorded node is still reachable.
    Warning,
}

/// What a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FindingKind {
    /// A branch's VCS ref does not exist.
    MissingRef,
    /// A leaf's commit does not exist.
    MissingCommit,
    /// A leaf's commit is not reachable from its branch ref.
    Unreachable,
    /// HEAD was moved outside stem.
    Drift,
    /// Uncommitted changes outside `.stem/`.
    DirtyTree,
    /// A command was accepted but never landed.
    PendingCommand,
}

impl FindingKind {
    fn severity(self) -> Severity {
        match self {
            Self::MissingRef | Self::MissingCommit | Self::Unreachable => Severity::Error,
            Self::Drift | Self::DirtyTree | Self::PendingCommand => Severity::Warning,
        }
    }
}

/// One detected problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub message: String,
}

impl Finding {
    fn new(kind: FindingKind, message: String) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            branch_id: None,
            node: None,
            nonce: None,
            message,
        }
    }
}

/// Result of `stem doctor`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub repo_root: PathBuf,
    pub state: ProcessState,
    pub branches_checked: usize,
    pub leaves_checked: usize,
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    /// No findings at all.
    pub fn is_healthy(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of error-severity findings.
    pub fn error_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }
}

/// Check recorded history against the VCS.
pub fn diagnose<V: Vcs>(
    repo_root: &Path,
    snapshot: &Snapshot,
    state: ProcessState,
    vcs: &V,
) -> Result<DoctorReport, StemError> {
    let mut findings = Vec::new();

    for branch in snapshot.branches() {
        let ref_commit = vcs.branch_commit(&branch.vcs_ref)?;
        if ref_commit.is_none() {
            let mut finding = Finding::new(
                FindingKind::MissingRef,
                format!("{} has no ref {}", branch.branch_id, branch.vcs_ref),
            );
            finding.branch_id = Some(branch.branch_id.clone());
            findings.push(finding);
        }

        for leaf in snapshot.leaves_of(&branch.branch_id) {
            let problem = if !vcs.commit_exists(&leaf.vcs_commit)? {
                Some((
                    FindingKind::MissingCommit,
                    format!("{} points at missing commit {}", leaf.node(), leaf.vcs_commit),
                ))
            } else {
                match &ref_commit {
                    Some(tip) if !vcs.is_ancestor(&leaf.vcs_commit, tip)? => Some((
                        FindingKind::Unreachable,
                        format!(
                            "{} ({}) is not reachable from {}",
                            leaf.node(),
                            leaf.vcs_commit,
                            branch.vcs_ref
                        ),
                    )),
                    _ => None,
                }
            };
            if let Some((kind, message)) = problem {
                let mut finding = Finding::new(kind, message);
                finding.branch_id = Some(branch.branch_id.clone());
                finding.node = Some(leaf.node());
                findings.push(finding);
            }
        }
    }

    if state.drift {
        let mut finding = Finding::new(
            FindingKind::Drift,
            format!(
                "HEAD {} on {} was moved outside stem",
                state.head.as_deref().unwrap_or("none"),
                state.vcs_branch.as_deref().unwrap_or("a detached HEAD")
            ),
        );
        finding.node = state.current.clone();
        findings.push(finding);
    }

    if vcs.has_changes()? {
        findings.push(Finding::new(
            FindingKind::DirtyTree,
            "Working tree has uncommitted changes; a jump will shelve them".to_string(),
        ));
    }

    for reservation in snapshot.incomplete() {
        let mut finding = Finding::new(
            FindingKind::PendingCommand,
            format!(
                "Command `{}` reserved {} but never completed",
                reservation.nonce, reservation.target
            ),
        );
        finding.node = Some(reservation.target.clone());
        finding.nonce = Some(reservation.nonce.clone());
        findings.push(finding);
    }

    tracing::debug!("Doctor found {} issue(s)", findings.len());
    Ok(DoctorReport {
        repo_root: repo_root.to_path_buf(),
        state,
        branches_checked: snapshot.branches().count(),
        leaves_checked: snapshot.leaves().count(),
        findings,
    })
}
