//! Status reporting types for stem.
//!
//! A [`StatusReport`] combines the reconstructed pointer, watcher liveness,
//! the last executed command and outstanding work. It is cheap to compute and
//! is what listing front-ends poll.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::process::WatcherStatus;
use crate::state::ProcessState;
use crate::store::{CommandExecution, NodeRef, Snapshot};

/// Record counts for the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryCounts {
    pub branches: usize,
    pub leaves: usize,
    pub jumps: usize,
    pub warnings: usize,
}

impl HistoryCounts {
    /// Count the records of a snapshot.
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            branches: snapshot.branches().count(),
            leaves: snapshot.leaves().count(),
            jumps: snapshot.jumps().count(),
            warnings: snapshot.warnings().count(),
        }
    }
}

/// Complete status report for one repository.
///
/// Optional fields are `None` when the repository is not initialized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Absolute path to the repository root.
    pub repo_root: PathBuf,

    /// Whether `stem init` has run.
    pub is_initialized: bool,

    /// Reconstructed process state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ProcessState>,

    /// Prompt of the current leaf.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_prompt: Option<String>,

    /// Watcher liveness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher: Option<WatcherStatus>,

    /// Last accepted command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command: Option<CommandExecution>,

    /// Nonces accepted but not yet completed.
    pub pending: Vec<String>,

    /// Nodes completed from VCS evidence during this call.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rolled_forward: Vec<NodeRef>,

    /// Command files waiting in the agent queue.
    pub queued: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<HistoryCounts>,
}

impl StatusReport {
    /// Create a status report for an uninitialized repository.
    pub fn uninitialized(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            is_initialized: false,
            state: None,
            current_prompt: None,
            watcher: None,
            last_command: None,
            pending: Vec::new(),
            rolled_forward: Vec::new(),
            queued: 0,
            counts: None,
        }
    }

    /// Assemble a report from its parts.
    pub fn build(
        repo_root: &Path,
        snapshot: &Snapshot,
        state: ProcessState,
        watcher: WatcherStatus,
        queued: usize,
        rolled_forward: Vec<NodeRef>,
    ) -> Self {
        let current_prompt = state
            .current
            .as_ref()
            .and_then(|n| snapshot.leaf(&n.branch_id, &n.leaf_id))
            .map(|l| l.prompt.clone());

        Self {
            repo_root: repo_root.to_path_buf(),
            is_initialized: true,
            current_prompt,
            watcher: Some(watcher),
            last_command: snapshot.last_execution().cloned(),
            pending: snapshot
                .incomplete()
                .into_iter()
                .map(|r| r.nonce.clone())
                .collect(),
            rolled_forward,
            queued,
            counts: Some(HistoryCounts::of(snapshot)),
            state: Some(state),
        }
    }

    /// The current node, if any.
    pub fn current(&self) -> Option<&NodeRef> {
        self.state.as_ref().and_then(|s| s.current.as_ref())
    }

    /// Whether the watcher is running.
    pub fn watcher_alive(&self) -> bool {
        self.watcher.as_ref().is_some_and(|w| w.alive)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PointerSource;
    use crate::store::tests::{branch, leaf};
    use chrono::Utc;

    #[test]
    fn test_status_report_uninitialized() {
        let report = StatusReport::uninitialized(Path::new("/test/repo"));

        assert!(!report.is_initialized);
        assert!(report.state.is_none());
        assert!(report.current().is_none());
        assert!(!report.watcher_alive());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"repoRoot\""));
        assert!(json.contains("\"isInitialized\":false"));
        // Absent sections are omitted.
        assert!(!json.contains("\"state\""));
        assert!(!json.contains("\"counts\""));
        assert!(!json.contains("\"rolledForward\""));
    }

    #[test]
    fn test_build_reports_current_prompt_and_counts() {
        let root = Path::new("/repo");
        let now = Utc::now();
        let snapshot = Snapshot::from_records(vec![
            branch(root, "b1", None, now),
            leaf(root, "b1", "1", "c1", now),
        ]);
        let state = ProcessState {
            current: Some(NodeRef::new("b1", "1")),
            source: PointerSource::Head,
            head: Some("c1".to_string()),
            vcs_branch: Some("stem/user/b1-feature".to_string()),
            on_branch_ref: true,
            at_tip: true,
            drift: false,
        };
        let watcher = WatcherStatus {
            handle: None,
            alive: false,
        };

        let report = StatusReport::build(root, &snapshot, state, watcher, 2, Vec::new());
        assert_eq!(report.current(), Some(&NodeRef::new("b1", "1")));
        assert_eq!(report.current_prompt.as_deref(), Some("prompt 1"));
        assert_eq!(report.queued, 2);
        assert_eq!(
            report.counts,
            Some(HistoryCounts {
                branches: 1,
                leaves: 1,
                jumps: 0,
                warnings: 0,
            })
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"]["current"]["branchId"], "b1");
        assert_eq!(json["state"]["source"], "head");
    }
}
