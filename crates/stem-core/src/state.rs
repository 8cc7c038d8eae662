//! Process state reconstruction.
//!
//! [`ProcessState`] is never persisted: every command rebuilds it from VCS
//! facts first and the metadata log second, so a lost or stale in-memory
//! pointer cannot survive past the next invocation.

use serde::Serialize;

use crate::errors::StemError;
use crate::store::{NodeRef, Snapshot};
use crate::vcs::Vcs;

/// Where the current pointer was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PointerSource {
    /// HEAD is the commit of a known leaf.
    Head,
    /// HEAD is attached to a known branch ref.
    BranchRef,
    /// Only the log knows; the VCS gave no usable answer.
    Log,
    /// Nothing recorded yet.
    None,
}

/// Reconstructed view of where the working tree stands.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    /// Current node (branch pointer plus leaf).
    pub current: Option<NodeRef>,
    /// How `current` was found.
    pub source: PointerSource,
    /// Commit at HEAD.
    pub head: Option<String>,
    /// Checked-out VCS branch name, `None` when detached.
    pub vcs_branch: Option<String>,
    /// HEAD is attached to the current branch's ref, so a new commit
    /// extends the line.
    pub on_branch_ref: bool,
    /// `current` is the latest leaf of its branch.
    pub at_tip: bool,
    /// HEAD moved outside stem (commits or checkouts made directly).
    pub drift: bool,
}

impl ProcessState {
    /// Rebuild the state from the VCS and the log.
    ///
    /// Precedence: the leaf whose commit is HEAD, then the branch whose ref is
    /// checked out, then the last position recorded in the log.
    pub fn reconstruct<V: Vcs>(snapshot: &Snapshot, vcs: &V) -> Result<Self, StemError> {
        let head = vcs.head_commit()?;
        let vcs_branch = vcs.current_branch()?;
        let attached = vcs_branch
            .as_deref()
            .and_then(|name| snapshot.branch_by_ref(name));
        // A branch ref created by an interrupted `branch` command awaiting replay.
        let reserved_ref = vcs_branch.as_deref().is_some_and(|name| {
            snapshot
                .incomplete()
                .iter()
                .any(|r| r.new_branch.as_ref().is_some_and(|nb| nb.vcs_ref == name))
        });

        let mut state = Self {
            current: None,
            source: PointerSource::None,
            head: head.clone(),
            vcs_branch: vcs_branch.clone(),
            on_branch_ref: false,
            at_tip: false,
            drift: false,
        };

        if let Some(leaf) = head.as_deref().and_then(|h| snapshot.leaf_by_commit(h)) {
            state.current = Some(leaf.node());
            state.source = PointerSource::Head;
            state.on_branch_ref = attached.is_some_and(|b| b.branch_id == leaf.branch_id);
            // Attached to some other line at the same commit (a branch whose
            // first checkpoint has not landed yet) is not drift.
            state.drift = attached.is_none() && vcs_branch.is_some() && !reserved_ref;
        } else if let Some(branch) = attached {
            state.current = snapshot
                .latest_leaf(&branch.branch_id)
                .map(|l| l.node())
                .or_else(|| Some(NodeRef::new(&branch.branch_id, "")));
            state.source = PointerSource::BranchRef;
            state.on_branch_ref = true;
            state.drift = head.is_some()
                && snapshot.latest_leaf(&branch.branch_id).is_some();
        } else if let Some(position) = snapshot.last_position() {
            state.current = Some(position);
            state.source = PointerSource::Log;
            state.drift = head.is_some() && !reserved_ref;
        }

        if let Some(current) = &state.current {
            state.at_tip = snapshot
                .latest_leaf(&current.branch_id)
                .is_some_and(|tip| tip.leaf_id == current.leaf_id);
        }

        if state.drift {
            tracing::warn!(
                "VCS state moved outside stem (HEAD {}, branch {})",
                state.head.as_deref().unwrap_or("none"),
                state.vcs_branch.as_deref().unwrap_or("detached")
            );
        }
        tracing::debug!(
            "Reconstructed pointer {:?} from {:?}",
            state.current.as_ref().map(|n| n.to_string()),
            state.source
        );
        Ok(state)
    }

    /// Branch the pointer is on.
    pub fn current_branch(&self) -> Option<&str> {
        self.current.as_ref().map(|n| n.branch_id.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{branch, leaf};
    use crate::store::{CommandKind, NewBranch, Record, Reservation};
    use crate::vcs::tests::git_repo;
    use chrono::{Duration, Utc};

    const REF: &str = "stem/user/b1-feature";

    #[test]
    fn test_nothing_recorded() {
        let (_temp, git) = git_repo();
        let state = ProcessState::reconstruct(&Snapshot::default(), &git).unwrap();
        assert_eq!(state.current, None);
        assert_eq!(state.source, PointerSource::None);
        assert!(!state.drift);
    }

    #[test]
    fn test_pointer_from_head_and_branch_ref() {
        let (_temp, git) = git_repo();
        git.create_branch(REF).unwrap();
        let c1 = git.commit("one").unwrap();
        let c2 = git.commit("two").unwrap();

        let root = git.root().to_path_buf();
        let t = Utc::now();
        let snapshot = Snapshot::from_records(vec![
            branch(&root, "b1", None, t),
            leaf(&root, "b1", "1", &c1, t),
            leaf(&root, "b1", "2", &c2, t + Duration::seconds(1)),
        ]);

        let state = ProcessState::reconstruct(&snapshot, &git).unwrap();
        assert_eq!(state.current, Some(NodeRef::new("b1", "2")));
        assert_eq!(state.source, PointerSource::Head);
        assert!(state.on_branch_ref);
        assert!(state.at_tip);
        assert!(!state.drift);

        git.checkout_detached(&c1).unwrap();
        let state = ProcessState::reconstruct(&snapshot, &git).unwrap();
        assert_eq!(state.current, Some(NodeRef::new("b1", "1")));
        assert!(!state.on_branch_ref);
        assert!(!state.at_tip);
        assert_eq!(state.vcs_branch, None);
    }

    #[test]
    fn test_ref_of_interrupted_branch_is_not_drift() {
        let (_temp, git) = git_repo();
        git.create_branch(REF).unwrap();
        let c1 = git.commit("one").unwrap();

        let root = git.root().to_path_buf();
        let t = Utc::now();
        let next_ref = "stem/user/b2-next";
        let mut snapshot = Snapshot::from_records(vec![
            branch(&root, "b1", None, t),
            leaf(&root, "b1", "1", &c1, t),
        ]);
        snapshot.push(Record::Reservation(Reservation {
            repo_root: root.clone(),
            nonce: "n2".to_string(),
            command: CommandKind::Branch,
            target: NodeRef::new("b2", "1"),
            new_branch: Some(NewBranch {
                slug: "next".to_string(),
                user: "user".to_string(),
                vcs_ref: next_ref.to_string(),
                forked_from: Some(NodeRef::new("b1", "1")),
            }),
            prompt: "next".to_string(),
            summary: String::new(),
            created_at: t,
        }));

        git.create_branch(next_ref).unwrap();
        let state = ProcessState::reconstruct(&snapshot, &git).unwrap();
        assert_eq!(state.current, Some(NodeRef::new("b1", "1")));
        assert!(!state.drift);

        git.create_branch("scratch").unwrap();
        let state = ProcessState::reconstruct(&snapshot, &git).unwrap();
        assert!(state.drift);
    }

    #[test]
    fn test_commit_outside_stem_is_drift() {
        let (_temp, git) = git_repo();
        git.create_branch(REF).unwrap();
        let c1 = git.commit("one").unwrap();
        git.commit("made directly with git").unwrap();

        let root = git.root().to_path_buf();
        let t = Utc::now();
        let snapshot = Snapshot::from_records(vec![
            branch(&root, "b1", None, t),
            leaf(&root, "b1", "1", &c1, t),
        ]);

        let state = ProcessState::reconstruct(&snapshot, &git).unwrap();
        assert_eq!(state.source, PointerSource::BranchRef);
        assert_eq!(state.current, Some(NodeRef::new("b1", "1")));
        assert_eq!(state.current_branch(), Some("b1"));
        assert!(state.on_branch_ref);
        assert!(state.drift);
    }
}
