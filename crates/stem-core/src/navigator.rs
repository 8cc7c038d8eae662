//! Resolution of branch/leaf identifiers and ancestry paths.
//!
//! Everything here is a pure function of a [`Snapshot`]; the engine performs
//! the checkout and appends the jump record.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::StemError;
use crate::store::{LeafRecord, NodeRef, Snapshot};

/// Which leaf of a branch a jump targets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeafSelector {
    /// The most recently created leaf.
    #[default]
    Latest,
    /// The earliest leaf.
    First,
    /// A specific leaf id.
    Id(String),
}

impl FromStr for LeafSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "latest" => Ok(Self::Latest),
            "first" => Ok(Self::First),
            id if id.chars().all(|c| c.is_ascii_digit()) => Ok(Self::Id(id.to_string())),
            other => Err(format!(
                "Invalid leaf selector '{}'. Use 'latest', 'first' or a leaf number.",
                other
            )),
        }
    }
}

impl std::fmt::Display for LeafSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::First => write!(f, "first"),
            Self::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Resolve a branch and selector to an existing leaf.
///
/// # Errors
///
/// [`StemError::UnknownBranch`] if the branch does not exist,
/// [`StemError::UnknownLeaf`] if the selected leaf does not.
pub fn resolve<'s>(
    snapshot: &'s Snapshot,
    repo_root: &Path,
    branch_id: &str,
    selector: &LeafSelector,
) -> Result<&'s LeafRecord, StemError> {
    if snapshot.branch(branch_id).is_none() {
        return Err(StemError::UnknownBranch {
            repo_root: repo_root.to_path_buf(),
            branch_id: branch_id.to_string(),
        });
    }

    let found = match selector {
        LeafSelector::Latest => snapshot.latest_leaf(branch_id),
        LeafSelector::First => snapshot.first_leaf(branch_id),
        LeafSelector::Id(id) => snapshot.leaf(branch_id, id),
    };
    found.ok_or_else(|| StemError::UnknownLeaf {
        repo_root: repo_root.to_path_buf(),
        branch_id: branch_id.to_string(),
        leaf_id: selector.to_string(),
    })
}

/// Path from the first leaf of the root line down to `node`, inclusive.
pub fn lineage(snapshot: &Snapshot, node: &NodeRef) -> Vec<NodeRef> {
    let chain = snapshot.fork_chain(&node.branch_id);
    let last = chain.len().saturating_sub(1);
    let mut path = Vec::new();

    for (idx, segment) in chain.iter().enumerate() {
        let stop_at = if idx == last {
            &node.leaf_id
        } else {
            &segment.leaf_id
        };
        for leaf in snapshot.leaves_of(&segment.branch_id) {
            path.push(leaf.node());
            if &leaf.leaf_id == stop_at {
                break;
            }
        }
    }
    path
}

/// Nodes walked when moving from `from` to `to`: up to the closest common
/// ancestor, then down to the target, both ends inclusive.
pub fn ancestry(snapshot: &Snapshot, from: Option<&NodeRef>, to: &NodeRef) -> Vec<NodeRef> {
    let down_line = lineage(snapshot, to);
    let Some(from) = from else {
        return down_line;
    };
    let up_line = lineage(snapshot, from);

    let common = up_line
        .iter()
        .zip(down_line.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut path: Vec<NodeRef> = if common == 0 {
        up_line.iter().rev().cloned().collect()
    } else {
        up_line[common - 1..].iter().rev().cloned().collect()
    };
    path.extend(down_line[common..].iter().cloned());

    if path.is_empty() {
        path.push(to.clone());
    }
    path
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{branch, leaf};
    use chrono::{Duration, Utc};

    fn tree() -> Snapshot {
        // b1: 1 - 2 - 3
        //          \
        //     b2:   1 - 2
        let root = Path::new("/repo");
        let t = Utc::now();
        Snapshot::from_records(vec![
            branch(root, "b1", None, t),
            leaf(root, "b1", "1", "c11", t),
            leaf(root, "b1", "2", "c12", t + Duration::seconds(1)),
            leaf(root, "b1", "3", "c13", t + Duration::seconds(2)),
            branch(root, "b2", Some(NodeRef::new("b1", "2")), t + Duration::seconds(3)),
            leaf(root, "b2", "1", "c21", t + Duration::seconds(3)),
            leaf(root, "b2", "2", "c22", t + Duration::seconds(4)),
        ])
    }

    fn nodes(spec: &[(&str, &str)]) -> Vec<NodeRef> {
        spec.iter().map(|(b, l)| NodeRef::new(*b, *l)).collect()
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("".parse::<LeafSelector>().unwrap(), LeafSelector::Latest);
        assert_eq!("first".parse::<LeafSelector>().unwrap(), LeafSelector::First);
        assert_eq!(
            "12".parse::<LeafSelector>().unwrap(),
            LeafSelector::Id("12".to_string())
        );
        assert!("b1/2".parse::<LeafSelector>().is_err());
    }

    #[test]
    fn test_resolve_latest_first_and_id() {
        let snapshot = tree();
        let root = Path::new("/repo");
        assert_eq!(resolve(&snapshot, root, "b1", &LeafSelector::Latest).unwrap().leaf_id, "3");
        assert_eq!(resolve(&snapshot, root, "b1", &LeafSelector::First).unwrap().leaf_id, "1");
        assert_eq!(
            resolve(&snapshot, root, "b2", &LeafSelector::Id("1".to_string()))
                .unwrap()
                .vcs_commit,
            "c21"
        );
    }

    #[test]
    fn test_resolve_not_found() {
        let snapshot = tree();
        let root = Path::new("/repo");
        assert!(matches!(
            resolve(&snapshot, root, "b9", &LeafSelector::Latest),
            Err(StemError::UnknownBranch { .. })
        ));
        assert!(matches!(
            resolve(&snapshot, root, "b1", &LeafSelector::Id("7".to_string())),
            Err(StemError::UnknownLeaf { .. })
        ));
    }

    #[test]
    fn test_lineage_crosses_fork_points() {
        let snapshot = tree();
        assert_eq!(
            lineage(&snapshot, &NodeRef::new("b2", "2")),
            nodes(&[("b1", "1"), ("b1", "2"), ("b2", "1"), ("b2", "2")])
        );
    }

    #[test]
    fn test_ancestry_goes_up_then_down() {
        let snapshot = tree();
        let path = ancestry(
            &snapshot,
            Some(&NodeRef::new("b1", "3")),
            &NodeRef::new("b2", "2"),
        );
        assert_eq!(
            path,
            nodes(&[("b1", "3"), ("b1", "2"), ("b2", "1"), ("b2", "2")])
        );
    }

    #[test]
    fn test_ancestry_within_a_line() {
        let snapshot = tree();
        assert_eq!(
            ancestry(&snapshot, Some(&NodeRef::new("b1", "3")), &NodeRef::new("b1", "1")),
            nodes(&[("b1", "3"), ("b1", "2"), ("b1", "1")])
        );
        assert_eq!(
            ancestry(&snapshot, Some(&NodeRef::new("b1", "2")), &NodeRef::new("b1", "2")),
            nodes(&[("b1", "2")])
        );
        assert_eq!(
            ancestry(&snapshot, None, &NodeRef::new("b1", "2")),
            nodes(&[("b1", "1"), ("b1", "2")])
        );
    }
}
