//! History query over the metadata log.
//!
//! Read-only, paginated access to branches, leaves and jumps for listing
//! front-ends. Entries are ordered by `created_at` ascending and may be
//! restricted to a root branch and every line forked from it.
//!
//! ## Usage
//!
//! ```ignore
//! use stem_core::log::{HistoryKind, HistoryQuery};
//!
//! let query = HistoryQuery::new()
//!     .with_kinds(vec![HistoryKind::Leaf])
//!     .with_root("b1")
//!     .with_limit(20);
//!
//! let page = engine.query(&query)?;
//! for entry in page.entries {
//!     println!("{:?}", entry);
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StemError;
use crate::store::{BranchRecord, JumpRecord, LeafRecord, Record, Snapshot};

/// Default page size.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

// ============================================================================
// HistoryKind
// ============================================================================

/// The kind of history entry to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Branch,
    Leaf,
    Jump,
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch => write!(f, "branch"),
            Self::Leaf => write!(f, "leaf"),
            Self::Jump => write!(f, "jump"),
        }
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "branch" | "branches" => Ok(Self::Branch),
            "leaf" | "leaves" => Ok(Self::Leaf),
            "jump" | "jumps" => Ok(Self::Jump),
            other => Err(format!("Unknown history kind: {}", other)),
        }
    }
}

// ============================================================================
// HistoryQuery
// ============================================================================

/// Scope and pagination of a history query.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Kinds to include (empty = all).
    pub kinds: Vec<HistoryKind>,
    /// Restrict to this branch and its descendants.
    pub root_branch: Option<String>,
    /// Entries to skip.
    pub offset: usize,
    /// Maximum entries to return (None = [`DEFAULT_PAGE_LIMIT`]).
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Create an unfiltered query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the kind filter.
    pub fn with_kinds(mut self, kinds: Vec<HistoryKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Set the root branch filter.
    pub fn with_root(mut self, branch_id: impl Into<String>) -> Self {
        self.root_branch = Some(branch_id.into());
        self
    }

    /// Set the offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn includes(&self, kind: HistoryKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// Run the query against a loaded snapshot.
    ///
    /// # Errors
    ///
    /// [`StemError::UnknownBranch`] if `root_branch` names no branch.
    pub fn run(&self, snapshot: &Snapshot, repo_root: &Path) -> Result<HistoryPage, StemError> {
        let scope: Option<HashSet<String>> = match &self.root_branch {
            Some(root) => {
                if snapshot.branch(root).is_none() {
                    return Err(StemError::UnknownBranch {
                        repo_root: repo_root.to_path_buf(),
                        branch_id: root.clone(),
                    });
                }
                Some(snapshot.subtree(root).into_iter().collect())
            }
            None => None,
        };
        let in_scope = |branch_id: &str| scope.as_ref().is_none_or(|s| s.contains(branch_id));

        let mut entries: Vec<HistoryEntry> = snapshot
            .records()
            .iter()
            .filter_map(|record| match record {
                Record::Branch(b) if self.includes(HistoryKind::Branch) && in_scope(&b.branch_id) => {
                    Some(HistoryEntry::Branch(b.clone()))
                }
                Record::Leaf(l) if self.includes(HistoryKind::Leaf) && in_scope(&l.branch_id) => {
                    Some(HistoryEntry::Leaf(l.clone()))
                }
                Record::Jump(j) if self.includes(HistoryKind::Jump) && in_scope(&j.branch_id) => {
                    Some(HistoryEntry::Jump(j.clone()))
                }
                _ => None,
            })
            .collect();

        // Stable: equal timestamps keep log order.
        entries.sort_by_key(|e| e.created_at());

        let total = entries.len();
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        let entries = entries.into_iter().skip(self.offset).take(limit).collect();

        Ok(HistoryPage {
            entries,
            total,
            offset: self.offset,
            limit,
        })
    }
}

// ============================================================================
// HistoryEntry / HistoryPage
// ============================================================================

/// One history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEntry {
    Branch(BranchRecord),
    Leaf(LeafRecord),
    Jump(JumpRecord),
}

impl HistoryEntry {
    /// When the entry was recorded.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Branch(e) => e.created_at,
            Self::Leaf(e) => e.created_at,
            Self::Jump(e) => e.created_at,
        }
    }

    /// Branch the entry belongs to.
    pub fn branch_id(&self) -> &str {
        match self {
            Self::Branch(e) => &e.branch_id,
            Self::Leaf(e) => &e.branch_id,
            Self::Jump(e) => &e.branch_id,
        }
    }

    /// Kind of the entry.
    pub fn kind(&self) -> HistoryKind {
        match self {
            Self::Branch(_) => HistoryKind::Branch,
            Self::Leaf(_) => HistoryKind::Leaf,
            Self::Jump(_) => HistoryKind::Jump,
        }
    }
}

/// One page of history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    /// Matching entries before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl HistoryPage {
    /// Whether entries exist past this page.
    pub fn has_more(&self) -> bool {
        self.offset + self.entries.len() < self.total
    }
}

// ============================================================================
// Tests
// ============================================================================
