//! The append-only metadata log.
//!
//! Every branch, leaf, jump, accepted command, reservation and warning is one
//! JSON line in `.stem/log.jsonl`. Records are never rewritten; the current
//! state of a repository is always a fold over the log (see [`Snapshot`]).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StemError;

// ============================================================================
// NodeRef
// ============================================================================

/// A position in the checkpoint tree: one leaf of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    /// Branch id (e.g. `b1`).
    pub branch_id: String,
    /// Leaf id within the branch (e.g. `2`).
    pub leaf_id: String,
}

impl NodeRef {
    /// Create a node reference.
    pub fn new(branch_id: impl Into<String>, leaf_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            leaf_id: leaf_id.into(),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.branch_id, self.leaf_id)
    }
}

// ============================================================================
// CommandKind
// ============================================================================

/// The kind of command an execution record was accepted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Start a new line (optionally closing out the current one first).
    Branch,
    /// Save a revision on the current line.
    Save,
    /// Navigate to a historical point.
    Jump,
    /// Watcher-triggered revision.
    AutoSave,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch => write!(f, "branch"),
            Self::Save => write!(f, "save"),
            Self::Jump => write!(f, "jump"),
            Self::AutoSave => write!(f, "auto_save"),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A labeled exploration line, paired with one VCS ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub repo_root: PathBuf,
    pub branch_id: String,
    pub slug: String,
    pub user: String,
    pub prompt: String,
    pub summary: String,
    pub vcs_ref: String,
    /// The node this line was started from (`None` for a root line).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<NodeRef>,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

/// One linear revision within a branch, backed by one VCS commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafRecord {
    pub repo_root: PathBuf,
    pub branch_id: String,
    pub leaf_id: String,
    pub prompt: String,
    pub summary: String,
    pub vcs_commit: String,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

impl LeafRecord {
    /// The node this leaf represents.
    pub fn node(&self) -> NodeRef {
        NodeRef::new(&self.branch_id, &self.leaf_id)
    }
}

/// A navigation event. Observational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpRecord {
    pub repo_root: PathBuf,
    pub branch_id: String,
    pub leaf_id: String,
    pub prompt: String,
    pub summary: String,
    /// Path walked from the previous position to the target, both inclusive.
    pub ancestry: Vec<NodeRef>,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

/// One accepted (non-duplicate) command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecution {
    pub repo_root: PathBuf,
    pub nonce: String,
    pub command: CommandKind,
    pub source_file: String,
    pub created_at: DateTime<Utc>,
}

/// Details of a line a reservation is about to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBranch {
    pub slug: String,
    pub user: String,
    pub vcs_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<NodeRef>,
}

/// Ids and intent allocated to a checkpoint before the VCS is touched.
///
/// Written under the serialization lock, so allocated ids are never handed
/// out twice and a crashed checkpoint can be completed from the log alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub repo_root: PathBuf,
    pub nonce: String,
    pub command: CommandKind,
    pub target: NodeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_branch: Option<NewBranch>,
    pub prompt: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Category of a warning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    /// A checkpoint was finalized without a declared intent.
    IntentUndeclared,
    /// An auto-checkpoint was skipped because the tree is on a historical leaf.
    NotAtBranchTip,
    /// The VCS moved without going through stem.
    Drift,
    /// An accepted command was completed from VCS evidence after a crash.
    RolledForward,
}

/// An observational warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningRecord {
    pub repo_root: PathBuf,
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// One line of the metadata log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Record {
    Branch(BranchRecord),
    Leaf(LeafRecord),
    Jump(JumpRecord),
    CommandExecution(CommandExecution),
    Reservation(Reservation),
    Warning(WarningRecord),
}

impl Record {
    /// The repository this record belongs to.
    pub fn repo_root(&self) -> &Path {
        match self {
            Self::Branch(r) => &r.repo_root,
            Self::Leaf(r) => &r.repo_root,
            Self::Jump(r) => &r.repo_root,
            Self::CommandExecution(r) => &r.repo_root,
            Self::Reservation(r) => &r.repo_root,
            Self::Warning(r) => &r.repo_root,
        }
    }

    /// When the record was appended.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Branch(r) => r.created_at,
            Self::Leaf(r) => r.created_at,
            Self::Jump(r) => r.created_at,
            Self::CommandExecution(r) => r.created_at,
            Self::Reservation(r) => r.created_at,
            Self::Warning(r) => r.created_at,
        }
    }
}

// ============================================================================
// MetadataStore
// ============================================================================

/// Handle on one repository's metadata log.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
    repo_root: PathBuf,
}

impl MetadataStore {
    /// Open the log at `path` for the repository at `repo_root`.
    pub fn new(path: impl Into<PathBuf>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            repo_root: repo_root.into(),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The repository every record of this store is scoped by.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Append one record as a single durable JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`StemError::LogIo`] if the record cannot be written and
    /// synced, or [`StemError::InvalidArgument`] if it belongs to another
    /// repository.
    pub fn append(&self, record: &Record) -> Result<(), StemError> {
        if record.repo_root() != self.repo_root {
            return Err(StemError::InvalidArgument(format!(
                "Record for {} cannot be appended to the log of {}",
                record.repo_root().display(),
                self.repo_root.display()
            )));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error("create log directory", e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error("open", e))?;
        self.drop_torn_tail(&mut file)?;
        file.seek(SeekFrom::End(0)).map_err(|e| self.io_error("seek", e))?;

        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line).map_err(|e| self.io_error("write", e))?;
        file.flush().map_err(|e| self.io_error("flush", e))?;
        file.sync_data().map_err(|e| self.io_error("sync", e))?;
        Ok(())
    }

    /// Cut an unterminated final line left by a crashed writer, so the next
    /// record starts on a line of its own.
    fn drop_torn_tail(&self, file: &mut File) -> Result<(), StemError> {
        let len = file.metadata().map_err(|e| self.io_error("stat", e))?.len();
        if len == 0 {
            return Ok(());
        }

        let mut end = len;
        let mut chunk = [0u8; 4096];
        while end > 0 {
            let start = end.saturating_sub(chunk.len() as u64);
            let size = (end - start) as usize;
            file.seek(SeekFrom::Start(start)).map_err(|e| self.io_error("seek", e))?;
            file.read_exact(&mut chunk[..size]).map_err(|e| self.io_error("read", e))?;
            match chunk[..size].iter().rposition(|b| *b == b'\n') {
                Some(pos) if end == len && pos + 1 == size => return Ok(()),
                Some(pos) => {
                    end = start + pos as u64 + 1;
                    break;
                }
                None => end = start,
            }
        }

        tracing::warn!(
            "Discarding {} bytes of torn record at the end of {}",
            len - end,
            self.path.display()
        );
        file.set_len(end).map_err(|e| self.io_error("truncate", e))?;
        Ok(())
    }

    /// Append a record and mirror it into an in-memory snapshot.
    pub fn record(&self, snapshot: &mut Snapshot, record: Record) -> Result<(), StemError> {
        self.append(&record)?;
        snapshot.push(record);
        Ok(())
    }

    /// Read every record of this repository, in append order.
    ///
    /// A final line that does not parse is treated as a write torn by a crash
    /// and skipped; malformed lines anywhere else are errors.
    pub fn load(&self) -> Result<Snapshot, StemError> {
        if !self.path.exists() {
            return Ok(Snapshot::default());
        }

        let file = File::open(&self.path).map_err(|e| self.io_error("open", e))?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| self.io_error("read", e))?;

        let last_content = lines.iter().rposition(|l| !l.trim().is_empty());
        let mut records = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) => {
                    if record.repo_root() == self.repo_root {
                        records.push(record);
                    }
                }
                Err(e) if Some(idx) == last_content => {
                    tracing::warn!(
                        "Skipping torn record at {}:{}: {}",
                        self.path.display(),
                        idx + 1,
                        e
                    );
                }
                Err(e) => {
                    return Err(StemError::LogParse {
                        path: self.path.clone(),
                        line: idx + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(Snapshot { records })
    }

    /// Timestamp for a record appended now: never earlier than anything
    /// already in the log.
    pub fn next_timestamp(&self, snapshot: &Snapshot) -> DateTime<Utc> {
        let now = Utc::now();
        match snapshot.last_created_at() {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> StemError {
        StemError::LogIo {
            path: self.path.clone(),
            reason: format!("{} failed: {}", action, e),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// An in-memory fold of one repository's log.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Vec<Record>,
}

/// Parse the numeric part of an id like `b12` or `7`.
fn id_number(id: &str) -> u64 {
    id.trim_start_matches('b').parse().unwrap_or(0)
}

impl Snapshot {
    /// Build a snapshot from records (used by tests and replays).
    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Mirror a record that was just appended to the store.
    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// All records, in append order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All branches, in append order.
    pub fn branches(&self) -> impl Iterator<Item = &BranchRecord> {
        self.records.iter().filter_map(|r| match r {
            Record::Branch(b) => Some(b),
            _ => None,
        })
    }

    /// All leaves, in append order.
    pub fn leaves(&self) -> impl Iterator<Item = &LeafRecord> {
        self.records.iter().filter_map(|r| match r {
            Record::Leaf(l) => Some(l),
            _ => None,
        })
    }

    /// All jumps, in append order.
    pub fn jumps(&self) -> impl Iterator<Item = &JumpRecord> {
        self.records.iter().filter_map(|r| match r {
            Record::Jump(j) => Some(j),
            _ => None,
        })
    }

    /// All accepted command executions, in append order.
    pub fn executions(&self) -> impl Iterator<Item = &CommandExecution> {
        self.records.iter().filter_map(|r| match r {
            Record::CommandExecution(c) => Some(c),
            _ => None,
        })
    }

    /// All warnings, in append order.
    pub fn warnings(&self) -> impl Iterator<Item = &WarningRecord> {
        self.records.iter().filter_map(|r| match r {
            Record::Warning(w) => Some(w),
            _ => None,
        })
    }

    /// All reservations, in append order.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.records.iter().filter_map(|r| match r {
            Record::Reservation(r) => Some(r),
            _ => None,
        })
    }

    /// Look up a branch by id.
    pub fn branch(&self, branch_id: &str) -> Option<&BranchRecord> {
        self.branches().find(|b| b.branch_id == branch_id)
    }

    /// The branch whose VCS ref has the given name.
    pub fn branch_by_ref(&self, vcs_ref: &str) -> Option<&BranchRecord> {
        self.branches().find(|b| b.vcs_ref == vcs_ref)
    }

    /// Leaves of one branch, ordered by `created_at` then insertion.
    pub fn leaves_of(&self, branch_id: &str) -> Vec<&LeafRecord> {
        let mut leaves: Vec<&LeafRecord> =
            self.leaves().filter(|l| l.branch_id == branch_id).collect();
        // Stable sort keeps insertion order for equal timestamps.
        leaves.sort_by_key(|l| l.created_at);
        leaves
    }

    /// Look up one leaf.
    pub fn leaf(&self, branch_id: &str, leaf_id: &str) -> Option<&LeafRecord> {
        self.leaves()
            .find(|l| l.branch_id == branch_id && l.leaf_id == leaf_id)
    }

    /// The leaf backed by the given commit.
    pub fn leaf_by_commit(&self, commit: &str) -> Option<&LeafRecord> {
        self.leaves().find(|l| l.vcs_commit == commit)
    }

    /// Most recently created leaf of a branch (ties: last inserted).
    pub fn latest_leaf(&self, branch_id: &str) -> Option<&LeafRecord> {
        self.leaves_of(branch_id).last().copied()
    }

    /// Earliest leaf of a branch (ties: first inserted).
    pub fn first_leaf(&self, branch_id: &str) -> Option<&LeafRecord> {
        self.leaves_of(branch_id).first().copied()
    }

    /// The execution record for a nonce.
    pub fn execution(&self, nonce: &str) -> Option<&CommandExecution> {
        self.executions().find(|c| c.nonce == nonce)
    }

    /// The reservation made under a nonce.
    pub fn reservation(&self, nonce: &str) -> Option<&Reservation> {
        self.reservations().find(|r| r.nonce == nonce)
    }

    /// The leaf appended under a nonce.
    pub fn leaf_by_nonce(&self, nonce: &str) -> Option<&LeafRecord> {
        self.leaves().find(|l| l.nonce == nonce)
    }

    /// The branch appended under a nonce.
    pub fn branch_by_nonce(&self, nonce: &str) -> Option<&BranchRecord> {
        self.branches().find(|b| b.nonce == nonce)
    }

    /// The jump appended under a nonce.
    pub fn jump_by_nonce(&self, nonce: &str) -> Option<&JumpRecord> {
        self.jumps().find(|j| j.nonce == nonce)
    }

    /// Whether the command accepted under `nonce` has fully landed.
    ///
    /// A command is complete once its final record exists: the leaf for
    /// checkpoints (a branch's first leaf shares the branch nonce) or the jump.
    pub fn is_complete(&self, nonce: &str) -> bool {
        self.leaf_by_nonce(nonce).is_some() || self.jump_by_nonce(nonce).is_some()
    }

    /// Accepted commands that reserved ids but never landed.
    pub fn incomplete(&self) -> Vec<&Reservation> {
        self.reservations()
            .filter(|r| !self.is_complete(&r.nonce))
            .collect()
    }

    /// A leaf landed on the reserved branch with a higher id than the
    /// reservation, which can then no longer extend the line.
    pub fn overtaken_by(&self, reservation: &Reservation) -> Option<&LeafRecord> {
        let reserved = id_number(&reservation.target.leaf_id);
        self.leaves()
            .filter(|l| l.branch_id == reservation.target.branch_id)
            .filter(|l| l.nonce != reservation.nonce)
            .find(|l| id_number(&l.leaf_id) > reserved)
    }

    /// Whether a warning of `kind` about `node` was recorded since the last
    /// leaf or jump moved the working tree.
    pub fn warned_since_last_move(&self, kind: WarningKind, node: &NodeRef) -> bool {
        for record in self.records.iter().rev() {
            match record {
                Record::Leaf(_) | Record::Jump(_) => return false,
                Record::Warning(w) if w.kind == kind && w.node.as_ref() == Some(node) => return true,
                _ => {}
            }
        }
        false
    }

    /// The most recently accepted command.
    pub fn last_execution(&self) -> Option<&CommandExecution> {
        self.executions().last()
    }

    /// Next free branch id (`b1`, `b2`, ...). Reservations count as taken.
    pub fn next_branch_id(&self) -> String {
        let from_branches = self.branches().map(|b| id_number(&b.branch_id));
        let from_reservations = self
            .reservations()
            .filter(|r| r.new_branch.is_some())
            .map(|r| id_number(&r.target.branch_id));
        let max = from_branches.chain(from_reservations).max().unwrap_or(0);
        format!("b{}", max + 1)
    }

    /// Next free leaf id on a branch (`1`, `2`, ...). Reservations count as taken.
    pub fn next_leaf_id(&self, branch_id: &str) -> String {
        let from_leaves = self
            .leaves()
            .filter(|l| l.branch_id == branch_id)
            .map(|l| id_number(&l.leaf_id));
        let from_reservations = self
            .reservations()
            .filter(|r| r.target.branch_id == branch_id)
            .map(|r| id_number(&r.target.leaf_id));
        let max = from_leaves.chain(from_reservations).max().unwrap_or(0);
        (max + 1).to_string()
    }

    /// Latest `created_at` in the log.
    pub fn last_created_at(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(Record::created_at).max()
    }

    /// Position implied by the log alone: the target of the last leaf or jump.
    pub fn last_position(&self) -> Option<NodeRef> {
        self.records.iter().rev().find_map(|r| match r {
            Record::Leaf(l) => Some(l.node()),
            Record::Jump(j) => Some(NodeRef::new(&j.branch_id, &j.leaf_id)),
            _ => None,
        })
    }

    /// Fork chain of a branch, root first, ending with the branch itself.
    ///
    /// Each element is the node where the next line forked off; the last
    /// element carries the branch id with an empty leaf id.
    pub fn fork_chain(&self, branch_id: &str) -> Vec<NodeRef> {
        let mut chain = vec![NodeRef::new(branch_id, "")];
        let mut current = branch_id.to_string();
        // Bounded by the number of branches so a corrupt cycle cannot spin.
        for _ in 0..self.branches().count() {
            match self.branch(&current).and_then(|b| b.forked_from.clone()) {
                Some(parent) => {
                    current = parent.branch_id.clone();
                    chain.push(parent);
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Branch ids in the subtree rooted at `root` (inclusive).
    pub fn subtree(&self, root: &str) -> Vec<String> {
        let mut members = vec![root.to_string()];
        let mut changed = true;
        while changed {
            changed = false;
            for b in self.branches() {
                if members.contains(&b.branch_id) {
                    continue;
                }
                if let Some(parent) = &b.forked_from {
                    if members.contains(&parent.branch_id) {
                        members.push(b.branch_id.clone());
                        changed = true;
                    }
                }
            }
        }
        members
    }
}

// ============================================================================
// Tests
// ============================================================================
