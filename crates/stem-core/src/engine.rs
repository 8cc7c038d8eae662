//! Stem engine – the state-synchronization core.
//!
//! The [`StemEngine`] keeps the metadata log consistent with the VCS across
//! interactive commands, the background watcher and navigation. Every
//! mutating operation runs the same sequence under the repository lock:
//!
//! 1. load the log and roll forward interrupted checkpoints;
//! 2. rebuild [`ProcessState`] from the VCS;
//! 3. check preconditions, then pass the [`IdempotencyGate`];
//! 4. reserve ids, mutate the VCS through the [`Orchestrator`];
//! 5. append the resulting records.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{MissingIntentPolicy, StemConfig};
use crate::constants::{MAX_SLUG_LEN, MAX_USER_LEN, STEM_DIR};
use crate::doctor::{self, DoctorReport};
use crate::errors::StemError;
use crate::gate::{Admission, IdempotencyGate};
use crate::intent::{archive_file, list_queue, slugify, Intent, IntentFile, QueueCommandKind, QueuedCommand};
use crate::lock::RepoLock;
use crate::log::{HistoryPage, HistoryQuery};
use crate::navigator::{self, LeafSelector};
use crate::orchestrator::{CheckoutTarget, CheckpointMessage, CheckpointStep, Orchestrator};
use crate::process::watcher_liveness;
use crate::registry::Registry;
use crate::state::ProcessState;
use crate::status::StatusReport;
use crate::store::{
    BranchRecord, CommandKind, JumpRecord, LeafRecord, MetadataStore, NewBranch, NodeRef, Record,
    Reservation, Snapshot, WarningKind, WarningRecord,
};
use crate::vcs::{GitCli, Vcs};
use crate::workspace::Workspace;

/// Summary recorded for placeholder auto-checkpoints.
const PLACEHOLDER_SUMMARY: &str = "no intent declared";

// ============================================================================
// Requests and outcomes
// ============================================================================

/// Identity of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Caller-chosen idempotency key.
    pub nonce: String,
    /// Where the command came from (`cli`, `watcher`, or a queue file path).
    pub source_file: String,
}

impl CommandRequest {
    /// Create a request.
    pub fn new(nonce: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
            source_file: source_file.into(),
        }
    }

    /// A request issued from the command line.
    pub fn cli(nonce: impl Into<String>) -> Self {
        Self::new(nonce, "cli")
    }
}

/// Result of a mutating command.
///
/// A duplicate nonce is a successful no-op, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome<T> {
    /// The command took effect (possibly by resuming an interrupted run).
    Applied(T),
    /// The nonce was already applied; nothing happened.
    Duplicate { nonce: String },
}

impl<T> Outcome<T> {
    /// Transform the applied value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Applied(value) => Outcome::Applied(f(value)),
            Self::Duplicate { nonce } => Outcome::Duplicate { nonce },
        }
    }

    /// Whether the command was a duplicate.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    /// The applied value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Duplicate { .. } => None,
        }
    }
}

/// Result of `init`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub repo_root: PathBuf,
    /// `.stem/` was created by this call.
    pub created: bool,
    /// `git init` was run by this call.
    pub vcs_initialized: bool,
    /// The repository is listed in the global registry.
    pub registered: bool,
}

/// Result of starting a new line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchResult {
    pub branch: BranchRecord,
    /// Leaf `1` of the new line.
    pub leaf: LeafRecord,
    /// Leaf saved on the previous line before branching, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closing: Option<LeafRecord>,
}

/// Result of a jump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpResult {
    pub jump: JumpRecord,
    pub vcs_commit: String,
    /// HEAD was attached to the branch ref (the target is the tip).
    pub attached: bool,
    /// Shelved entry holding prior uncommitted work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shelved: Option<String>,
}

/// What an auto-checkpoint attempt did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum AutoCheckpoint {
    /// A leaf was created.
    Saved { leaf: LeafRecord, placeholder: bool },
    /// No intent was declared and the policy is `block`.
    Blocked,
    /// The working tree is on a historical leaf; nothing was committed.
    NotAtTip { node: NodeRef },
    /// No line has been started yet.
    NoBranch,
    /// The working tree has no changes outside `.stem/`.
    NoChanges,
}

/// How a queue file was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    Done,
    Duplicate,
    Invalid,
    /// Left in the queue after a retryable failure.
    Deferred,
}

impl Disposition {
    fn suffix(self) -> Option<&'static str> {
        match self {
            Self::Done => Some("done"),
            Self::Duplicate => Some("duplicate"),
            Self::Invalid => Some("invalid"),
            Self::Deferred => None,
        }
    }
}

/// One processed queue file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainedCommand {
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub state: ProcessState,
    /// Leaves appended from VCS evidence.
    pub rolled_forward: Vec<NodeRef>,
    /// Accepted commands with no VCS evidence; replay their nonce to finish.
    pub pending: Vec<String>,
}

// ============================================================================
// StemEngine
// ============================================================================

/// The stem engine for one repository.
///
/// # Example
///
/// ```ignore
/// use stem_core::{CommandRequest, Intent, StemEngine};
///
/// let mut engine = StemEngine::open(Path::new("."), None)?;
/// engine.init()?;
/// let intent = Intent::new("add feature", "first cut")?;
/// engine.start_branch(&CommandRequest::cli("n1"), &intent, None)?;
/// ```
#[derive(Debug)]
pub struct StemEngine<V: Vcs = GitCli> {
    workspace: Workspace,
    config: StemConfig,
    vcs: V,
    store: MetadataStore,
    registry: Option<Registry>,
}

impl StemEngine<GitCli> {
    /// Open the repository containing `start_dir` with the git CLI.
    ///
    /// `config_path` overrides the global configuration file location.
    pub fn open(start_dir: &Path, config_path: Option<&Path>) -> Result<Self, StemError> {
        let workspace = Workspace::resolve(start_dir)?;
        let global = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => StemConfig::default_path(),
        };
        let repo_config = workspace.config_path();
        let config = StemConfig::load(global.as_deref(), Some(&repo_config))?;
        let vcs = GitCli::new(workspace.root(), config.vcs.program.clone());

        let mut engine = Self::with_vcs(workspace, config, vcs);
        engine.registry = Registry::open_default().ok();
        Ok(engine)
    }
}

impl<V: Vcs> StemEngine<V> {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create an engine over an explicit VCS adapter.
    pub fn with_vcs(workspace: Workspace, config: StemConfig, vcs: V) -> Self {
        let store = MetadataStore::new(workspace.log_path(), workspace.root());
        Self {
            workspace,
            config,
            vcs,
            store,
            registry: None,
        }
    }

    /// Use `registry` for register-on-init.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The governed workspace.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The resolved configuration.
    pub fn config(&self) -> &StemConfig {
        &self.config
    }

    /// Mutable access to the configuration (CLI overrides).
    pub fn config_mut(&mut self) -> &mut StemConfig {
        &mut self.config
    }

    /// The VCS adapter.
    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// The metadata store.
    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn orchestrator(&self) -> Orchestrator<'_, V> {
        Orchestrator::new(&self.vcs, &self.config.vcs.ref_prefix)
    }

    // -------------------------------------------------------------------------
    // Init
    // -------------------------------------------------------------------------

    /// Prepare the repository: `.stem/`, VCS exclusion, registry entry.
    ///
    /// Idempotent.
    pub fn init(&mut self) -> Result<InitReport, StemError> {
        let created = !self.workspace.is_initialized();
        std::fs::create_dir_all(self.workspace.queue_dir())?;
        std::fs::create_dir_all(self.workspace.archive_dir())?;

        let vcs_initialized = !self.vcs.is_repository();
        if vcs_initialized {
            self.vcs.init_repository()?;
        }
        self.vcs.exclude(&format!("{}/", STEM_DIR))?;

        let registered = match &self.registry {
            Some(registry) => match registry.register(self.workspace.root()) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Could not register repository: {}", e);
                    false
                }
            },
            None => false,
        };

        self.workspace = self.workspace.refreshed()?;
        if created {
            tracing::info!("Initialized stem in {}", self.workspace.root().display());
        }
        Ok(InitReport {
            repo_root: self.workspace.root().to_path_buf(),
            created,
            vcs_initialized,
            registered,
        })
    }

    // -------------------------------------------------------------------------
    // Shared steps
    // -------------------------------------------------------------------------

    /// Lock, load, and roll forward.
    fn begin(&self, command: CommandKind) -> Result<(RepoLock, Snapshot), StemError> {
        self.workspace.require_initialized()?;
        let lock = RepoLock::acquire(
            &self.workspace.lock_path(),
            self.workspace.root(),
            &command.to_string(),
            &self.config.lock,
        )?;
        let mut snapshot = self.store.load()?;
        self.roll_forward(&mut snapshot)?;
        Ok((lock, snapshot))
    }

    fn gate(&self) -> IdempotencyGate<'_> {
        IdempotencyGate::new(&self.store)
    }

    fn warn(
        &self,
        snapshot: &mut Snapshot,
        kind: WarningKind,
        nonce: Option<&str>,
        node: Option<NodeRef>,
        message: String,
    ) -> Result<(), StemError> {
        tracing::warn!("{}", message);
        let record = Record::Warning(WarningRecord {
            repo_root: self.store.repo_root().to_path_buf(),
            kind,
            nonce: nonce.map(str::to_string),
            node,
            message,
            created_at: self.store.next_timestamp(snapshot),
        });
        self.store.record(snapshot, record)
    }

    /// Allocate ids for a checkpoint, or return the earlier allocation for
    /// the same nonce.
    fn reserve(
        &self,
        snapshot: &mut Snapshot,
        nonce: &str,
        command: CommandKind,
        target: NodeRef,
        new_branch: Option<NewBranch>,
        intent: &Intent,
    ) -> Result<Reservation, StemError> {
        if let Some(existing) = snapshot.reservation(nonce) {
            return Ok(existing.clone());
        }
        let reservation = Reservation {
            repo_root: self.store.repo_root().to_path_buf(),
            nonce: nonce.to_string(),
            command,
            target,
            new_branch,
            prompt: intent.prompt.clone(),
            summary: intent.summary.clone(),
            created_at: self.store.next_timestamp(snapshot),
        };
        self.store
            .record(snapshot, Record::Reservation(reservation.clone()))?;
        tracing::debug!("Reserved {} for nonce {}", reservation.target, nonce);
        Ok(reservation)
    }

    fn message_for(reservation: &Reservation) -> CheckpointMessage {
        CheckpointMessage {
            branch_id: reservation.target.branch_id.clone(),
            leaf_id: reservation.target.leaf_id.clone(),
            prompt: reservation.prompt.clone(),
            summary: reservation.summary.clone(),
            nonce: reservation.nonce.clone(),
        }
    }

    fn land_branch(
        &self,
        snapshot: &mut Snapshot,
        reservation: &Reservation,
        new_branch: &NewBranch,
    ) -> Result<BranchRecord, StemError> {
        if let Some(existing) = snapshot.branch_by_nonce(&reservation.nonce) {
            return Ok(existing.clone());
        }
        let branch = BranchRecord {
            repo_root: self.store.repo_root().to_path_buf(),
            branch_id: reservation.target.branch_id.clone(),
            slug: new_branch.slug.clone(),
            user: new_branch.user.clone(),
            prompt: reservation.prompt.clone(),
            summary: reservation.summary.clone(),
            vcs_ref: new_branch.vcs_ref.clone(),
            forked_from: new_branch.forked_from.clone(),
            nonce: reservation.nonce.clone(),
            created_at: self.store.next_timestamp(snapshot),
        };
        self.store.record(snapshot, Record::Branch(branch.clone()))?;
        Ok(branch)
    }

    fn land_leaf(
        &self,
        snapshot: &mut Snapshot,
        reservation: &Reservation,
        vcs_commit: String,
    ) -> Result<LeafRecord, StemError> {
        if let Some(existing) = snapshot.leaf_by_nonce(&reservation.nonce) {
            return Ok(existing.clone());
        }
        let leaf = LeafRecord {
            repo_root: self.store.repo_root().to_path_buf(),
            branch_id: reservation.target.branch_id.clone(),
            leaf_id: reservation.target.leaf_id.clone(),
            prompt: reservation.prompt.clone(),
            summary: reservation.summary.clone(),
            vcs_commit,
            nonce: reservation.nonce.clone(),
            created_at: self.store.next_timestamp(snapshot),
        };
        self.store.record(snapshot, Record::Leaf(leaf.clone()))?;
        tracing::info!("Checkpoint {} -> {}", leaf.node(), leaf.vcs_commit);
        Ok(leaf)
    }

    /// Wrap a failure as partial when a durable step already happened.
    fn partial(
        &self,
        nonce: &str,
        completed: Option<CheckpointStep>,
        attempted: CheckpointStep,
        err: StemError,
    ) -> StemError {
        let Some(completed) = completed else {
            return err;
        };
        let failed = match &err {
            StemError::VcsCommandFailed { step, .. } => *step,
            _ => attempted,
        };
        tracing::error!(
            "Checkpoint {} stopped after {}: {} failed: {}",
            nonce,
            completed,
            failed,
            err
        );
        StemError::PartialCheckpoint {
            repo_root: self.workspace.root().to_path_buf(),
            nonce: nonce.to_string(),
            completed,
            failed,
            reason: err.to_string(),
        }
    }

    /// Make sure a new commit would extend the current line.
    ///
    /// A detached HEAD sitting exactly on the tip is re-attached to the
    /// branch ref; any other historical position is refused.
    fn require_tip(&self, state: &ProcessState, snapshot: &Snapshot) -> Result<String, StemError> {
        let current = state
            .current
            .as_ref()
            .ok_or_else(|| StemError::NoCurrentBranch(self.workspace.root().to_path_buf()))?;
        let branch = snapshot.branch(&current.branch_id).ok_or_else(|| StemError::UnknownBranch {
            repo_root: self.workspace.root().to_path_buf(),
            branch_id: current.branch_id.clone(),
        })?;

        if state.on_branch_ref {
            return Ok(branch.branch_id.clone());
        }

        if state.at_tip {
            let ref_commit = self.vcs.branch_commit(&branch.vcs_ref)?;
            if ref_commit.is_some() && ref_commit == state.head {
                tracing::debug!("Re-attaching HEAD to {}", branch.vcs_ref);
                self.vcs.checkout_branch(&branch.vcs_ref)?;
                return Ok(branch.branch_id.clone());
            }
        }

        let tip = snapshot
            .latest_leaf(&branch.branch_id)
            .map(|l| l.leaf_id.clone())
            .unwrap_or_default();
        Err(StemError::NotAtBranchTip {
            branch_id: current.branch_id.clone(),
            leaf_id: current.leaf_id.clone(),
            tip,
        })
    }

    /// Make sure an interrupted checkpoint would still extend its line.
    ///
    /// The working tree must be at the tip of the reserved branch, and no
    /// later leaf may have landed on that branch in the meantime.
    fn require_resumable(
        &self,
        state: &ProcessState,
        snapshot: &Snapshot,
        reservation: &Reservation,
    ) -> Result<(), StemError> {
        let unreconcilable = |detail: String| StemError::Unreconcilable {
            repo_root: self.workspace.root().to_path_buf(),
            nonce: reservation.nonce.clone(),
            detail,
        };

        if let Some(later) = snapshot.overtaken_by(reservation) {
            return Err(unreconcilable(format!(
                "{} was saved after {} was reserved; save again under a new nonce",
                later.node(),
                reservation.target
            )));
        }

        let branch_id = self.require_tip(state, snapshot)?;
        if branch_id != reservation.target.branch_id {
            return Err(unreconcilable(format!(
                "{} was reserved on {} but the working tree is on {}; jump to {} and retry",
                reservation.target, reservation.target.branch_id, branch_id, reservation.target.branch_id
            )));
        }
        Ok(())
    }

    fn user(&self) -> String {
        let name = self
            .vcs
            .user_name()
            .ok()
            .flatten()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_default();
        slugify(&name, MAX_USER_LEN, "user")
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Complete every reserved checkpoint whose commit exists in the VCS.
    ///
    /// Returns the nodes that were appended.
    fn roll_forward(&self, snapshot: &mut Snapshot) -> Result<Vec<NodeRef>, StemError> {
        let incomplete: Vec<Reservation> = snapshot.incomplete().into_iter().cloned().collect();
        let mut landed = Vec::new();

        for reservation in incomplete {
            let Some(commit) = self.vcs.find_checkpoint(&reservation.nonce)? else {
                continue;
            };
            let unreconcilable = |detail: String| StemError::Unreconcilable {
                repo_root: self.workspace.root().to_path_buf(),
                nonce: reservation.nonce.clone(),
                detail,
            };

            if let Some(other) = snapshot.leaf_by_commit(&commit) {
                return Err(unreconcilable(format!(
                    "commit {} is already recorded as {}",
                    commit,
                    other.node()
                )));
            }
            if let Some(other) = snapshot.leaf(&reservation.target.branch_id, &reservation.target.leaf_id) {
                return Err(unreconcilable(format!(
                    "{} is already recorded under nonce {}",
                    other.node(),
                    other.nonce
                )));
            }

            if let Some(new_branch) = &reservation.new_branch {
                if self.vcs.branch_commit(&new_branch.vcs_ref)?.is_none() {
                    return Err(unreconcilable(format!(
                        "commit {} exists but ref {} is gone",
                        commit, new_branch.vcs_ref
                    )));
                }
                self.land_branch(snapshot, &reservation, new_branch)?;
            }
            let leaf = self.land_leaf(snapshot, &reservation, commit)?;
            self.warn(
                snapshot,
                WarningKind::RolledForward,
                Some(&reservation.nonce),
                Some(leaf.node()),
                format!(
                    "Recorded {} from existing commit {} after an interrupted run",
                    leaf.node(),
                    leaf.vcs_commit
                ),
            )?;
            landed.push(leaf.node());
        }
        Ok(landed)
    }

    /// Rebuild process state and roll forward interrupted checkpoints.
    pub fn reconcile(&self) -> Result<ReconcileReport, StemError> {
        self.workspace.require_initialized()?;
        let _lock = RepoLock::acquire(
            &self.workspace.lock_path(),
            self.workspace.root(),
            "reconcile",
            &self.config.lock,
        )?;
        let mut snapshot = self.store.load()?;
        let rolled_forward = self.roll_forward(&mut snapshot)?;
        let state = ProcessState::reconstruct(&snapshot, &self.vcs)?;

        if state.drift {
            let head = state.head.clone().unwrap_or_default();
            let already = snapshot
                .warnings()
                .any(|w| w.kind == WarningKind::Drift && w.message.contains(&head));
            if !already {
                self.warn(
                    &mut snapshot,
                    WarningKind::Drift,
                    None,
                    state.current.clone(),
                    format!("HEAD {} was moved outside stem", head),
                )?;
            }
        }

        let pending = snapshot
            .incomplete()
            .into_iter()
            .map(|r| r.nonce.clone())
            .collect();
        Ok(ReconcileReport {
            state,
            rolled_forward,
            pending,
        })
    }

    // -------------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------------

    /// Start a new line from the current position.
    ///
    /// With `closing`, a leaf describing the finished work is first saved on
    /// the current line (under the nonce suffix `:close`).
    pub fn start_branch(
        &self,
        request: &CommandRequest,
        intent: &Intent,
        closing: Option<&Intent>,
    ) -> Result<Outcome<BranchResult>, StemError> {
        let nonce = request.nonce.as_str();
        let (_lock, mut snapshot) = self.begin(CommandKind::Branch)?;
        if IdempotencyGate::check(&snapshot, nonce)? == Admission::Duplicate {
            return Ok(Outcome::Duplicate {
                nonce: nonce.to_string(),
            });
        }
        let state = ProcessState::reconstruct(&snapshot, &self.vcs)?;
        if closing.is_some() && snapshot.reservation(&closing_nonce(nonce)).is_none() {
            self.require_tip(&state, &snapshot)?;
        }
        self.gate()
            .accept(&mut snapshot, nonce, CommandKind::Branch, &request.source_file)?;

        let orchestrator = self.orchestrator();
        let mut completed = None;

        let closing_leaf = match closing {
            Some(closing) => {
                let close_nonce = closing_nonce(nonce);
                let leaf = match snapshot.leaf_by_nonce(&close_nonce) {
                    Some(leaf) => leaf.clone(),
                    None => {
                        if let Some(existing) = snapshot.reservation(&close_nonce) {
                            self.require_resumable(&state, &snapshot, existing)?;
                        }
                        let branch_id = state
                            .current_branch()
                            .ok_or_else(|| StemError::NoCurrentBranch(self.workspace.root().to_path_buf()))?
                            .to_string();
                        let target = NodeRef::new(&branch_id, snapshot.next_leaf_id(&branch_id));
                        let reservation =
                            self.reserve(&mut snapshot, &close_nonce, CommandKind::Save, target, None, closing)?;
                        let commit = orchestrator.commit_checkpoint(&Self::message_for(&reservation))?;
                        self.land_leaf(&mut snapshot, &reservation, commit).map_err(|e| {
                            self.partial(nonce, Some(CheckpointStep::Commit), CheckpointStep::MetadataAppend, e)
                        })?
                    }
                };
                completed = Some(CheckpointStep::Commit);
                Some(leaf)
            }
            None => None,
        };

        let reservation = match snapshot.reservation(nonce) {
            Some(existing) => existing.clone(),
            None => {
                let branch_id = snapshot.next_branch_id();
                let user = self.user();
                let slug = slugify(&intent.prompt, MAX_SLUG_LEN, "feature");
                let vcs_ref = orchestrator.ref_name(&user, &branch_id, &slug);
                let forked_from = match &closing_leaf {
                    Some(leaf) => Some(leaf.node()),
                    None => state.current.clone().filter(|n| !n.leaf_id.is_empty()),
                };
                let new_branch = NewBranch {
                    slug,
                    user,
                    vcs_ref,
                    forked_from,
                };
                self.reserve(
                    &mut snapshot,
                    nonce,
                    CommandKind::Branch,
                    NodeRef::new(&branch_id, "1"),
                    Some(new_branch),
                    intent,
                )?
            }
        };
        let new_branch = reservation.new_branch.clone().ok_or_else(|| StemError::Unreconcilable {
            repo_root: self.workspace.root().to_path_buf(),
            nonce: nonce.to_string(),
            detail: "nonce was reserved for a different command".to_string(),
        })?;

        orchestrator
            .create_branch(&new_branch.vcs_ref)
            .map_err(|e| self.partial(nonce, completed, CheckpointStep::CreateBranch, e))?;
        completed = Some(CheckpointStep::CreateBranch);

        let commit = orchestrator
            .commit_checkpoint(&Self::message_for(&reservation))
            .map_err(|e| self.partial(nonce, completed, CheckpointStep::Commit, e))?;

        let land = |snapshot: &mut Snapshot| -> Result<(BranchRecord, LeafRecord), StemError> {
            let branch = self.land_branch(snapshot, &reservation, &new_branch)?;
            let leaf = self.land_leaf(snapshot, &reservation, commit.clone())?;
            Ok((branch, leaf))
        };
        let (branch, leaf) = land(&mut snapshot).map_err(|e| {
            self.partial(nonce, Some(CheckpointStep::Commit), CheckpointStep::MetadataAppend, e)
        })?;

        tracing::info!("Started {} on {}", branch.branch_id, branch.vcs_ref);
        Ok(Outcome::Applied(BranchResult {
            branch,
            leaf,
            closing: closing_leaf,
        }))
    }

    /// Save a revision on the current line.
    ///
    /// # Errors
    ///
    /// [`StemError::NotAtBranchTip`] if the working tree sits on a historical
    /// leaf; [`StemError::NoCurrentBranch`] before the first line exists.
    pub fn save_revision(
        &self,
        request: &CommandRequest,
        intent: &Intent,
    ) -> Result<Outcome<LeafRecord>, StemError> {
        let nonce = request.nonce.as_str();
        let (_lock, mut snapshot) = self.begin(CommandKind::Save)?;
        if IdempotencyGate::check(&snapshot, nonce)? == Admission::Duplicate {
            return Ok(Outcome::Duplicate {
                nonce: nonce.to_string(),
            });
        }
        let state = ProcessState::reconstruct(&snapshot, &self.vcs)?;
        let leaf = self.checkpoint_current(&mut snapshot, &state, request, CommandKind::Save, intent)?;
        Ok(Outcome::Applied(leaf))
    }

    /// Gate, reserve, commit and land one leaf on the current line.
    fn checkpoint_current(
        &self,
        snapshot: &mut Snapshot,
        state: &ProcessState,
        request: &CommandRequest,
        command: CommandKind,
        intent: &Intent,
    ) -> Result<LeafRecord, StemError> {
        let nonce = request.nonce.as_str();
        let reservation = match snapshot.reservation(nonce) {
            Some(existing) => {
                let existing = existing.clone();
                self.require_resumable(state, snapshot, &existing)?;
                existing
            }
            None => {
                let branch_id = self.require_tip(state, snapshot)?;
                self.gate()
                    .accept(snapshot, nonce, command, &request.source_file)?;
                let target = NodeRef::new(&branch_id, snapshot.next_leaf_id(&branch_id));
                self.reserve(snapshot, nonce, command, target, None, intent)?
            }
        };

        let commit = self
            .orchestrator()
            .commit_checkpoint(&Self::message_for(&reservation))?;
        self.land_leaf(snapshot, &reservation, commit).map_err(|e| {
            self.partial(nonce, Some(CheckpointStep::Commit), CheckpointStep::MetadataAppend, e)
        })
    }

    /// Watcher entry point: checkpoint the current line with the declared
    /// intent from `agent/leaf.json`, or a placeholder.
    pub fn auto_checkpoint(&self, nonce: &str) -> Result<Outcome<AutoCheckpoint>, StemError> {
        let (_lock, mut snapshot) = self.begin(CommandKind::AutoSave)?;
        if IdempotencyGate::check(&snapshot, nonce)? == Admission::Duplicate {
            return Ok(Outcome::Duplicate {
                nonce: nonce.to_string(),
            });
        }
        let state = ProcessState::reconstruct(&snapshot, &self.vcs)?;
        let request = CommandRequest::new(nonce, "watcher");
        let resumed = snapshot.reservation(nonce).is_some();

        if !resumed {
            match self.require_tip(&state, &snapshot) {
                Ok(_) => {}
                Err(StemError::NoCurrentBranch(_)) => {
                    tracing::debug!("No line started yet, skipping auto-checkpoint");
                    return Ok(Outcome::Applied(AutoCheckpoint::NoBranch));
                }
                Err(StemError::NotAtBranchTip { branch_id, leaf_id, tip }) => {
                    let node = NodeRef::new(&branch_id, &leaf_id);
                    if snapshot.warned_since_last_move(WarningKind::NotAtBranchTip, &node) {
                        tracing::debug!("Still off tip at {}, skipping auto-checkpoint", node);
                    } else {
                        self.warn(
                            &mut snapshot,
                            WarningKind::NotAtBranchTip,
                            Some(nonce),
                            Some(node.clone()),
                            format!(
                                "Auto-checkpoint skipped: working tree is at {} but the tip of {} is {}",
                                node, branch_id, tip
                            ),
                        )?;
                    }
                    return Ok(Outcome::Applied(AutoCheckpoint::NotAtTip { node }));
                }
                Err(e) => return Err(e),
            }
            if !self.vcs.has_changes()? {
                tracing::debug!("Working tree clean, nothing to checkpoint");
                return Ok(Outcome::Applied(AutoCheckpoint::NoChanges));
            }
        }

        let intent_path = self.workspace.leaf_intent_path();
        let declared = IntentFile::load(&intent_path)?.and_then(|f| f.intent());
        let (intent, placeholder) = match declared {
            Some(intent) => (intent, false),
            None => match self.config.watcher.missing_intent {
                MissingIntentPolicy::Block if !resumed => {
                    tracing::info!("No intent declared, auto-checkpoint blocked");
                    return Ok(Outcome::Applied(AutoCheckpoint::Blocked));
                }
                _ => (
                    Intent::new(&self.config.watcher.placeholder_prompt, PLACEHOLDER_SUMMARY)?,
                    true,
                ),
            },
        };

        let leaf = self.checkpoint_current(&mut snapshot, &state, &request, CommandKind::AutoSave, &intent)?;
        let placeholder = placeholder && leaf.prompt == intent.prompt;

        if placeholder {
            self.warn(
                &mut snapshot,
                WarningKind::IntentUndeclared,
                Some(nonce),
                Some(leaf.node()),
                format!("{} was saved without a declared intent", leaf.node()),
            )?;
        } else if intent_path.exists() {
            archive_file(&self.workspace.archive_dir(), &intent_path, "done")?;
        }

        Ok(Outcome::Applied(AutoCheckpoint::Saved { leaf, placeholder }))
    }

    // -------------------------------------------------------------------------
    // Navigation
    // -------------------------------------------------------------------------

    /// Move the working tree to a historical leaf.
    ///
    /// Uncommitted work is shelved first. The branch ref is checked out when
    /// the target is its tip, otherwise HEAD is detached at the commit.
    pub fn jump(
        &self,
        request: &CommandRequest,
        branch_id: &str,
        selector: &LeafSelector,
    ) -> Result<Outcome<JumpResult>, StemError> {
        let nonce = request.nonce.as_str();
        let (_lock, mut snapshot) = self.begin(CommandKind::Jump)?;
        if IdempotencyGate::check(&snapshot, nonce)? == Admission::Duplicate {
            return Ok(Outcome::Duplicate {
                nonce: nonce.to_string(),
            });
        }

        let state = ProcessState::reconstruct(&snapshot, &self.vcs)?;
        let target = navigator::resolve(&snapshot, self.workspace.root(), branch_id, selector)?.clone();
        self.gate()
            .accept(&mut snapshot, nonce, CommandKind::Jump, &request.source_file)?;

        let branch = snapshot
            .branch(&target.branch_id)
            .cloned()
            .ok_or_else(|| StemError::UnknownBranch {
                repo_root: self.workspace.root().to_path_buf(),
                branch_id: target.branch_id.clone(),
            })?;
        let is_tip = snapshot
            .latest_leaf(&branch.branch_id)
            .is_some_and(|tip| tip.leaf_id == target.leaf_id);
        let ref_at_target =
            self.vcs.branch_commit(&branch.vcs_ref)?.as_deref() == Some(target.vcs_commit.as_str());
        let checkout = if is_tip && ref_at_target {
            CheckoutTarget::Branch(branch.vcs_ref.clone())
        } else {
            CheckoutTarget::Commit(target.vcs_commit.clone())
        };

        let report = self.orchestrator().checkout(&checkout, nonce).map_err(|e| {
            // Work shelved before a failed checkout is kept; say so.
            let shelved = self
                .vcs
                .stash_list()
                .map(|l| l.iter().any(|m| m.contains(nonce)))
                .unwrap_or(false);
            let completed = shelved.then_some(CheckpointStep::Shelve);
            self.partial(nonce, completed, CheckpointStep::Checkout, e)
        })?;

        let from = state.current.clone().filter(|n| !n.leaf_id.is_empty());
        let ancestry = navigator::ancestry(&snapshot, from.as_ref(), &target.node());
        let jump = JumpRecord {
            repo_root: self.store.repo_root().to_path_buf(),
            branch_id: target.branch_id.clone(),
            leaf_id: target.leaf_id.clone(),
            prompt: target.prompt.clone(),
            summary: target.summary.clone(),
            ancestry,
            nonce: nonce.to_string(),
            created_at: self.store.next_timestamp(&snapshot),
        };
        self.store
            .record(&mut snapshot, Record::Jump(jump.clone()))
            .map_err(|e| {
                self.partial(nonce, Some(CheckpointStep::Checkout), CheckpointStep::MetadataAppend, e)
            })?;

        tracing::info!("Jumped to {} ({})", target.node(), target.vcs_commit);
        Ok(Outcome::Applied(JumpResult {
            jump,
            vcs_commit: target.vcs_commit,
            attached: matches!(checkout, CheckoutTarget::Branch(_)),
            shelved: report.shelved,
        }))
    }

    // -------------------------------------------------------------------------
    // Agent queue
    // -------------------------------------------------------------------------

    /// Process queued command files, oldest first.
    ///
    /// Stops at the first retryable failure so later commands never overtake
    /// an earlier one.
    pub fn drain_queue(&self) -> Result<Vec<DrainedCommand>, StemError> {
        self.workspace.require_initialized()?;
        let mut drained = Vec::new();

        for path in list_queue(&self.workspace.queue_dir())? {
            let (nonce, result) = match QueuedCommand::load(&path) {
                Ok(command) => (Some(command.nonce.clone()), self.run_queued(&path, &command)),
                Err(e) => (None, Err(e)),
            };

            let (disposition, message) = match result {
                Ok(true) => (Disposition::Done, None),
                Ok(false) => (Disposition::Duplicate, None),
                Err(e) if e.is_retryable() => (Disposition::Deferred, Some(e.to_string())),
                Err(e) => (Disposition::Invalid, Some(e.to_string())),
            };

            if let Some(suffix) = disposition.suffix() {
                archive_file(&self.workspace.archive_dir(), &path, suffix)?;
            }
            if let Some(message) = &message {
                tracing::warn!("Queue file {}: {}", path.display(), message);
            }

            let stop = disposition == Disposition::Deferred;
            drained.push(DrainedCommand {
                file: path,
                nonce,
                disposition,
                message,
            });
            if stop {
                break;
            }
        }
        Ok(drained)
    }

    /// Run one queued command. `Ok(false)` means duplicate.
    fn run_queued(&self, path: &Path, command: &QueuedCommand) -> Result<bool, StemError> {
        let request = CommandRequest::new(&command.nonce, path.display().to_string());
        let invalid = |what: &str| StemError::IntentValidation {
            path: path.to_path_buf(),
            reason: what.to_string(),
        };

        let applied = match command.command {
            QueueCommandKind::Branch => {
                let intent = command.intent().ok_or_else(|| invalid("missing prompt"))?;
                !self.start_branch(&request, &intent, None)?.is_duplicate()
            }
            QueueCommandKind::UpdateBranch => {
                let intent = command.intent().ok_or_else(|| invalid("missing prompt"))?;
                let closing = command.closing().ok_or_else(|| invalid("missing old_prompt"))?;
                !self.start_branch(&request, &intent, Some(&closing))?.is_duplicate()
            }
            QueueCommandKind::Update => {
                let intent = command.intent().ok_or_else(|| invalid("missing prompt"))?;
                !self.save_revision(&request, &intent)?.is_duplicate()
            }
            QueueCommandKind::Jump => {
                let (branch_id, selector) = command.jump_target().map_err(|e| invalid(&e))?;
                !self.jump(&request, &branch_id, &selector)?.is_duplicate()
            }
        };
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current pointer, watcher liveness, last command and pending work.
    ///
    /// Runs a reconciliation pass when the lock is free; otherwise reports
    /// from a read-only reconstruction.
    pub fn status(&self) -> Result<StatusReport, StemError> {
        if !self.workspace.is_initialized() {
            return Ok(StatusReport::uninitialized(self.workspace.root()));
        }

        let reconciled = match self.reconcile() {
            Ok(report) => Some(report),
            Err(StemError::ConcurrencyConflict { .. }) => {
                tracing::debug!("Lock busy, reporting status without reconciliation");
                None
            }
            Err(e) => return Err(e),
        };

        let snapshot = self.store.load()?;
        let (state, rolled_forward) = match reconciled {
            Some(report) => (report.state, report.rolled_forward),
            None => (ProcessState::reconstruct(&snapshot, &self.vcs)?, Vec::new()),
        };
        let queued = list_queue(&self.workspace.queue_dir())?.len();
        let watcher = watcher_liveness(&self.workspace);

        Ok(StatusReport::build(
            self.workspace.root(),
            &snapshot,
            state,
            watcher,
            queued,
            rolled_forward,
        ))
    }

    /// Check recorded history against the VCS without changing either.
    pub fn doctor(&self) -> Result<DoctorReport, StemError> {
        self.workspace.require_initialized()?;
        let snapshot = self.store.load()?;
        let state = ProcessState::reconstruct(&snapshot, &self.vcs)?;
        doctor::diagnose(self.workspace.root(), &snapshot, state, &self.vcs)
    }

    /// Paginated history of branches, leaves and jumps.
    pub fn query(&self, query: &HistoryQuery) -> Result<HistoryPage, StemError> {
        self.workspace.require_initialized()?;
        let snapshot = self.store.load()?;
        query.run(&snapshot, self.workspace.root())
    }

    /// Load the full log snapshot.
    pub fn snapshot(&self) -> Result<Snapshot, StemError> {
        self.store.load()
    }
}

/// Nonce of the leaf that closes the current line before a branch.
fn closing_nonce(nonce: &str) -> String {
    format!("{}:close", nonce)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctor::FindingKind;
    use crate::vcs::tests::git_repo;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    /// Real git with injectable failures.
    #[derive(Debug)]
    struct FlakyVcs {
        inner: GitCli,
        failing: RefCell<HashSet<&'static str>>,
    }

    impl FlakyVcs {
        fn new(inner: GitCli) -> Self {
            Self {
                inner,
                failing: RefCell::new(HashSet::new()),
            }
        }

        fn fail_on(&self, op: &'static str) {
            self.failing.borrow_mut().insert(op);
        }

        fn heal(&self) {
            self.failing.borrow_mut().clear();
        }

        fn check(&self, op: &'static str, step: CheckpointStep) -> Result<(), StemError> {
            if self.failing.borrow().contains(op) {
                return Err(StemError::VcsCommandFailed {
                    repo_root: self.inner.root().to_path_buf(),
                    step,
                    command: format!("git {}", op),
                    status: "exit status: 128".to_string(),
                    stderr: "injected failure".to_string(),
                });
            }
            Ok(())
        }
    }

    impl Vcs for FlakyVcs {
        fn root(&self) -> &Path {
            self.inner.root()
        }
        fn is_repository(&self) -> bool {
            self.inner.is_repository()
        }
        fn init_repository(&self) -> Result<(), StemError> {
            self.inner.init_repository()
        }
        fn exclude(&self, pattern: &str) -> Result<(), StemError> {
            self.inner.exclude(pattern)
        }
        fn head_commit(&self) -> Result<Option<String>, StemError> {
            self.inner.head_commit()
        }
        fn current_branch(&self) -> Result<Option<String>, StemError> {
            self.inner.current_branch()
        }
        fn branch_commit(&self, name: &str) -> Result<Option<String>, StemError> {
            self.inner.branch_commit(name)
        }
        fn commit_exists(&self, commit: &str) -> Result<bool, StemError> {
            self.inner.commit_exists(commit)
        }
        fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, StemError> {
            self.inner.is_ancestor(ancestor, descendant)
        }
        fn create_branch(&self, name: &str) -> Result<(), StemError> {
            self.check("create_branch", CheckpointStep::CreateBranch)?;
            self.inner.create_branch(name)
        }
        fn stage_all(&self) -> Result<(), StemError> {
            self.inner.stage_all()
        }
        fn commit(&self, message: &str) -> Result<String, StemError> {
            self.check("commit", CheckpointStep::Commit)?;
            self.inner.commit(message)
        }
        fn has_changes(&self) -> Result<bool, StemError> {
            self.inner.has_changes()
        }
        fn stash_push(&self, message: &str) -> Result<(), StemError> {
            self.inner.stash_push(message)
        }
        fn stash_list(&self) -> Result<Vec<String>, StemError> {
            self.inner.stash_list()
        }
        fn checkout_branch(&self, name: &str) -> Result<(), StemError> {
            self.check("checkout", CheckpointStep::Checkout)?;
            self.inner.checkout_branch(name)
        }
        fn checkout_detached(&self, commit: &str) -> Result<(), StemError> {
            self.check("checkout", CheckpointStep::Checkout)?;
            self.inner.checkout_detached(commit)
        }
        fn find_checkpoint(&self, nonce: &str) -> Result<Option<String>, StemError> {
            self.inner.find_checkpoint(nonce)
        }
        fn user_name(&self) -> Result<Option<String>, StemError> {
            self.inner.user_name()
        }
    }

    fn engine_over<V: Vcs>(root: &Path, vcs: V) -> StemEngine<V> {
        let workspace = Workspace::from_root(root).unwrap();
        let mut config = StemConfig::default();
        config.lock.timeout_ms = 500;
        let mut engine = StemEngine::with_vcs(workspace, config, vcs);
        engine.init().unwrap();
        engine
    }

    fn setup() -> (TempDir, StemEngine<FlakyVcs>) {
        let (temp, git) = git_repo();
        let root = git.root().to_path_buf();
        let engine = engine_over(&root, FlakyVcs::new(git));
        (temp, engine)
    }

    fn intent(prompt: &str) -> Intent {
        Intent::new(prompt, "").unwrap()
    }

    fn write(engine: &StemEngine<FlakyVcs>, name: &str, content: &str) {
        fs::write(engine.workspace().root().join(name), content).unwrap();
    }

    fn read(engine: &StemEngine<FlakyVcs>, name: &str) -> String {
        fs::read_to_string(engine.workspace().root().join(name)).unwrap()
    }

    fn commit_count(engine: &StemEngine<FlakyVcs>) -> usize {
        let output = std::process::Command::new("git")
            .args(["rev-list", "--all", "--count"])
            .current_dir(engine.workspace().root())
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(0)
    }

    fn start(engine: &StemEngine<FlakyVcs>, nonce: &str, prompt: &str) -> BranchResult {
        engine
            .start_branch(&CommandRequest::cli(nonce), &intent(prompt), None)
            .unwrap()
            .applied()
            .unwrap()
    }

    fn save(engine: &StemEngine<FlakyVcs>, nonce: &str, prompt: &str) -> LeafRecord {
        engine
            .save_revision(&CommandRequest::cli(nonce), &intent(prompt))
            .unwrap()
            .applied()
            .unwrap()
    }

    // ------------------------------------------------------------------------
    // init
    // ------------------------------------------------------------------------

    #[test]
    fn test_init_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let git = GitCli::new(temp.path().canonicalize().unwrap(), "git");
        let mut engine = StemEngine::with_vcs(
            Workspace::from_root(temp.path()).unwrap(),
            StemConfig::default(),
            git,
        );

        let first = engine.init().unwrap();
        assert!(first.created);
        assert!(first.vcs_initialized);
        assert!(!first.registered);
        assert!(engine.workspace().queue_dir().is_dir());

        let second = engine.init().unwrap();
        assert!(!second.created);
        assert!(!second.vcs_initialized);

        let exclude = fs::read_to_string(temp.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches(".stem/").count(), 1);
    }

    #[test]
    fn test_init_registers_when_registry_given() {
        let home = TempDir::new().unwrap();
        let (_temp, git) = git_repo();
        let root = git.root().to_path_buf();
        let registry = Registry::new(home.path().join("registry.jsonl"));
        let mut engine = StemEngine::with_vcs(
            Workspace::from_root(&root).unwrap(),
            StemConfig::default(),
            git,
        )
        .with_registry(registry.clone());

        assert!(engine.init().unwrap().registered);
        assert_eq!(registry.lookup(&root).unwrap().unwrap().repo_root, root);
    }

    #[test]
    fn test_commands_require_init() {
        let (_temp, git) = git_repo();
        let root = git.root().to_path_buf();
        let engine = StemEngine::with_vcs(Workspace::from_root(&root).unwrap(), StemConfig::default(), git);
        let err = engine
            .save_revision(&CommandRequest::cli("n1"), &intent("x"))
            .unwrap_err();
        assert!(matches!(err, StemError::NotInitialized(_)));
    }

    // ------------------------------------------------------------------------
    // branch / save
    // ------------------------------------------------------------------------

    #[test]
    fn test_start_branch_creates_first_leaf_and_ref() {
        let (_temp, engine) = setup();
        write(&engine, "a.txt", "one");

        let result = start(&engine, "n1", "Add feature");
        assert_eq!(result.branch.branch_id, "b1");
        assert_eq!(result.branch.vcs_ref, "stem/test-user/b1-add-feature");
        assert_eq!(result.branch.forked_from, None);
        assert_eq!(result.leaf.node(), NodeRef::new("b1", "1"));
        assert_eq!(
            engine.vcs().current_branch().unwrap().as_deref(),
            Some("stem/test-user/b1-add-feature")
        );
        assert_eq!(
            engine.vcs().head_commit().unwrap().as_deref(),
            Some(result.leaf.vcs_commit.as_str())
        );
    }

    #[test]
    fn test_duplicate_nonce_is_a_noop() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        let commits = commit_count(&engine);

        for _ in 0..3 {
            let again = engine
                .start_branch(&CommandRequest::cli("n1"), &intent("first"), None)
                .unwrap();
            assert_eq!(again, Outcome::Duplicate { nonce: "n1".to_string() });
        }
        save(&engine, "n2", "second");
        assert!(engine
            .save_revision(&CommandRequest::cli("n2"), &intent("second"))
            .unwrap()
            .is_duplicate());

        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.branches().count(), 1);
        assert_eq!(snapshot.leaves().count(), 2);
        assert_eq!(commit_count(&engine), commits + 1);
    }

    #[test]
    fn test_save_revision_extends_the_line() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        write(&engine, "a.txt", "two");
        let leaf = save(&engine, "n2", "second");
        assert_eq!(leaf.node(), NodeRef::new("b1", "2"));

        // Empty checkpoints are allowed.
        let leaf = save(&engine, "n3", "intent only");
        assert_eq!(leaf.leaf_id, "3");

        let snapshot = engine.snapshot().unwrap();
        let times: Vec<_> = snapshot.leaves_of("b1").iter().map(|l| l.created_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_save_without_branch_fails() {
        let (_temp, engine) = setup();
        let err = engine
            .save_revision(&CommandRequest::cli("n1"), &intent("x"))
            .unwrap_err();
        assert!(matches!(err, StemError::NoCurrentBranch(_)));
        // Rejected commands leave no execution behind.
        assert!(engine.snapshot().unwrap().execution("n1").is_none());
    }

    #[test]
    fn test_branch_with_closing_leaf_forks_from_it() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        write(&engine, "a.txt", "closing work");

        let closing = intent("wrap up first");
        let result = engine
            .start_branch(&CommandRequest::cli("n2"), &intent("second idea"), Some(&closing))
            .unwrap()
            .applied()
            .unwrap();

        let closed = result.closing.unwrap();
        assert_eq!(closed.node(), NodeRef::new("b1", "2"));
        assert_eq!(closed.nonce, "n2:close");
        assert_eq!(result.branch.branch_id, "b2");
        assert_eq!(result.branch.forked_from, Some(NodeRef::new("b1", "2")));
    }

    // ------------------------------------------------------------------------
    // partial failures and replay
    // ------------------------------------------------------------------------

    #[test]
    fn test_commit_failure_after_branch_is_partial_and_replay_completes() {
        let (_temp, engine) = setup();
        engine.vcs().fail_on("commit");

        let err = engine
            .start_branch(&CommandRequest::cli("n1"), &intent("feature"), None)
            .unwrap_err();
        match &err {
            StemError::PartialCheckpoint {
                nonce,
                completed,
                failed,
                ..
            } => {
                assert_eq!(nonce, "n1");
                assert_eq!(*completed, CheckpointStep::CreateBranch);
                assert_eq!(*failed, CheckpointStep::Commit);
            }
            other => panic!("expected partial checkpoint, got {:?}", other),
        }
        assert!(err.is_retryable());
        assert_eq!(engine.reconcile().unwrap().pending, vec!["n1".to_string()]);

        engine.vcs().heal();
        let result = engine
            .start_branch(&CommandRequest::cli("n1"), &intent("ignored on resume"), None)
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(result.leaf.node(), NodeRef::new("b1", "1"));
        assert_eq!(result.leaf.prompt, "feature");
        assert_eq!(commit_count(&engine), 1);
        assert!(engine.reconcile().unwrap().pending.is_empty());
    }

    #[test]
    fn test_failure_before_any_vcs_change_is_plain() {
        let (_temp, engine) = setup();
        engine.vcs().fail_on("create_branch");
        let err = engine
            .start_branch(&CommandRequest::cli("n1"), &intent("feature"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            StemError::VcsCommandFailed {
                step: CheckpointStep::CreateBranch,
                ..
            }
        ));
    }

    #[test]
    fn test_existing_commit_is_rolled_forward_on_next_command() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");

        // Simulate a crash between the commit and the log append.
        let mut snapshot = engine.snapshot().unwrap();
        let reservation = engine
            .reserve(
                &mut snapshot,
                "n2",
                CommandKind::Save,
                NodeRef::new("b1", "2"),
                None,
                &intent("crashed save"),
            )
            .unwrap();
        let commit = engine
            .orchestrator()
            .commit_checkpoint(&StemEngine::<FlakyVcs>::message_for(&reservation))
            .unwrap();

        let report = engine.reconcile().unwrap();
        assert_eq!(report.rolled_forward, vec![NodeRef::new("b1", "2")]);

        let replay = engine
            .save_revision(&CommandRequest::cli("n2"), &intent("crashed save"))
            .unwrap();
        assert!(replay.is_duplicate());

        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.leaf("b1", "2").unwrap().vcs_commit, commit);
        assert_eq!(snapshot.leaves().count(), 2);
        assert!(snapshot
            .warnings()
            .any(|w| w.kind == WarningKind::RolledForward));
        assert_eq!(commit_count(&engine), 2);
    }

    // ------------------------------------------------------------------------
    // jump
    // ------------------------------------------------------------------------

    #[test]
    fn test_jump_restores_content_and_blocks_saves_off_tip() {
        let (_temp, engine) = setup();
        write(&engine, "a.txt", "v1");
        start(&engine, "n1", "first");
        write(&engine, "a.txt", "v2");
        save(&engine, "n2", "second");

        let result = engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap()
            .applied()
            .unwrap();
        assert!(!result.attached);
        assert_eq!(read(&engine, "a.txt"), "v1");
        assert_eq!(
            result.jump.ancestry,
            vec![NodeRef::new("b1", "2"), NodeRef::new("b1", "1")]
        );

        let err = engine
            .save_revision(&CommandRequest::cli("n3"), &intent("off tip"))
            .unwrap_err();
        assert!(matches!(err, StemError::NotAtBranchTip { ref tip, .. } if tip == "2"));

        let back = engine
            .jump(&CommandRequest::cli("j2"), "b1", &LeafSelector::Latest)
            .unwrap()
            .applied()
            .unwrap();
        assert!(back.attached);
        assert_eq!(read(&engine, "a.txt"), "v2");
        assert_eq!(save(&engine, "n3", "on tip again").leaf_id, "3");
    }

    #[test]
    fn test_jump_shelves_uncommitted_work() {
        let (_temp, engine) = setup();
        write(&engine, "a.txt", "v1");
        start(&engine, "n1", "first");
        write(&engine, "a.txt", "v2");
        save(&engine, "n2", "second");
        write(&engine, "a.txt", "unsaved");

        let result = engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::Id("1".to_string()))
            .unwrap()
            .applied()
            .unwrap();
        assert!(result.shelved.as_deref().unwrap().contains("j1"));
        assert_eq!(read(&engine, "a.txt"), "v1");
        let stashes = engine.vcs().stash_list().unwrap();
        assert!(stashes.iter().any(|s| s.contains("j1")));
    }

    #[test]
    fn test_jump_checkout_failure_after_shelve_is_partial() {
        let (_temp, engine) = setup();
        write(&engine, "a.txt", "v1");
        start(&engine, "n1", "first");
        save(&engine, "n2", "second");
        write(&engine, "a.txt", "unsaved");
        engine.vcs().fail_on("checkout");

        let err = engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap_err();
        assert!(matches!(
            err,
            StemError::PartialCheckpoint {
                completed: CheckpointStep::Shelve,
                failed: CheckpointStep::Checkout,
                ..
            }
        ));

        engine.vcs().heal();
        let result = engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(result.shelved, None);
        assert_eq!(engine.snapshot().unwrap().jumps().count(), 1);
    }

    #[test]
    fn test_jump_to_unknown_targets() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        assert!(matches!(
            engine.jump(&CommandRequest::cli("j1"), "b7", &LeafSelector::Latest),
            Err(StemError::UnknownBranch { .. })
        ));
        assert!(matches!(
            engine.jump(&CommandRequest::cli("j2"), "b1", &LeafSelector::Id("9".to_string())),
            Err(StemError::UnknownLeaf { .. })
        ));
        assert!(engine.snapshot().unwrap().execution("j1").is_none());
    }

    // ------------------------------------------------------------------------
    // auto-checkpoint
    // ------------------------------------------------------------------------

    #[test]
    fn test_auto_checkpoint_before_any_branch() {
        let (_temp, engine) = setup();
        write(&engine, "a.txt", "x");
        assert_eq!(
            engine.auto_checkpoint("a1").unwrap(),
            Outcome::Applied(AutoCheckpoint::NoBranch)
        );
    }

    #[test]
    fn test_auto_checkpoint_uses_placeholder_and_warns() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        write(&engine, "a.txt", "changed");

        let outcome = engine.auto_checkpoint("a1").unwrap().applied().unwrap();
        let AutoCheckpoint::Saved { leaf, placeholder } = outcome else {
            panic!("expected a checkpoint, got {:?}", outcome);
        };
        assert!(placeholder);
        assert_eq!(leaf.node(), NodeRef::new("b1", "2"));
        assert_eq!(leaf.prompt, "auto-checkpoint");

        let snapshot = engine.snapshot().unwrap();
        let warning = snapshot.warnings().last().unwrap();
        assert_eq!(warning.kind, WarningKind::IntentUndeclared);
        assert_eq!(warning.node, Some(NodeRef::new("b1", "2")));
    }

    #[test]
    fn test_auto_checkpoint_consumes_declared_intent() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        write(&engine, "a.txt", "changed");
        let path = engine.workspace().leaf_intent_path();
        fs::write(&path, r#"{"prompt": "tidy up", "summary": "renamed things"}"#).unwrap();

        let outcome = engine.auto_checkpoint("a1").unwrap().applied().unwrap();
        assert!(matches!(
            outcome,
            AutoCheckpoint::Saved { ref leaf, placeholder: false } if leaf.prompt == "tidy up"
        ));
        assert!(!path.exists());
        assert!(engine.workspace().archive_dir().join("leaf.json.done").exists());
    }

    #[test]
    fn test_auto_checkpoint_block_policy_and_clean_tree() {
        let (_temp, mut engine) = setup();
        start(&engine, "n1", "first");
        assert_eq!(
            engine.auto_checkpoint("a1").unwrap(),
            Outcome::Applied(AutoCheckpoint::NoChanges)
        );

        engine.config_mut().watcher.missing_intent = MissingIntentPolicy::Block;
        write(&engine, "a.txt", "changed");
        assert_eq!(
            engine.auto_checkpoint("a2").unwrap(),
            Outcome::Applied(AutoCheckpoint::Blocked)
        );
        assert_eq!(engine.snapshot().unwrap().leaves().count(), 1);
    }

    #[test]
    fn test_auto_checkpoint_off_tip_records_warning() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        save(&engine, "n2", "second");
        engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap();
        write(&engine, "a.txt", "edit on history");

        let outcome = engine.auto_checkpoint("a1").unwrap().applied().unwrap();
        assert_eq!(
            outcome,
            AutoCheckpoint::NotAtTip {
                node: NodeRef::new("b1", "1")
            }
        );
        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.leaves().count(), 2);
        assert!(snapshot
            .warnings()
            .any(|w| w.kind == WarningKind::NotAtBranchTip));
    }

    #[test]
    fn test_auto_checkpoint_off_tip_warns_once_per_position() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        save(&engine, "n2", "second");
        engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap();
        write(&engine, "a.txt", "edit on history");

        for attempt in 0..5 {
            let outcome = engine
                .auto_checkpoint(&format!("a{}", attempt))
                .unwrap()
                .applied()
                .unwrap();
            assert!(matches!(outcome, AutoCheckpoint::NotAtTip { .. }));
        }
        let off_tip = |engine: &StemEngine<FlakyVcs>| {
            engine
                .snapshot()
                .unwrap()
                .warnings()
                .filter(|w| w.kind == WarningKind::NotAtBranchTip)
                .count()
        };
        assert_eq!(off_tip(&engine), 1);

        // Another jump starts a fresh observation.
        engine
            .jump(&CommandRequest::cli("j2"), "b1", &LeafSelector::Id("1".to_string()))
            .unwrap();
        write(&engine, "a.txt", "edit again");
        engine.auto_checkpoint("a9").unwrap();
        assert_eq!(off_tip(&engine), 2);
    }

    #[test]
    fn test_replayed_save_after_the_line_moved_on_is_refused() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");

        write(&engine, "a.txt", "second");
        engine.vcs().fail_on("commit");
        engine
            .save_revision(&CommandRequest::cli("n2"), &intent("second"))
            .unwrap_err();
        engine.vcs().heal();
        assert_eq!(engine.reconcile().unwrap().pending, vec!["n2".to_string()]);

        let third = save(&engine, "n3", "third");
        assert_eq!(third.node(), NodeRef::new("b1", "3"));
        engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap();
        let commits_before = commit_count(&engine);

        let err = engine
            .save_revision(&CommandRequest::cli("n2"), &intent("second"))
            .unwrap_err();
        assert_eq!(err.kind(), "unreconcilable");
        assert_eq!(commit_count(&engine), commits_before);

        let snapshot = engine.snapshot().unwrap();
        assert!(snapshot.leaf("b1", "2").is_none());
        assert_eq!(snapshot.latest_leaf("b1").unwrap().leaf_id, "3");
    }

    #[test]
    fn test_replayed_save_off_tip_is_refused_until_back_at_tip() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        save(&engine, "n2", "second");

        write(&engine, "a.txt", "third");
        engine.vcs().fail_on("commit");
        engine
            .save_revision(&CommandRequest::cli("n3"), &intent("third"))
            .unwrap_err();
        engine.vcs().heal();

        engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
            .unwrap();
        let err = engine
            .save_revision(&CommandRequest::cli("n3"), &intent("third"))
            .unwrap_err();
        assert!(matches!(err, StemError::NotAtBranchTip { .. }));

        engine
            .jump(&CommandRequest::cli("j2"), "b1", &LeafSelector::Latest)
            .unwrap();
        let leaf = engine
            .save_revision(&CommandRequest::cli("n3"), &intent("third"))
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(leaf.node(), NodeRef::new("b1", "3"));

        let tip = engine.vcs().branch_commit(&engine.snapshot().unwrap().branch("b1").unwrap().vcs_ref);
        assert_eq!(tip.unwrap().as_deref(), Some(leaf.vcs_commit.as_str()));
    }

    // ------------------------------------------------------------------------
    // queue
    // ------------------------------------------------------------------------

    fn enqueue(engine: &StemEngine<FlakyVcs>, name: &str, body: &str) -> PathBuf {
        let path = engine.workspace().queue_dir().join(name);
        fs::write(&path, body).unwrap();
        // Distinct mtimes keep processing order deterministic.
        std::thread::sleep(std::time::Duration::from_millis(20));
        path
    }

    #[test]
    fn test_drain_queue_processes_in_order_and_archives() {
        let (_temp, engine) = setup();
        enqueue(&engine, "1.json", r#"{"command": "branch", "nonce": "q1", "prompt": "queued line"}"#);
        enqueue(&engine, "2.json", r#"{"command": "update", "nonce": "q2", "prompt": "queued save"}"#);
        enqueue(&engine, "3.json", r#"{"command": "branch", "nonce": "q1", "prompt": "queued line"}"#);
        enqueue(&engine, "4.json", r#"{"command": "update", "nonce": "q4", "colour": "red"}"#);
        enqueue(&engine, "5.json", r#"{"command": "jump", "nonce": "q5", "target": "b1/first"}"#);

        let drained = engine.drain_queue().unwrap();
        let dispositions: Vec<Disposition> = drained.iter().map(|d| d.disposition).collect();
        assert_eq!(
            dispositions,
            vec![
                Disposition::Done,
                Disposition::Done,
                Disposition::Duplicate,
                Disposition::Invalid,
                Disposition::Done,
            ]
        );

        let archive = engine.workspace().archive_dir();
        assert!(archive.join("1.json.done").exists());
        assert!(archive.join("3.json.duplicate").exists());
        assert!(archive.join("4.json.invalid").exists());
        assert!(list_queue(&engine.workspace().queue_dir()).unwrap().is_empty());

        let snapshot = engine.snapshot().unwrap();
        let source = &snapshot.execution("q1").unwrap().source_file;
        assert!(source.ends_with("1.json"));
        assert_eq!(snapshot.jump_by_nonce("q5").unwrap().leaf_id, "1");
    }

    #[test]
    fn test_drain_queue_stops_at_retryable_failure() {
        let (_temp, engine) = setup();
        engine.vcs().fail_on("commit");
        let first = enqueue(&engine, "1.json", r#"{"command": "branch", "nonce": "q1", "prompt": "a"}"#);
        let second = enqueue(&engine, "2.json", r#"{"command": "update", "nonce": "q2", "prompt": "b"}"#);

        let drained = engine.drain_queue().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].disposition, Disposition::Deferred);
        assert!(first.exists());
        assert!(second.exists());

        engine.vcs().heal();
        let drained = engine.drain_queue().unwrap();
        assert!(drained.iter().all(|d| d.disposition == Disposition::Done));
        assert_eq!(engine.snapshot().unwrap().leaves().count(), 2);
    }

    // ------------------------------------------------------------------------
    // status / query
    // ------------------------------------------------------------------------

    #[test]
    fn test_status_reports_pointer_and_last_command() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        enqueue(&engine, "1.json", r#"{"command": "update", "nonce": "q1", "prompt": "later"}"#);

        let status = engine.status().unwrap();
        assert!(status.is_initialized);
        assert_eq!(status.current(), Some(&NodeRef::new("b1", "1")));
        assert_eq!(status.current_prompt.as_deref(), Some("first"));
        assert_eq!(status.last_command.as_ref().unwrap().nonce, "n1");
        assert!(!status.watcher_alive());
        assert_eq!(status.queued, 1);
        assert!(status.pending.is_empty());
    }

    #[test]
    fn test_doctor_reports_deleted_branch_ref() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        let result = start(&engine, "n2", "second");
        assert!(engine.doctor().unwrap().is_healthy());

        engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::Latest)
            .unwrap();
        let output = std::process::Command::new("git")
            .args(["branch", "-D", &result.branch.vcs_ref])
            .current_dir(engine.workspace().root())
            .output()
            .unwrap();
        assert!(output.status.success());

        let report = engine.doctor().unwrap();
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::MissingRef);
        assert_eq!(report.findings[0].branch_id.as_deref(), Some("b2"));
    }

    #[test]
    fn test_doctor_lists_pending_commands() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        engine.vcs().fail_on("commit");
        engine
            .save_revision(&CommandRequest::cli("n2"), &intent("second"))
            .unwrap_err();
        engine.vcs().heal();

        let report = engine.doctor().unwrap();
        let pending: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.kind == FindingKind::PendingCommand)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].nonce.as_deref(), Some("n2"));
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn test_query_filters_by_root_branch() {
        let (_temp, engine) = setup();
        start(&engine, "n1", "first");
        start(&engine, "n2", "second");
        engine
            .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::Latest)
            .unwrap();

        let page = engine.query(&HistoryQuery::new().with_root("b2")).unwrap();
        assert_eq!(page.total, 2);
        assert!(page.entries.iter().all(|e| e.branch_id() == "b2"));

        let page = engine.query(&HistoryQuery::new().with_root("b1")).unwrap();
        assert_eq!(page.total, 5);
    }
}
