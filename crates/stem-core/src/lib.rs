//! # stem-core
//!
//! **stem** – navigable checkpoint history layered over git.
//!
//! This crate keeps an append-only tree of branches and leaves (each leaf
//! backed by one git commit, each carrying a declared intent) consistent with
//! the VCS across interactive commands, a background watcher and navigation.
//! It is designed to be consumed by the `stem` CLI and by agent tooling.
//!
//! ## Main Types
//!
//! - [`StemEngine`] – the entry point for every operation
//! - [`Workspace`] – a resolved repository on disk
//! - [`StemError`] – domain-specific error type
//!
//! ## Modules
//!
//! - [`store`] – the metadata log and its in-memory snapshot
//! - [`gate`] – idempotency by caller-supplied nonce
//! - [`orchestrator`] / [`vcs`] – checkpoint steps over the git CLI
//! - [`navigator`] – branch/leaf resolution and ancestry
//! - [`doctor`] – health checks of recorded history against the VCS
//! - [`watcher`] – the auto-commit state machine and its runtime
//! - [`process`] – watcher process control
//!
//! ## Example
//!
//! ```ignore
//! use stem_core::{CommandRequest, Intent, LeafSelector, StemEngine};
//! use std::path::Path;
//!
//! let mut engine = StemEngine::open(Path::new("."), None)?;
//! engine.init()?;
//!
//! let intent = Intent::new("add feature", "first cut")?;
//! engine.start_branch(&CommandRequest::cli("n1"), &intent, None)?;
//!
//! engine.jump(&CommandRequest::cli("n2"), "b1", &LeafSelector::First)?;
//! let status = engine.status()?;
//! println!("At {:?}", status.current());
//! ```

// Modules
pub mod config;
pub mod constants;
pub mod doctor;
pub mod engine;
pub mod errors;
pub mod gate;
pub mod intent;
pub mod lock;
pub mod log;
pub mod navigator;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod state;
pub mod status;
pub mod store;
pub mod vcs;
pub mod watcher;
pub mod workspace;

// Re-exports for convenience
pub use config::{LockConfig, MissingIntentPolicy, StemConfig, VcsConfig, WatcherConfig};
pub use constants::{STEM_DIR, STEM_HOME_ENV};
pub use doctor::{DoctorReport, Finding, FindingKind, Severity};
pub use engine::{
    AutoCheckpoint, BranchResult, CommandRequest, Disposition, DrainedCommand, InitReport,
    JumpResult, Outcome, ReconcileReport, StemEngine,
};
pub use errors::{ErrorReport, StemError};
pub use gate::{Admission, IdempotencyGate};
pub use intent::{Intent, IntentFile, QueueCommandKind, QueuedCommand};
pub use lock::{LockMetadata, RepoLock};
pub use log::{HistoryEntry, HistoryKind, HistoryPage, HistoryQuery};
pub use navigator::LeafSelector;
pub use orchestrator::{CheckoutTarget, CheckpointMessage, CheckpointStep, Orchestrator};
pub use process::{
    install_stop_handler, start_watcher, stop_watcher, watcher_liveness, StartOutcome,
    StopOutcome, WatcherGuard, WatcherHandle, WatcherLaunch, WatcherStatus,
};
pub use registry::{Registry, RegistryEntry};
pub use state::{PointerSource, ProcessState};
pub use status::{HistoryCounts, StatusReport};
pub use store::{
    BranchRecord, CommandExecution, CommandKind, JumpRecord, LeafRecord, MetadataStore, NodeRef,
    Record, Snapshot, WarningKind, WarningRecord,
};
pub use vcs::{GitCli, Vcs};
pub use watcher::{run_watcher, AttemptResult, AutoCommitMachine, Clock, ManualClock, SystemClock, WatchState};
pub use workspace::Workspace;
