//! Background auto-checkpointing.
//!
//! [`AutoCommitMachine`] is the pure `Idle -> ChangesPending -> Committing`
//! state machine, driven by an injectable [`Clock`]. [`run_watcher`] feeds it
//! filesystem events from `notify` and a poll tick, and runs the engine's
//! `auto_checkpoint` and `drain_queue` when it fires.

use std::cell::Cell;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::constants::is_internal_path;
use crate::engine::{AutoCheckpoint, Outcome, StemEngine};
use crate::errors::StemError;
use crate::intent::list_queue;
use crate::vcs::Vcs;
use crate::workspace::Workspace;

// ============================================================================
// Clock
// ============================================================================

/// Source of monotonic time for the state machine.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

// ============================================================================
// AutoCommitMachine
// ============================================================================

/// Watcher state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    /// Changes seen; `last_change` restarts the idle timer.
    ChangesPending { last_change: Instant },
    /// A checkpoint with this nonce is in flight.
    Committing { nonce: String },
}

/// How a checkpoint attempt ended, as far as the machine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// A full accept-or-duplicate round trip happened (including "nothing to
    /// do" answers).
    Completed,
    /// Nothing was accepted; try again after another idle period.
    Deferred,
    /// A retryable failure; the next attempt reuses the nonce.
    RetryableFailure,
    /// A terminal failure; the nonce is dropped.
    Failed,
}

/// The `Idle` / `ChangesPending` / `Committing` machine.
///
/// Single-threaded: at most one checkpoint is in flight. Changes seen while
/// committing are queued as triggers and turn into a new pending period once
/// the attempt ends.
#[derive(Debug)]
pub struct AutoCommitMachine<C: Clock> {
    clock: C,
    idle_interval: Duration,
    state: WatchState,
    /// Changes observed while a checkpoint was in flight.
    triggers: VecDeque<Instant>,
    /// Nonce of an accepted-but-unfinished attempt.
    in_flight: Option<String>,
}

impl<C: Clock> AutoCommitMachine<C> {
    /// Create a machine in `Idle`.
    pub fn new(clock: C, idle_interval: Duration) -> Self {
        Self {
            clock,
            idle_interval,
            state: WatchState::Idle,
            triggers: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Changes queued behind the in-flight checkpoint.
    pub fn pending_triggers(&self) -> usize {
        self.triggers.len()
    }

    /// Record a filesystem mutation outside the metadata path.
    pub fn observe_change(&mut self) {
        let now = self.clock.now();
        match &self.state {
            WatchState::Idle | WatchState::ChangesPending { .. } => {
                self.state = WatchState::ChangesPending { last_change: now };
            }
            WatchState::Committing { .. } => self.triggers.push_back(now),
        }
    }

    /// Advance the idle timer. Returns the nonce to checkpoint with when the
    /// idle interval has elapsed.
    pub fn poll(&mut self) -> Option<String> {
        let WatchState::ChangesPending { last_change } = self.state else {
            return None;
        };
        if self.clock.now().saturating_duration_since(last_change) < self.idle_interval {
            return None;
        }
        let nonce = self
            .in_flight
            .get_or_insert_with(|| format!("auto-{}", uuid::Uuid::new_v4()))
            .clone();
        tracing::debug!("Idle interval elapsed, checkpointing with nonce {}", nonce);
        self.state = WatchState::Committing {
            nonce: nonce.clone(),
        };
        Some(nonce)
    }

    /// Leave `Committing`.
    pub fn finish(&mut self, result: AttemptResult) {
        if !matches!(self.state, WatchState::Committing { .. }) {
            return;
        }
        let now = self.clock.now();
        let retry = match result {
            AttemptResult::Completed | AttemptResult::Failed => {
                self.in_flight = None;
                false
            }
            AttemptResult::Deferred => {
                self.in_flight = None;
                true
            }
            AttemptResult::RetryableFailure => true,
        };

        let last_trigger = self.triggers.drain(..).last();
        self.state = match (retry, last_trigger) {
            (_, Some(at)) => WatchState::ChangesPending { last_change: at.max(now) },
            (true, None) => WatchState::ChangesPending { last_change: now },
            (false, None) => WatchState::Idle,
        };
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Whether a `notify` event reflects a change to the governed tree.
fn is_relevant(workspace: &Workspace, event: &Event) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|path| {
        workspace
            .relative_path(path)
            .is_some_and(|rel| !is_internal_path(&rel))
    })
}

fn classify(result: &Result<Outcome<AutoCheckpoint>, StemError>) -> AttemptResult {
    match result {
        Ok(Outcome::Applied(AutoCheckpoint::Blocked)) => AttemptResult::Deferred,
        Ok(_) => AttemptResult::Completed,
        Err(e) if e.is_retryable() => AttemptResult::RetryableFailure,
        Err(_) => AttemptResult::Failed,
    }
}

/// Run the watcher until `stop` is set.
///
/// The caller owns the watcher handle (see [`crate::process::WatcherGuard`]).
pub fn run_watcher<V: Vcs>(engine: &StemEngine<V>, stop: &AtomicBool) -> Result<(), StemError> {
    let workspace = engine.workspace();
    workspace.require_initialized()?;
    let settings = &engine.config().watcher;

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )
    .map_err(|e| StemError::Watcher(format!("Failed to create file watcher: {}", e)))?;
    watcher
        .watch(workspace.root(), RecursiveMode::Recursive)
        .map_err(|e| StemError::Watcher(format!("Failed to watch {}: {}", workspace.root().display(), e)))?;

    let mut machine = AutoCommitMachine::new(SystemClock, settings.idle_interval());
    tracing::info!(
        "Watching {} (idle {}ms)",
        workspace.root().display(),
        settings.idle_interval_ms
    );

    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(settings.poll_interval()) {
            Ok(Ok(event)) => {
                if is_relevant(workspace, &event) {
                    machine.observe_change();
                }
                // Take whatever else is buffered before checking the timer.
                while let Ok(next) = rx.try_recv() {
                    if let Ok(event) = next {
                        if is_relevant(workspace, &event) {
                            machine.observe_change();
                        }
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!("File watcher error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(StemError::Watcher("File watcher disconnected".to_string()));
            }
        }

        drain_pending_queue(engine, &workspace.queue_dir());

        if let Some(nonce) = machine.poll() {
            let result = engine.auto_checkpoint(&nonce);
            match &result {
                Ok(Outcome::Applied(AutoCheckpoint::Saved { leaf, placeholder })) => {
                    tracing::info!(
                        "Auto-checkpoint {}{}",
                        leaf.node(),
                        if *placeholder { " (placeholder intent)" } else { "" }
                    );
                }
                Ok(other) => tracing::debug!("Auto-checkpoint result: {:?}", other),
                Err(e) => tracing::error!("Auto-checkpoint {} failed: {}", nonce, e),
            }
            machine.finish(classify(&result));
        }
    }

    tracing::info!("Watcher for {} stopping", workspace.root().display());
    Ok(())
}

fn drain_pending_queue<V: Vcs>(engine: &StemEngine<V>, queue_dir: &Path) {
    match list_queue(queue_dir) {
        Ok(files) if !files.is_empty() => {}
        Ok(_) => return,
        Err(e) => {
            tracing::warn!("Cannot list queue {}: {}", queue_dir.display(), e);
            return;
        }
    }
    match engine.drain_queue() {
        Ok(drained) => {
            for item in drained {
                tracing::info!("Queue {}: {:?}", item.file.display(), item.disposition);
            }
        }
        Err(e) => tracing::error!("Draining queue failed: {}", e),
    }
}

// ============================================================================
// Tests
// ============================================================================
