//! Idempotency gate: at-most-once application of commands keyed by nonce.
//!
//! The gate must be called with the repository lock held, so that the check
//! and the `commandExecution` append cannot interleave with another process.

use crate::errors::StemError;
use crate::store::{CommandExecution, CommandKind, MetadataStore, Record, Snapshot};

/// The gate's verdict for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The command should run.
    ///
    /// `resumed` is set when the nonce was accepted before but its effects
    /// never fully landed; the caller completes the missing steps.
    Accepted { resumed: bool },
    /// The command already ran to completion; treat as a no-op success.
    Duplicate,
}

impl Admission {
    /// Whether the command should run.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Deduplicates command invocations by caller-supplied nonce.
#[derive(Debug)]
pub struct IdempotencyGate<'a> {
    store: &'a MetadataStore,
}

impl<'a> IdempotencyGate<'a> {
    /// Create a gate over a repository's store.
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    /// Decide without side effects.
    pub fn check(snapshot: &Snapshot, nonce: &str) -> Result<Admission, StemError> {
        if nonce.trim().is_empty() {
            return Err(StemError::InvalidArgument(
                "Command nonce must not be empty".to_string(),
            ));
        }
        if snapshot.is_complete(nonce) {
            return Ok(Admission::Duplicate);
        }
        Ok(Admission::Accepted {
            resumed: snapshot.execution(nonce).is_some(),
        })
    }

    /// Admit a command, persisting its execution record on first sight.
    ///
    /// `snapshot` must be the current state of the store; the appended record
    /// is pushed into it as well.
    pub fn accept(
        &self,
        snapshot: &mut Snapshot,
        nonce: &str,
        command: CommandKind,
        source_file: &str,
    ) -> Result<Admission, StemError> {
        let admission = Self::check(snapshot, nonce)?;
        match admission {
            Admission::Duplicate => {
                tracing::info!("Nonce {} already applied, skipping {}", nonce, command);
            }
            Admission::Accepted { resumed: true } => {
                tracing::info!("Resuming incomplete {} for nonce {}", command, nonce);
            }
            Admission::Accepted { resumed: false } => {
                let record = Record::CommandExecution(CommandExecution {
                    repo_root: self.store.repo_root().to_path_buf(),
                    nonce: nonce.to_string(),
                    command,
                    source_file: source_file.to_string(),
                    created_at: self.store.next_timestamp(snapshot),
                });
                self.store.record(snapshot, record)?;
            }
        }
        Ok(admission)
    }
}

// ============================================================================
// Tests
// ============================================================================
