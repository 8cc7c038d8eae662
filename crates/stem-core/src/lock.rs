//! Per-repository serialization lock.
//!
//! Every mutating command (interactive or watcher-triggered) holds
//! `.stem/lock` for the whole gate → VCS → log sequence. The lock is an OS
//! advisory lock (`flock` through `fs2`), so it is released by the kernel when
//! a holder dies; the JSON inside the file only describes the holder for
//! error messages.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::errors::StemError;

/// Description of the current lock holder, stored in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    /// Process holding the lock.
    pub pid: u32,
    /// Command being executed (e.g. `save`, `auto_save`).
    pub command: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockMetadata {
    /// Metadata for the current process.
    pub fn current(command: &str) -> Self {
        Self {
            pid: std::process::id(),
            command: command.to_string(),
            acquired_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for LockMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} ({}) since {}",
            self.pid,
            self.command,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// A held repository lock, released on drop.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
    metadata: LockMetadata,
}

impl RepoLock {
    /// Acquire the lock, retrying until `config.timeout_ms` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`StemError::ConcurrencyConflict`] naming the current holder if
    /// the bounded wait runs out.
    pub fn acquire(
        path: &Path,
        repo_root: &Path,
        command: &str,
        config: &LockConfig,
    ) -> Result<Self, StemError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        let timeout = Duration::from_millis(config.timeout_ms);
        let retry = Duration::from_millis(config.retry_interval_ms.max(1));

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= timeout {
                        let holder = read_holder(&mut file).map(|m| m.to_string());
                        tracing::warn!(
                            "Lock {} still held after {}ms{}",
                            path.display(),
                            config.timeout_ms,
                            holder.as_deref().map(|h| format!(" by {}", h)).unwrap_or_default()
                        );
                        return Err(StemError::ConcurrencyConflict {
                            repo_root: repo_root.to_path_buf(),
                            waited_ms: started.elapsed().as_millis() as u64,
                            holder,
                        });
                    }
                    thread::sleep(retry);
                }
                Err(e) => return Err(StemError::Io(e)),
            }
        }

        let metadata = LockMetadata::current(command);
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&metadata)?.as_bytes())?;
        file.flush()?;
        tracing::debug!("Acquired lock {} for {}", path.display(), command);

        Ok(Self {
            file,
            path: path.to_path_buf(),
            metadata,
        })
    }

    /// Metadata of this holder.
    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }

    /// Current holder of the lock at `path`, if the file describes one.
    pub fn holder(path: &Path) -> Option<LockMetadata> {
        let mut file = File::open(path).ok()?;
        read_holder(&mut file)
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn read_holder(file: &mut File) -> Option<LockMetadata> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}

// ============================================================================
// Tests
// ============================================================================
