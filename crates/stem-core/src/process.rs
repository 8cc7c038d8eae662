//! Watcher process control: start, liveness, stop.
//!
//! The handle file `.stem/watcher.json` is an externally observable fact,
//! not truth: liveness is always checked against the OS, and a handle whose
//! process is gone is removed as stale.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StemError;
use crate::workspace::Workspace;

/// Contents of the watcher handle file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherHandle {
    pub pid: u32,
    pub repo_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub detached: bool,
}

/// What the OS says about the recorded watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStatus {
    /// Handle of a live watcher.
    pub handle: Option<WatcherHandle>,
    /// Whether the watcher process is running.
    pub alive: bool,
}

/// How to launch a watcher process.
#[derive(Debug, Clone)]
pub struct WatcherLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WatcherLaunch {
    /// Re-run the current executable as `watch --root <repo>`.
    pub fn current_exe(repo_root: &Path) -> Result<Self, StemError> {
        let program = std::env::current_exe()
            .map_err(|e| StemError::Watcher(format!("Cannot locate own executable: {}", e)))?;
        Ok(Self {
            program,
            args: vec![
                "watch".to_string(),
                "--root".to_string(),
                repo_root.display().to_string(),
            ],
        })
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new watcher was launched.
    Started(WatcherHandle),
    /// A live watcher was already running; nothing was launched.
    AlreadyRunning(WatcherHandle),
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A termination signal was delivered to this pid.
    Stopped(u32),
    /// No live watcher was found. Not an error.
    NotRunning,
}

// ============================================================================
// OS helpers
// ============================================================================

/// Check if a process with the given PID is running.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) checks the pid without delivering a signal. EPERM means the
    // process exists but belongs to someone else.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), StemError> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(StemError::Watcher(format!("Failed to signal pid {}: {}", pid, err)))
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<(), StemError> {
    Err(StemError::Watcher(format!(
        "Stopping pid {} is not supported on this platform",
        pid
    )))
}

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn request_stop(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Route SIGTERM and SIGINT to a stop flag so the watcher loop finishes its
/// current checkpoint before exiting.
pub fn install_stop_handler() -> &'static AtomicBool {
    #[cfg(unix)]
    unsafe {
        let handler = request_stop as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
    &STOP_REQUESTED
}

// ============================================================================
// Handle file
// ============================================================================

fn read_handle(path: &Path) -> Option<WatcherHandle> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Ignoring unreadable watcher handle {}: {}", path.display(), e);
            None
        }
    }
}

fn write_handle(path: &Path, handle: &WatcherHandle) -> Result<(), StemError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(handle)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Query watcher liveness, removing a stale handle.
pub fn watcher_liveness(workspace: &Workspace) -> WatcherStatus {
    let path = workspace.watcher_handle_path();
    match read_handle(&path) {
        Some(handle) if is_process_alive(handle.pid) => WatcherStatus {
            handle: Some(handle),
            alive: true,
        },
        Some(handle) => {
            tracing::warn!("Removing stale watcher handle for pid {}", handle.pid);
            let _ = fs::remove_file(&path);
            WatcherStatus {
                handle: None,
                alive: false,
            }
        }
        None => WatcherStatus {
            handle: None,
            alive: false,
        },
    }
}

/// Start a watcher. With `detached`, the process runs in the background with
/// its output in `.stem/watcher.log`; otherwise this call waits for it.
///
/// Refuses to start a second live watcher and returns the existing handle.
pub fn start_watcher(
    workspace: &Workspace,
    launch: &WatcherLaunch,
    detached: bool,
) -> Result<StartOutcome, StemError> {
    workspace.require_initialized()?;
    if let Some(existing) = watcher_liveness(workspace).handle {
        tracing::info!("Watcher already running with pid {}", existing.pid);
        return Ok(StartOutcome::AlreadyRunning(existing));
    }

    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args).current_dir(workspace.root());

    if detached {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(workspace.watcher_log_path())?;
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| StemError::Watcher(format!("Failed to launch {}: {}", launch.program.display(), e)))?;

    let handle = WatcherHandle {
        pid: child.id(),
        repo_root: workspace.root().to_path_buf(),
        started_at: Utc::now(),
        detached,
    };
    write_handle(&workspace.watcher_handle_path(), &handle)?;
    tracing::info!("Started watcher pid {} for {}", handle.pid, workspace.root().display());

    if !detached {
        let status = child.wait()?;
        remove_handle_if(workspace, handle.pid);
        if !status.success() {
            return Err(StemError::Watcher(format!("Watcher exited with {}", status)));
        }
    }
    Ok(StartOutcome::Started(handle))
}

/// Stop the watcher with `pid` (or the recorded one). Idempotent.
pub fn stop_watcher(workspace: &Workspace, pid: Option<u32>) -> Result<StopOutcome, StemError> {
    let recorded = read_handle(&workspace.watcher_handle_path());
    let Some(pid) = pid.or(recorded.as_ref().map(|h| h.pid)) else {
        return Ok(StopOutcome::NotRunning);
    };

    if !is_process_alive(pid) {
        remove_handle_if(workspace, pid);
        return Ok(StopOutcome::NotRunning);
    }

    terminate(pid)?;
    for _ in 0..40 {
        if !is_process_alive(pid) {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    remove_handle_if(workspace, pid);
    tracing::info!("Stopped watcher pid {}", pid);
    Ok(StopOutcome::Stopped(pid))
}

fn remove_handle_if(workspace: &Workspace, pid: u32) {
    let path = workspace.watcher_handle_path();
    if read_handle(&path).is_some_and(|h| h.pid == pid) {
        let _ = fs::remove_file(&path);
    }
}

/// Registration of the current process as the repository's watcher.
///
/// Dropping the guard removes the handle file if it still names this process.
#[derive(Debug)]
pub struct WatcherGuard {
    workspace: Workspace,
    pid: u32,
}

impl WatcherGuard {
    /// Claim the watcher slot for this process.
    ///
    /// # Errors
    ///
    /// Returns [`StemError::Watcher`] if a different live process holds it.
    pub fn claim(workspace: &Workspace, detached: bool) -> Result<Self, StemError> {
        let pid = std::process::id();
        if let Some(existing) = watcher_liveness(workspace).handle {
            if existing.pid != pid {
                return Err(StemError::Watcher(format!(
                    "A watcher is already running for {} (pid {})",
                    workspace.root().display(),
                    existing.pid
                )));
            }
        }
        write_handle(
            &workspace.watcher_handle_path(),
            &WatcherHandle {
                pid,
                repo_root: workspace.root().to_path_buf(),
                started_at: Utc::now(),
                detached,
            },
        )?;
        Ok(Self {
            workspace: workspace.clone(),
            pid,
        })
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        remove_handle_if(&self.workspace, self.pid);
    }
}

// ============================================================================
// Tests
// ============================================================================
