//! The external version-control interface.
//!
//! The engine only ever talks to the VCS through the [`Vcs`] trait, and the
//! only production implementation, [`GitCli`], only ever talks to git through
//! its command line: exit statuses and printed identifiers, never repository
//! internals. Tests substitute an in-memory implementation to inject failures.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::errors::StemError;
use crate::orchestrator::{CheckpointMessage, CheckpointStep};

/// The VCS commands the orchestrator, navigator and reconciler consume.
///
/// Every method maps one documented VCS operation; failures are reported as
/// [`StemError::VcsCommandFailed`] tagged with the step they belong to.
pub trait Vcs {
    /// Repository root the implementation operates on.
    fn root(&self) -> &Path;

    /// Whether the root is already a repository.
    fn is_repository(&self) -> bool;

    /// Create an empty repository at the root.
    fn init_repository(&self) -> Result<(), StemError>;

    /// Keep `pattern` out of the VCS without touching tracked ignore files.
    fn exclude(&self, pattern: &str) -> Result<(), StemError>;

    /// Commit hash at HEAD, or `None` for a repository without commits.
    fn head_commit(&self) -> Result<Option<String>, StemError>;

    /// Name of the checked-out branch, or `None` when HEAD is detached.
    fn current_branch(&self) -> Result<Option<String>, StemError>;

    /// Commit a branch points at, or `None` if the branch does not exist.
    fn branch_commit(&self, name: &str) -> Result<Option<String>, StemError>;

    /// Whether `commit` names a commit object in the repository.
    fn commit_exists(&self, commit: &str) -> Result<bool, StemError>;

    /// Whether `ancestor` is reachable from `descendant`.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, StemError>;

    /// Create branch `name` at the current HEAD and switch to it.
    fn create_branch(&self, name: &str) -> Result<(), StemError>;

    /// Stage every change outside the metadata directory.
    fn stage_all(&self) -> Result<(), StemError>;

    /// Create one commit (empty commits allowed) and return its hash.
    fn commit(&self, message: &str) -> Result<String, StemError>;

    /// Whether the working tree has changes outside the metadata directory.
    fn has_changes(&self) -> Result<bool, StemError>;

    /// Shelve uncommitted changes (including untracked files) under `message`.
    fn stash_push(&self, message: &str) -> Result<(), StemError>;

    /// Messages of all shelved entries, newest first.
    fn stash_list(&self) -> Result<Vec<String>, StemError>;

    /// Check out a branch by name.
    fn checkout_branch(&self, name: &str) -> Result<(), StemError>;

    /// Check out a commit with a detached HEAD.
    fn checkout_detached(&self, commit: &str) -> Result<(), StemError>;

    /// Find the checkpoint commit carrying `nonce` in its trailer, on any ref.
    fn find_checkpoint(&self, nonce: &str) -> Result<Option<String>, StemError>;

    /// Configured author name, if any.
    fn user_name(&self) -> Result<Option<String>, StemError>;
}

// ============================================================================
// GitCli
// ============================================================================

/// [`Vcs`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    program: String,
}

/// Captured result of one git invocation.
struct GitOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

impl GitCli {
    /// Create an adapter for the repository at `root`.
    pub fn new(root: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            program: program.into(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    fn spawn(&self, args: &[&str], stdin: Option<&str>) -> Result<GitOutput, std::io::Error> {
        tracing::debug!("Running `{}` in {}", self.describe(args), self.root.display());

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        Ok(GitOutput {
            success: output.status.success(),
            status: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command that must succeed.
    fn run(&self, step: CheckpointStep, args: &[&str]) -> Result<String, StemError> {
        self.run_with_input(step, args, None)
    }

    fn run_with_input(
        &self,
        step: CheckpointStep,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, StemError> {
        let output = self
            .spawn(args, stdin)
            .map_err(|e| self.failure(step, args, "spawn", e.to_string()))?;
        if !output.success {
            return Err(self.failure(step, args, &output.status, output.stderr));
        }
        Ok(output.stdout)
    }

    /// Run a query whose non-zero exit means "absent" rather than failure.
    fn run_optional(&self, args: &[&str]) -> Result<Option<String>, StemError> {
        let output = self
            .spawn(args, None)
            .map_err(|e| self.failure(CheckpointStep::Inspect, args, "spawn", e.to_string()))?;
        if output.success {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    fn failure(&self, step: CheckpointStep, args: &[&str], status: &str, stderr: String) -> StemError {
        StemError::VcsCommandFailed {
            repo_root: self.root.clone(),
            step,
            command: self.describe(args),
            status: status.to_string(),
            stderr,
        }
    }
}

impl Vcs for GitCli {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_repository(&self) -> bool {
        self.root.join(".git").exists()
    }

    fn init_repository(&self) -> Result<(), StemError> {
        self.run(CheckpointStep::Init, &["init", "--quiet"])?;
        Ok(())
    }

    fn exclude(&self, pattern: &str) -> Result<(), StemError> {
        let info_dir = self.root.join(".git").join("info");
        fs::create_dir_all(&info_dir)?;
        let exclude = info_dir.join("exclude");

        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == pattern) {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", pattern)?;
        Ok(())
    }

    fn head_commit(&self) -> Result<Option<String>, StemError> {
        self.run_optional(&["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])
    }

    fn current_branch(&self) -> Result<Option<String>, StemError> {
        Ok(self
            .run_optional(&["symbolic-ref", "--quiet", "--short", "HEAD"])?
            .filter(|name| !name.is_empty()))
    }

    fn branch_commit(&self, name: &str) -> Result<Option<String>, StemError> {
        let spec = format!("refs/heads/{}^{{commit}}", name);
        self.run_optional(&["rev-parse", "--verify", "--quiet", &spec])
    }

    fn commit_exists(&self, commit: &str) -> Result<bool, StemError> {
        let spec = format!("{}^{{commit}}", commit);
        Ok(self.run_optional(&["rev-parse", "--verify", "--quiet", &spec])?.is_some())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, StemError> {
        Ok(self
            .run_optional(&["merge-base", "--is-ancestor", ancestor, descendant])?
            .is_some())
    }

    fn create_branch(&self, name: &str) -> Result<(), StemError> {
        self.run(CheckpointStep::CreateBranch, &["checkout", "--quiet", "-b", name])?;
        Ok(())
    }

    /// Stages everything git does not ignore. `.stem/` stays out through the
    /// `info/exclude` entry written by `init`.
    fn stage_all(&self) -> Result<(), StemError> {
        self.run(CheckpointStep::StageAll, &["add", "--all"])?;
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<String, StemError> {
        self.run_with_input(
            CheckpointStep::Commit,
            &[
                "commit",
                "--quiet",
                "--allow-empty",
                "--no-verify",
                "--cleanup=whitespace",
                "--file=-",
            ],
            Some(message),
        )?;
        let hash = self.run(CheckpointStep::Commit, &["rev-parse", "HEAD"])?;
        Ok(hash.trim().to_string())
    }

    fn has_changes(&self) -> Result<bool, StemError> {
        let status = self.run(
            CheckpointStep::Inspect,
            &["status", "--porcelain", "--untracked-files=all"],
        )?;
        Ok(status.lines().any(|line| {
            let path = line.get(3..).unwrap_or_default().trim_matches('"');
            !path.is_empty() && !crate::constants::is_internal_path(path)
        }))
    }

    fn stash_push(&self, message: &str) -> Result<(), StemError> {
        self.run(
            CheckpointStep::Shelve,
            &["stash", "push", "--quiet", "--include-untracked", "-m", message],
        )?;
        Ok(())
    }

    fn stash_list(&self) -> Result<Vec<String>, StemError> {
        let out = self.run(CheckpointStep::Shelve, &["stash", "list", "--format=%gs"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn checkout_branch(&self, name: &str) -> Result<(), StemError> {
        self.run(CheckpointStep::Checkout, &["checkout", "--quiet", name])?;
        Ok(())
    }

    fn checkout_detached(&self, commit: &str) -> Result<(), StemError> {
        self.run(CheckpointStep::Checkout, &["checkout", "--quiet", "--detach", commit])?;
        Ok(())
    }

    fn find_checkpoint(&self, nonce: &str) -> Result<Option<String>, StemError> {
        // A repository without any ref has no history to search.
        let refs = self.run(CheckpointStep::Inspect, &["for-each-ref", "--count=1"])?;
        if refs.trim().is_empty() {
            return Ok(None);
        }

        let grep = format!("--grep={}: ", crate::constants::NONCE_TRAILER);
        let log = self.run(
            CheckpointStep::Inspect,
            &["log", "--all", "--fixed-strings", &grep, "--format=%H%x00%B%x1e"],
        )?;

        for entry in log.split('\u{1e}') {
            let entry = entry.trim_start_matches('\n');
            let Some((hash, body)) = entry.split_once('\0') else {
                continue;
            };
            if let Some(message) = CheckpointMessage::parse(body) {
                if message.nonce == nonce {
                    return Ok(Some(hash.trim().to_string()));
                }
            }
        }
        Ok(None)
    }

    fn user_name(&self) -> Result<Option<String>, StemError> {
        Ok(self
            .run_optional(&["config", "user.name"])?
            .filter(|name| !name.is_empty()))
    }
}

// ============================================================================
// Tests
// ============================================================================
