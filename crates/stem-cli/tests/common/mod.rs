//! Shared test utilities for stem-cli integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command as StdCommand;

use assert_cmd::Command;
use tempfile::TempDir;

/// Get a Command for the stem binary.
///
/// # Panics
///
/// Panics if the stem binary cannot be found.
#[allow(deprecated)]
pub fn stem_cmd() -> Command {
    Command::cargo_bin("stem").expect("stem binary should exist")
}

/// A git repository plus an isolated `STEM_HOME`.
pub struct Sandbox {
    pub repo: TempDir,
    pub home: TempDir,
}

impl Sandbox {
    /// A fresh repository with a local git identity, not yet initialized.
    pub fn new() -> Self {
        let repo = TempDir::new().expect("create repo dir");
        git(repo.path(), &["init", "--quiet"]);
        git(repo.path(), &["config", "user.name", "Cli Tester"]);
        git(repo.path(), &["config", "user.email", "cli@example.com"]);
        git(repo.path(), &["config", "commit.gpgsign", "false"]);
        Self {
            repo,
            home: TempDir::new().expect("create home dir"),
        }
    }

    /// A fresh repository after `stem init`.
    pub fn initialized() -> Self {
        let sandbox = Self::new();
        sandbox.cmd().arg("init").assert().success();
        sandbox
    }

    pub fn root(&self) -> &Path {
        self.repo.path()
    }

    /// `stem` running in the repository with isolated global state.
    pub fn cmd(&self) -> Command {
        let mut cmd = stem_cmd();
        cmd.current_dir(self.repo.path())
            .env("STEM_HOME", self.home.path())
            .env("NO_COLOR", "1")
            .env_remove("STEM_CONFIG")
            .env_remove("STEM_IDLE_MS")
            .env_remove("STEM_VERBOSE");
        cmd
    }

    /// Run `stem --json <args>` successfully and parse its output.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().arg("--json").args(args).output().expect("run stem");
        assert!(
            output.status.success(),
            "stem {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stdout)
        );
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
    }

    /// Run `stem --json <args>`, expect failure, and parse the error report.
    pub fn json_error(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().arg("--json").args(args).output().expect("run stem");
        assert!(!output.status.success(), "stem {:?} should fail", args);
        serde_json::from_slice(&output.stdout).expect("error report should be JSON")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.repo.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.repo.path().join(rel)).expect("read file")
    }
}

/// Run git in `root`, panicking on failure.
pub fn git(root: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
