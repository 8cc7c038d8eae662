//! Shared helpers for stem-core scenario tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use stem_core::{GitCli, StemConfig, StemEngine, Workspace};
use tempfile::TempDir;

/// Run git in `root`, panicking on failure.
pub fn git(root: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
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

/// A fresh git repository with a local identity.
pub fn repo() -> TempDir {
    let temp = TempDir::new().unwrap();
    git(temp.path(), &["init", "--quiet"]);
    git(temp.path(), &["config", "user.name", "Scenario Tester"]);
    git(temp.path(), &["config", "user.email", "tester@example.com"]);
    git(temp.path(), &["config", "commit.gpgsign", "false"]);
    temp
}

/// Configuration tuned for tests: short idle interval, patient lock.
pub fn test_config() -> StemConfig {
    let mut config = StemConfig::default();
    config.watcher.idle_interval_ms = 100;
    config.watcher.poll_interval_ms = 20;
    config.lock.timeout_ms = 10_000;
    config
}

/// An initialized engine over `root`.
pub fn engine(root: &Path) -> StemEngine {
    let workspace = Workspace::from_root(root).unwrap();
    let vcs = GitCli::new(workspace.root(), "git");
    let mut engine = StemEngine::with_vcs(workspace, test_config(), vcs);
    engine.init().unwrap();
    engine
}

/// Number of commits reachable from any ref.
pub fn commit_count(root: &Path) -> usize {
    git(root, &["rev-list", "--all", "--count"]).parse().unwrap()
}
