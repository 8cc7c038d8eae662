//! End-to-end scenarios against a real git repository.

mod common;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{commit_count, engine, repo};
use stem_core::{
    run_watcher, AttemptResult, AutoCheckpoint, AutoCommitMachine, CheckpointMessage, CommandExecution,
    CommandKind, CommandRequest, Intent, LeafSelector, ManualClock, NodeRef, Orchestrator, Outcome,
    Record, StemError, WarningKind,
};

fn intent(prompt: &str) -> Intent {
    Intent::new(prompt, "").unwrap()
}

#[test]
fn placeholder_checkpoint_then_jump_back_restores_first_leaf() {
    let temp = repo();
    let engine = engine(temp.path());
    let file = temp.path().join("feature.txt");

    fs::write(&file, "first version").unwrap();
    let started = engine
        .start_branch(&CommandRequest::cli("n-start"), &intent("add feature"), None)
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(started.leaf.node(), NodeRef::new("b1", "1"));

    // Drive the auto-commit machine with a manual clock.
    let clock = ManualClock::new();
    let mut machine = AutoCommitMachine::new(&clock, engine.config().watcher.idle_interval());
    fs::write(&file, "second version").unwrap();
    machine.observe_change();
    assert_eq!(machine.poll(), None);
    clock.advance(engine.config().watcher.idle_interval());
    let nonce = machine.poll().expect("idle interval elapsed");

    let outcome = engine.auto_checkpoint(&nonce).unwrap();
    let Outcome::Applied(AutoCheckpoint::Saved { leaf, placeholder }) = outcome else {
        panic!("expected a saved leaf, got {:?}", outcome);
    };
    machine.finish(AttemptResult::Completed);
    assert!(placeholder);
    assert_eq!(leaf.node(), NodeRef::new("b1", "2"));

    let snapshot = engine.snapshot().unwrap();
    assert!(snapshot
        .warnings()
        .any(|w| w.kind == WarningKind::IntentUndeclared && w.node == Some(leaf.node())));

    engine
        .jump(&CommandRequest::cli("n-jump"), "b1", &LeafSelector::Id("1".to_string()))
        .unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "first version");

    let status = engine.status().unwrap();
    assert_eq!(status.current(), Some(&NodeRef::new("b1", "1")));
}

#[test]
fn watcher_runtime_checkpoints_after_idle_period() {
    let temp = repo();
    let engine = engine(temp.path());
    engine
        .start_branch(&CommandRequest::cli("n1"), &intent("watch me"), None)
        .unwrap();

    let stop = AtomicBool::new(false);
    thread::scope(|scope| {
        let watcher = scope.spawn(|| run_watcher(&engine, &stop));

        // Give the OS watcher a moment to register before mutating.
        thread::sleep(Duration::from_millis(300));
        fs::write(temp.path().join("notes.md"), "hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if engine.snapshot().unwrap().leaves().count() >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        stop.store(true, Ordering::SeqCst);
        watcher.join().unwrap().unwrap();
    });

    let snapshot = engine.snapshot().unwrap();
    let latest = snapshot.latest_leaf("b1").unwrap();
    assert_eq!(latest.leaf_id, "2");
    assert_eq!(latest.prompt, "auto-checkpoint");
}

#[test]
fn replayed_nonce_after_crash_appends_missing_leaf_once() {
    let temp = repo();
    let engine = engine(temp.path());
    engine
        .start_branch(&CommandRequest::cli("n0"), &intent("base"), None)
        .unwrap();
    fs::write(temp.path().join("work.txt"), "done before the crash").unwrap();

    // The gate accepted n1, ids were reserved and the commit landed, then the
    // process died before the leaf was appended.
    let store = engine.store();
    let root = engine.workspace().root().to_path_buf();
    store
        .append(&Record::CommandExecution(CommandExecution {
            repo_root: root.clone(),
            nonce: "n1".to_string(),
            command: CommandKind::Save,
            source_file: "cli".to_string(),
            created_at: Utc::now(),
        }))
        .unwrap();
    store
        .append(&Record::Reservation(stem_core::store::Reservation {
            repo_root: root.clone(),
            nonce: "n1".to_string(),
            command: CommandKind::Save,
            target: NodeRef::new("b1", "2"),
            new_branch: None,
            prompt: "crashed save".to_string(),
            summary: String::new(),
            created_at: Utc::now(),
        }))
        .unwrap();
    let orchestrator = Orchestrator::new(engine.vcs(), "stem");
    let commit = orchestrator
        .commit_checkpoint(&CheckpointMessage {
            branch_id: "b1".to_string(),
            leaf_id: "2".to_string(),
            prompt: "crashed save".to_string(),
            summary: String::new(),
            nonce: "n1".to_string(),
        })
        .unwrap();
    let commits = commit_count(temp.path());

    for _ in 0..3 {
        let outcome = engine
            .save_revision(&CommandRequest::cli("n1"), &intent("crashed save"))
            .unwrap();
        assert!(outcome.is_duplicate());
    }

    let snapshot = engine.snapshot().unwrap();
    let leaves: Vec<_> = snapshot.leaves().filter(|l| l.nonce == "n1").collect();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].vcs_commit, commit);
    assert_eq!(leaves[0].node(), NodeRef::new("b1", "2"));
    assert_eq!(commit_count(temp.path()), commits);
}

#[test]
fn first_and_latest_selectors() {
    let temp = repo();
    let engine = engine(temp.path());
    engine
        .start_branch(&CommandRequest::cli("n1"), &intent("one"), None)
        .unwrap();
    for i in 2..=4 {
        engine
            .save_revision(&CommandRequest::cli(format!("n{}", i)), &intent("more"))
            .unwrap();
    }

    let first = engine
        .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(first.jump.leaf_id, "1");

    let latest = engine
        .jump(&CommandRequest::cli("j2"), "b1", &LeafSelector::Latest)
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(latest.jump.leaf_id, "4");
    assert!(latest.attached);
}

#[test]
fn concurrent_saves_are_totally_ordered() {
    let temp = repo();
    let engine_a = engine(temp.path());
    engine_a
        .start_branch(&CommandRequest::cli("base"), &intent("base"), None)
        .unwrap();
    let engine_b = engine(temp.path());

    thread::scope(|scope| {
        for (tag, engine) in [("a", &engine_a), ("b", &engine_b)] {
            scope.spawn(move || {
                for i in 0..5 {
                    let nonce = format!("{}-{}", tag, i);
                    loop {
                        match engine.save_revision(&CommandRequest::cli(&nonce), &intent(&nonce)) {
                            Ok(_) => break,
                            Err(StemError::ConcurrencyConflict { .. }) => continue,
                            Err(e) => panic!("save {} failed: {}", nonce, e),
                        }
                    }
                }
            });
        }
    });

    let snapshot = engine_a.snapshot().unwrap();
    let leaves = snapshot.leaves_of("b1");
    assert_eq!(leaves.len(), 11);
    let ids: Vec<&str> = leaves.iter().map(|l| l.leaf_id.as_str()).collect();
    let expected: Vec<String> = (1..=11).map(|i| i.to_string()).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(leaves.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    // The ref points at the last checkpoint and every commit is distinct.
    let tip = &leaves[10].vcs_commit;
    assert_eq!(engine_a.status().unwrap().state.unwrap().head.as_ref(), Some(tip));
    let mut commits: Vec<&str> = leaves.iter().map(|l| l.vcs_commit.as_str()).collect();
    commits.sort();
    commits.dedup();
    assert_eq!(commits.len(), 11);
}

#[test]
fn jump_keeps_uncommitted_work_shelved() {
    let temp = repo();
    let engine = engine(temp.path());
    let file = temp.path().join("a.txt");
    fs::write(&file, "v1").unwrap();
    engine
        .start_branch(&CommandRequest::cli("n1"), &intent("one"), None)
        .unwrap();
    fs::write(&file, "v2").unwrap();
    engine
        .save_revision(&CommandRequest::cli("n2"), &intent("two"))
        .unwrap();

    fs::write(&file, "uncommitted").unwrap();
    fs::write(temp.path().join("new.txt"), "untracked").unwrap();
    let before = commit_count(temp.path());

    let result = engine
        .jump(&CommandRequest::cli("j1"), "b1", &LeafSelector::First)
        .unwrap()
        .applied()
        .unwrap();

    assert!(result.shelved.is_some());
    assert_eq!(fs::read_to_string(&file).unwrap(), "v1");
    assert!(!temp.path().join("new.txt").exists());
    // Nothing was committed on the way; the work sits in the stash.
    let stash = common::git(temp.path(), &["stash", "list"]);
    assert!(stash.contains("j1"));
    let leaves = engine.snapshot().unwrap().leaves().count();
    assert_eq!(leaves, 2);
    // A stash entry adds commits but no new leaf commits.
    assert!(commit_count(temp.path()) >= before);
}
