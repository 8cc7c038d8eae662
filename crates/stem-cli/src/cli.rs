//! CLI definition and command dispatch for stem.
//!
//! This module defines the command-line interface using `clap` and provides
//! the `run()` function that dispatches commands to the engine.
//!
//! ## Configuration Precedence
//!
//! Configuration is resolved with the following precedence (highest to lowest):
//! 1. CLI flags (e.g., `--config`, `--verbose`, `--idle-ms`)
//! 2. Environment variables (`STEM_CONFIG`, `STEM_VERBOSE`, `STEM_IDLE_MS`, `STEM_HOME`)
//! 3. Repository config (`.stem/config.yaml`)
//! 4. Global config (`~/.stem/config.yaml` or path from `--config`/`STEM_CONFIG`)
//! 5. Built-in defaults

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::ui::format::{first_line, format_relative_time, plural, truncate_str};
use crate::ui::{ColorMode, MessageType, Style};

use stem_core::intent::archive_file;
use stem_core::{
    install_stop_handler, run_watcher, start_watcher, stop_watcher, watcher_liveness, CommandRequest,
    Disposition, FindingKind, HistoryEntry, HistoryKind, HistoryQuery, Intent, IntentFile, LeafSelector, Outcome,
    Registry, Severity, StartOutcome, StemEngine, StemError, StopOutcome, WatcherGuard, WatcherLaunch, Workspace,
};

// ============================================================================
// CLI Definition
// ============================================================================

/// Version string including git commit hash
const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")");

/// Prompt width in human listings.
const PROMPT_WIDTH: usize = 60;

/// stem – navigable checkpoint history over git
#[derive(Parser, Debug)]
#[command(name = "stem")]
#[command(author, version = VERSION, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, env = "STEM_VERBOSE")]
    pub verbose: bool,

    /// Path to the global configuration file (default: ~/.stem/config.yaml)
    #[arg(long, global = true, env = "STEM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the watcher idle interval in milliseconds
    #[arg(long, global = true, env = "STEM_IDLE_MS")]
    pub idle_ms: Option<u64>,

    /// Idempotency key for this command (default: a fresh UUID)
    #[arg(long, global = true)]
    pub nonce: Option<String>,

    /// Output results and errors as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Color output mode
    #[arg(long, global = true, env = "STEM_COLOR", value_enum, default_value_t = ColorMode::Auto)]
    pub color: ColorMode,

    #[command(subcommand)]
    pub command: Command,
}

/// Intent of the checkpoint a command creates.
#[derive(Args, Debug, Default)]
pub struct IntentArgs {
    /// Prompt describing the checkpoint (default: read the agent intent file)
    #[arg(long)]
    pub prompt: Option<String>,

    /// Longer summary of the checkpoint
    #[arg(long, requires = "prompt")]
    pub summary: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize stem for the current repository
    #[command(after_help = r#"EXAMPLES:
    # Initialize (runs `git init` when needed)
    stem init
"#)]
    Init,

    /// Start a new line of exploration (branch) with its first leaf
    #[command(after_help = r#"EXAMPLES:
    # Start a line from the current position
    stem branch --prompt "try a streaming parser"

    # Save the current line before moving on
    stem branch --prompt "try a streaming parser" --old-prompt "buffered parser works"

    # Take the intent from .stem/agent/branch.json
    stem branch --nonce 6f1c...
"#)]
    Branch {
        #[command(flatten)]
        intent: IntentArgs,

        /// Prompt of a closing leaf saved on the current line first
        #[arg(long, requires = "prompt")]
        old_prompt: Option<String>,

        /// Summary of the closing leaf
        #[arg(long, requires = "old_prompt")]
        old_summary: Option<String>,
    },

    /// Save a revision (leaf) on the current line
    #[command(after_help = r#"EXAMPLES:
    # Save with an explicit intent
    stem save --prompt "handle empty input" --summary "adds a guard and a test"

    # Take the intent from .stem/agent/leaf.json
    stem save
"#)]
    Save {
        #[command(flatten)]
        intent: IntentArgs,
    },

    /// Move the working tree to a branch's leaf
    #[command(after_help = r#"EXAMPLES:
    # Jump to the latest leaf of b2
    stem jump b2

    # Jump to a specific leaf
    stem jump b1 3
    stem jump b1 first
"#)]
    Jump {
        /// Branch id (e.g. b1)
        branch: String,

        /// Leaf: a number, `first` or `latest`
        #[arg(default_value = "latest")]
        leaf: LeafSelector,
    },

    /// Auto-checkpoint the working tree after it goes idle
    #[command(after_help = r#"EXAMPLES:
    # Watch in the foreground
    stem watch

    # Run in the background, logging to .stem/watcher.log
    stem watch --detach

    # Stop the background watcher
    stem watch --stop
"#)]
    Watch {
        /// Run in the background
        #[arg(long, conflicts_with = "stop")]
        detach: bool,

        /// Stop the running watcher
        #[arg(long)]
        stop: bool,

        /// Repository to watch (default: the current directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Execute queued agent commands from .stem/agent/queue
    Drain,

    /// Complete interrupted checkpoints from VCS evidence
    Reconcile,

    /// Check recorded history against git
    #[command(after_help = r#"EXAMPLES:
    stem doctor
    stem doctor --json | jq '.findings[] | select(.severity == "error")'
"#)]
    Doctor,

    /// Show the current position, watcher and pending work
    #[command(after_help = r#"EXAMPLES:
    stem status
    stem status --json | jq '.state.current'
"#)]
    Status,

    /// List branches, leaves and jumps in time order
    #[command(after_help = r#"EXAMPLES:
    # Everything
    stem log

    # Leaves of b1 and every line forked from it
    stem log --kind leaf --root b1

    # Second page of 20
    stem log --offset 20 --limit 20 --json
"#)]
    Log {
        /// Entry kinds: branch, leaf, jump (comma-separated)
        #[arg(long, value_delimiter = ',')]
        kind: Vec<HistoryKind>,

        /// Restrict to this branch and its descendants
        #[arg(long)]
        root: Option<String>,

        /// Entries to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Maximum entries to return
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// List repositories registered with stem
    Repos,
}

impl Command {
    /// Whether the command records history (and so honors `--nonce`).
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Branch { .. } | Self::Save { .. } | Self::Jump { .. }
        )
    }
}

// ============================================================================
// Run function
// ============================================================================

/// Settings shared by every handler.
struct Context {
    style: Style,
    json: bool,
    nonce: String,
}

impl Context {
    fn request(&self) -> CommandRequest {
        CommandRequest::cli(self.nonce.as_str())
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }

    fn say(&self, msg_type: MessageType, text: &str) {
        println!("{}", self.style.message(msg_type, text));
    }

    fn duplicate(&self, nonce: &str) {
        self.say(
            MessageType::Skip,
            &format!("Command `{}` was already applied; nothing to do", nonce),
        );
    }
}

/// Run the CLI application.
///
/// Parses command-line arguments, opens the repository's engine, and
/// dispatches to the appropriate command handler.
///
/// # Returns
///
/// Returns `ExitCode::SUCCESS` on success (including duplicate commands), or
/// `ExitCode::FAILURE` on error.
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // Always show warnings (drift, undeclared intent, stale handles).
    // Show debug info only when --verbose is set.
    let log_level = if cli.verbose { "debug" } else { "warn" };
    let filter = format!("stem_core={},stem_cli={}", log_level, log_level);

    tracing_subscriber::fmt()
        .with_env_filter(&filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context {
        style: Style::new(cli.color.for_output(cli.json)),
        json: cli.json,
        nonce: cli
            .nonce
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    };
    let mutating = cli.command.is_mutating();

    let result = match cli.command {
        Command::Repos => handle_repos(&ctx),
        Command::Watch { detach, stop, root } => {
            let start = root.unwrap_or_else(|| PathBuf::from("."));
            open_engine(&start, cli.config.as_deref(), cli.idle_ms)
                .and_then(|engine| handle_watch(&ctx, &engine, detach, stop))
        }
        command => open_engine(Path::new("."), cli.config.as_deref(), cli.idle_ms)
            .and_then(|mut engine| dispatch(&ctx, &mut engine, command)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if ctx.json {
                ctx.print_json(&e.report());
            } else {
                let hint = error_hint(&e, mutating.then_some(ctx.nonce.as_str()));
                eprintln!("{}", ctx.style.error_with_context(&e.to_string(), None, hint.as_deref()));
            }
            ExitCode::FAILURE
        }
    }
}

fn open_engine(start: &Path, config: Option<&Path>, idle_ms: Option<u64>) -> Result<StemEngine, StemError> {
    let mut engine = StemEngine::open(start, config)?;
    if let Some(ms) = idle_ms {
        tracing::debug!("Idle interval overridden to {}ms", ms);
        engine.config_mut().watcher.idle_interval_ms = ms;
    }
    Ok(engine)
}

fn dispatch(ctx: &Context, engine: &mut StemEngine, command: Command) -> Result<(), StemError> {
    match command {
        Command::Init => handle_init(ctx, engine),
        Command::Branch {
            intent,
            old_prompt,
            old_summary,
        } => handle_branch(ctx, engine, intent, old_prompt, old_summary),
        Command::Save { intent } => handle_save(ctx, engine, intent),
        Command::Jump { branch, leaf } => handle_jump(ctx, engine, &branch, &leaf),
        Command::Drain => handle_drain(ctx, engine),
        Command::Reconcile => handle_reconcile(ctx, engine),
        Command::Status => handle_status(ctx, engine),
        Command::Doctor => handle_doctor(ctx, engine),
        Command::Log {
            kind,
            root,
            offset,
            limit,
        } => handle_log(ctx, engine, kind, root, offset, limit),
        Command::Watch { .. } | Command::Repos => Ok(()),
    }
}

fn error_hint(error: &StemError, nonce: Option<&str>) -> Option<String> {
    match error {
        StemError::PartialCheckpoint { nonce, .. } => Some(format!(
            "Re-run with `--nonce {}` to finish without repeating completed steps",
            nonce
        )),
        StemError::ConcurrencyConflict { .. } => {
            Some("Another stem command is running; retry shortly".to_string())
        }
        e if e.is_retryable() => nonce.map(|n| format!("Re-run with `--nonce {}` to retry safely", n)),
        _ => None,
    }
}

// ============================================================================
// Intent resolution
// ============================================================================

/// An intent taken from flags or from an agent intent file.
struct Declared {
    intent: Intent,
    closing: Option<Intent>,
    file: Option<PathBuf>,
}

impl Declared {
    fn from_flags(intent: IntentArgs, closing: Option<(String, Option<String>)>) -> Result<Option<Self>, StemError> {
        let Some(prompt) = intent.prompt else {
            return Ok(None);
        };
        let closing = match closing {
            Some((prompt, summary)) => Some(Intent::new(&prompt, summary.as_deref().unwrap_or_default())?),
            None => None,
        };
        Ok(Some(Self {
            intent: Intent::new(&prompt, intent.summary.as_deref().unwrap_or_default())?,
            closing,
            file: None,
        }))
    }

    fn from_file(workspace: &Workspace, path: PathBuf) -> Result<Self, StemError> {
        let display = workspace
            .relative_path(&path)
            .unwrap_or_else(|| path.display().to_string());
        let file = IntentFile::load(&path)?.ok_or_else(|| {
            StemError::InvalidArgument(format!("No intent declared. Pass --prompt or write {}", display))
        })?;
        let intent = file.intent().ok_or_else(|| StemError::IntentValidation {
            path: path.clone(),
            reason: "`prompt` is required".to_string(),
        })?;
        Ok(Self {
            intent,
            closing: file.closing(),
            file: Some(path),
        })
    }

    fn request(&self, ctx: &Context, workspace: &Workspace) -> CommandRequest {
        match &self.file {
            Some(path) => CommandRequest::new(
                ctx.nonce.as_str(),
                workspace
                    .relative_path(path)
                    .unwrap_or_else(|| path.display().to_string()),
            ),
            None => ctx.request(),
        }
    }

    /// Archive a consumed intent file.
    fn consume(&self, workspace: &Workspace) -> Result<(), StemError> {
        if let Some(path) = &self.file {
            archive_file(&workspace.archive_dir(), path, "done")?;
        }
        Ok(())
    }
}

// ============================================================================
// Command handlers
// ============================================================================

fn handle_init(ctx: &Context, engine: &mut StemEngine) -> Result<(), StemError> {
    let report = engine.init()?;

    if ctx.json {
        ctx.print_json(&report);
        return Ok(());
    }

    let root = report.repo_root.display().to_string();
    if report.created {
        ctx.say(MessageType::Ok, &format!("Initialized stem in {}", root));
    } else {
        ctx.say(MessageType::Info, &format!("stem is already initialized in {}", root));
    }
    if report.vcs_initialized {
        println!("{}", ctx.style.message_detail("VCS", "created a git repository"));
    }
    if !report.registered {
        ctx.say(MessageType::Warn, "Repository was not added to the global registry");
    }
    ctx.say(
        MessageType::Hint,
        "Start a line with `stem branch --prompt \"...\"`",
    );
    Ok(())
}

fn handle_branch(
    ctx: &Context,
    engine: &StemEngine,
    intent: IntentArgs,
    old_prompt: Option<String>,
    old_summary: Option<String>,
) -> Result<(), StemError> {
    let workspace = engine.workspace();
    let declared = match Declared::from_flags(intent, old_prompt.map(|p| (p, old_summary)))? {
        Some(declared) => declared,
        None => Declared::from_file(workspace, workspace.branch_intent_path())?,
    };

    let outcome = engine.start_branch(
        &declared.request(ctx, workspace),
        &declared.intent,
        declared.closing.as_ref(),
    )?;
    declared.consume(workspace)?;

    if ctx.json {
        ctx.print_json(&outcome);
        return Ok(());
    }

    match outcome {
        Outcome::Applied(result) => {
            if let Some(closing) = &result.closing {
                ctx.say(
                    MessageType::Ok,
                    &format!(
                        "Saved {} before branching",
                        ctx.style.node(&closing.node().to_string())
                    ),
                );
            }
            ctx.say(
                MessageType::Ok,
                &format!(
                    "Started {} at {} {}",
                    ctx.style.node(&result.branch.branch_id),
                    ctx.style.node(&result.leaf.node().to_string()),
                    ctx.style.prompt(&result.leaf.prompt, false)
                ),
            );
            println!("{}", ctx.style.message_detail("Ref", &result.branch.vcs_ref));
            if let Some(fork) = &result.branch.forked_from {
                println!("{}", ctx.style.message_detail("Forked from", &fork.to_string()));
            }
            println!(
                "{}",
                ctx.style.message_detail("Commit", &ctx.style.commit(&result.leaf.vcs_commit))
            );
        }
        Outcome::Duplicate { nonce } => ctx.duplicate(&nonce),
    }
    Ok(())
}

fn handle_save(ctx: &Context, engine: &StemEngine, intent: IntentArgs) -> Result<(), StemError> {
    let workspace = engine.workspace();
    let declared = match Declared::from_flags(intent, None)? {
        Some(declared) => declared,
        None => Declared::from_file(workspace, workspace.leaf_intent_path())?,
    };

    let outcome = engine.save_revision(&declared.request(ctx, workspace), &declared.intent)?;
    declared.consume(workspace)?;

    if ctx.json {
        ctx.print_json(&outcome);
        return Ok(());
    }

    match outcome {
        Outcome::Applied(leaf) => {
            ctx.say(
                MessageType::Ok,
                &format!(
                    "Saved {} {}",
                    ctx.style.node(&leaf.node().to_string()),
                    ctx.style.prompt(&leaf.prompt, false)
                ),
            );
            println!("{}", ctx.style.message_detail("Commit", &ctx.style.commit(&leaf.vcs_commit)));
        }
        Outcome::Duplicate { nonce } => ctx.duplicate(&nonce),
    }
    Ok(())
}

fn handle_jump(ctx: &Context, engine: &StemEngine, branch: &str, leaf: &LeafSelector) -> Result<(), StemError> {
    let outcome = engine.jump(&ctx.request(), branch, leaf)?;

    if ctx.json {
        ctx.print_json(&outcome);
        return Ok(());
    }

    match outcome {
        Outcome::Applied(result) => {
            let node = format!("{}/{}", result.jump.branch_id, result.jump.leaf_id);
            ctx.say(
                MessageType::Ok,
                &format!(
                    "Jumped to {} {}",
                    ctx.style.node(&node),
                    ctx.style.prompt(&result.jump.prompt, false)
                ),
            );
            println!("{}", ctx.style.message_detail("Commit", &ctx.style.commit(&result.vcs_commit)));
            if let Some(shelved) = &result.shelved {
                ctx.say(
                    MessageType::Info,
                    &format!("Uncommitted work shelved as `{}` (see `git stash list`)", shelved),
                );
            }
            if !result.attached {
                ctx.say(
                    MessageType::Hint,
                    "This is a historical leaf. Start a new branch to continue from here.",
                );
            }
        }
        Outcome::Duplicate { nonce } => ctx.duplicate(&nonce),
    }
    Ok(())
}

fn handle_watch(ctx: &Context, engine: &StemEngine, detach: bool, stop: bool) -> Result<(), StemError> {
    let workspace = engine.workspace();
    workspace.require_initialized()?;

    if stop {
        let outcome = stop_watcher(workspace, None)?;
        if ctx.json {
            let pid = match outcome {
                StopOutcome::Stopped(pid) => Some(pid),
                StopOutcome::NotRunning => None,
            };
            ctx.print_json(&serde_json::json!({ "stopped": pid }));
        } else {
            match outcome {
                StopOutcome::Stopped(pid) => ctx.say(MessageType::Ok, &format!("Stopped watcher (pid {})", pid)),
                StopOutcome::NotRunning => ctx.say(MessageType::Skip, "No watcher is running"),
            }
        }
        return Ok(());
    }

    if detach {
        let launch = WatcherLaunch::current_exe(workspace.root())?;
        let outcome = start_watcher(workspace, &launch, true)?;
        let (handle, started) = match outcome {
            StartOutcome::Started(handle) => (handle, true),
            StartOutcome::AlreadyRunning(handle) => (handle, false),
        };
        if ctx.json {
            ctx.print_json(&serde_json::json!({ "started": started, "handle": handle }));
        } else if started {
            ctx.say(MessageType::Ok, &format!("Watcher started (pid {})", handle.pid));
            println!(
                "{}",
                ctx.style
                    .message_detail("Log", &workspace.watcher_log_path().display().to_string())
            );
        } else {
            ctx.say(
                MessageType::Skip,
                &format!("Watcher already running (pid {})", handle.pid),
            );
        }
        return Ok(());
    }

    // Foreground: this process is the watcher. A detached launch already
    // recorded our pid; keep its `detached` flag.
    let pid = std::process::id();
    let detached = watcher_liveness(workspace)
        .handle
        .is_some_and(|h| h.pid == pid && h.detached);
    let _guard = WatcherGuard::claim(workspace, detached)?;
    let stop = install_stop_handler();

    if !ctx.json {
        ctx.say(
            MessageType::Info,
            &format!(
                "Watching {} (idle {}ms). Press Ctrl-C to stop.",
                workspace.root().display(),
                engine.config().watcher.idle_interval_ms
            ),
        );
    }
    run_watcher(engine, stop)?;
    if !ctx.json {
        ctx.say(MessageType::Ok, "Watcher stopped");
    }
    Ok(())
}

fn handle_drain(ctx: &Context, engine: &StemEngine) -> Result<(), StemError> {
    let drained = engine.drain_queue()?;

    if ctx.json {
        ctx.print_json(&drained);
        return Ok(());
    }

    if drained.is_empty() {
        ctx.say(MessageType::Skip, "Queue is empty");
        return Ok(());
    }

    for item in &drained {
        let name = item
            .file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| item.file.display().to_string());
        let nonce = item.nonce.as_deref().unwrap_or("-");
        let message = item.message.as_deref().unwrap_or_default();
        match item.disposition {
            Disposition::Done => ctx.say(MessageType::Ok, &format!("{} applied ({})", name, nonce)),
            Disposition::Duplicate => {
                ctx.say(MessageType::Skip, &format!("{} already applied ({})", name, nonce))
            }
            Disposition::Invalid => ctx.say(MessageType::Warn, &format!("{} rejected: {}", name, message)),
            Disposition::Deferred => ctx.say(
                MessageType::Warn,
                &format!("{} deferred: {}. It stays queued for the next drain.", name, message),
            ),
        }
    }
    Ok(())
}

fn handle_reconcile(ctx: &Context, engine: &StemEngine) -> Result<(), StemError> {
    let report = engine.reconcile()?;

    if ctx.json {
        ctx.print_json(&report);
        return Ok(());
    }

    if report.rolled_forward.is_empty() {
        ctx.say(MessageType::Ok, "Log and VCS agree");
    }
    for node in &report.rolled_forward {
        ctx.say(
            MessageType::Ok,
            &format!("Completed {} from its commit", ctx.style.node(&node.to_string())),
        );
    }
    for nonce in &report.pending {
        ctx.say(
            MessageType::Warn,
            &format!("Command `{}` was accepted but never reached the VCS", nonce),
        );
        ctx.say(MessageType::Hint, &format!("Replay it with `--nonce {}`", nonce));
    }
    if report.state.drift {
        ctx.say(MessageType::Warn, "HEAD moved outside stem");
    }
    Ok(())
}

fn handle_doctor(ctx: &Context, engine: &StemEngine) -> Result<(), StemError> {
    let report = engine.doctor()?;

    if ctx.json {
        ctx.print_json(&report);
        return Ok(());
    }

    println!("{}", ctx.style.section("DOCTOR"));
    println!(
        "{}",
        ctx.style.key_value(
            "Checked",
            &format!(
                "{}, {}",
                plural(report.branches_checked, "branch", "branches"),
                plural(report.leaves_checked, "leaf", "leaves")
            )
        )
    );
    println!();

    for finding in &report.findings {
        let msg_type = match finding.severity {
            Severity::Error => MessageType::Err,
            Severity::Warning => MessageType::Warn,
        };
        ctx.say(msg_type, &finding.message);
        match (finding.kind, &finding.nonce) {
            (FindingKind::PendingCommand, Some(nonce)) => {
                ctx.say(MessageType::Hint, &format!("Replay it with `--nonce {}`", nonce));
            }
            (FindingKind::Drift, _) => {
                ctx.say(MessageType::Hint, "Jump to a leaf to return to recorded history");
            }
            _ => {}
        }
    }

    let errors = report.error_count();
    if report.is_healthy() {
        ctx.say(MessageType::Ok, "No issues found");
    } else if errors > 0 {
        ctx.say(
            MessageType::Err,
            &format!(
                "{} found; recorded history refers to objects git no longer has",
                plural(errors, "error", "errors")
            ),
        );
    } else {
        ctx.say(
            MessageType::Warn,
            &format!("{} found", plural(report.findings.len(), "warning", "warnings")),
        );
    }
    Ok(())
}

fn handle_status(ctx: &Context, engine: &StemEngine) -> Result<(), StemError> {
    let report = engine.status()?;

    if ctx.json {
        ctx.print_json(&report);
        return Ok(());
    }

    let style = &ctx.style;
    println!("{}", style.section("STATUS"));
    println!();
    println!("  {}", style.key_value("Repository", &report.repo_root.display().to_string()));

    if !report.is_initialized {
        println!();
        ctx.say(MessageType::Hint, "Not initialized. Run `stem init`.");
        return Ok(());
    }

    let placeholder = &engine.config().watcher.placeholder_prompt;
    let current = match (report.current(), &report.current_prompt) {
        (Some(node), Some(prompt)) => format!(
            "{} {}",
            style.node(&node.to_string()),
            style.prompt(&truncate_str(first_line(prompt), PROMPT_WIDTH), prompt == placeholder)
        ),
        (Some(node), None) => style.node(&node.to_string()),
        _ => "(none)".to_string(),
    };
    println!("  {}", style.key_value("Current", &current));

    if let Some(state) = &report.state {
        let vcs = match (&state.vcs_branch, &state.head) {
            (Some(branch), Some(head)) => format!("{} @ {}", branch, style.commit(head)),
            (None, Some(head)) => format!("detached @ {}", style.commit(head)),
            _ => "(no commits)".to_string(),
        };
        println!("  {}", style.key_value("VCS", &vcs));
    }

    let watcher = match report.watcher.as_ref().and_then(|w| w.handle.as_ref()) {
        Some(handle) if report.watcher_alive() => format!("running (pid {})", handle.pid),
        _ => "stopped".to_string(),
    };
    println!("  {}", style.key_value("Watcher", &watcher));

    if let Some(last) = &report.last_command {
        println!(
            "  {}",
            style.key_value(
                "Last command",
                &format!(
                    "{} `{}` ({})",
                    last.command,
                    last.nonce,
                    format_relative_time(last.created_at, Utc::now())
                )
            )
        );
    }
    if report.queued > 0 {
        println!("  {}", style.key_value("Queued", &report.queued.to_string()));
    }
    if let Some(counts) = &report.counts {
        println!(
            "  {}",
            style.key_value(
                "History",
                &format!(
                    "{}, {}, {}",
                    plural(counts.branches, "branch", "branches"),
                    plural(counts.leaves, "leaf", "leaves"),
                    plural(counts.jumps, "jump", "jumps"),
                )
            )
        );
    }

    for node in &report.rolled_forward {
        ctx.say(
            MessageType::Info,
            &format!("Completed {} from its commit", style.node(&node.to_string())),
        );
    }
    if !report.pending.is_empty() {
        println!();
        for nonce in &report.pending {
            ctx.say(
                MessageType::Warn,
                &format!("Command `{}` is incomplete; replay it with `--nonce {}`", nonce, nonce),
            );
        }
    }
    if let Some(state) = &report.state {
        if state.drift {
            ctx.say(MessageType::Warn, "HEAD moved outside stem");
        }
        if state.current.is_some() && !state.at_tip {
            ctx.say(
                MessageType::Hint,
                "On a historical leaf. Saves are refused here; start a new branch to continue.",
            );
        }
    }
    Ok(())
}

fn handle_log(
    ctx: &Context,
    engine: &StemEngine,
    kinds: Vec<HistoryKind>,
    root: Option<String>,
    offset: usize,
    limit: Option<usize>,
) -> Result<(), StemError> {
    let mut query = HistoryQuery::new().with_kinds(kinds).with_offset(offset);
    if let Some(root) = root {
        query = query.with_root(root);
    }
    if let Some(limit) = limit {
        query = query.with_limit(limit);
    }

    let page = engine.query(&query)?;

    if ctx.json {
        ctx.print_json(&page);
        return Ok(());
    }

    if page.entries.is_empty() {
        ctx.say(MessageType::Info, "No history entries found.");
        return Ok(());
    }

    let style = &ctx.style;
    let placeholder = &engine.config().watcher.placeholder_prompt;
    let now = Utc::now();

    println!("{}", style.section("HISTORY"));
    println!();
    for entry in &page.entries {
        let when = format_relative_time(entry.created_at(), now);
        match entry {
            HistoryEntry::Branch(b) => {
                let fork = b
                    .forked_from
                    .as_ref()
                    .map(|f| format!(" from {}", f))
                    .unwrap_or_default();
                println!(
                    "  {:>12}  branch  {:<6} {} ({}{})",
                    when,
                    style.node(&b.branch_id),
                    style.prompt(&truncate_str(first_line(&b.prompt), PROMPT_WIDTH), false),
                    b.vcs_ref,
                    fork
                );
            }
            HistoryEntry::Leaf(l) => {
                println!(
                    "  {:>12}  leaf    {:<6} {} {}",
                    when,
                    style.node(&l.node().to_string()),
                    style.commit(&l.vcs_commit),
                    style.prompt(&truncate_str(first_line(&l.prompt), PROMPT_WIDTH), &l.prompt == placeholder)
                );
            }
            HistoryEntry::Jump(j) => {
                let path: Vec<String> = j.ancestry.iter().map(|n| n.to_string()).collect();
                println!(
                    "  {:>12}  jump    {:<6} via {}",
                    when,
                    style.node(&format!("{}/{}", j.branch_id, j.leaf_id)),
                    path.join(" <- ")
                );
            }
        }
    }

    if page.has_more() {
        println!();
        ctx.say(
            MessageType::Hint,
            &format!(
                "Showing {} of {}. Next page: --offset {}",
                page.entries.len(),
                page.total,
                page.offset + page.entries.len()
            ),
        );
    }
    Ok(())
}

fn handle_repos(ctx: &Context) -> Result<(), StemError> {
    let entries = Registry::open_default()?.list()?;

    if ctx.json {
        ctx.print_json(&entries);
        return Ok(());
    }

    if entries.is_empty() {
        ctx.say(MessageType::Info, "No repositories registered. Run `stem init` in one.");
        return Ok(());
    }
    println!("{}", ctx.style.section("REPOSITORIES"));
    println!();
    let now = Utc::now();
    for entry in &entries {
        println!(
            "  {}  (registered {})",
            ctx.style.node(&entry.repo_root.display().to_string()),
            format_relative_time(entry.registered_at, now)
        );
    }
    Ok(())
}
