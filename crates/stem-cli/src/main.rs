//! # stem CLI
//!
//! Command-line interface for stem, navigable checkpoint history over git.
//!
//! This binary provides human- and agent-friendly access to `stem-core`.
//! Run `stem --help` for usage information.

mod cli;
pub mod ui;

use std::process::ExitCode;

fn main() -> ExitCode {
    cli::run()
}
