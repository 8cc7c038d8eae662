//! Color mode detection for CLI output.
//!
//! Honors `NO_COLOR` (https://no-color.org/) and only colors a terminal.
//! Output meant for agents (`--json`) is never colored.

use std::io::IsTerminal;

use clap::ValueEnum;

/// Color output mode for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
    /// Always use colors, even when output is not a TTY.
    Always,
    /// Never use colors.
    Never,
    /// Color when stdout is a terminal and `NO_COLOR` is unset.
    #[default]
    Auto,
}

impl ColorMode {
    /// The effective mode for a run: JSON output disables color.
    pub fn for_output(self, json: bool) -> Self {
        if json {
            Self::Never
        } else {
            self
        }
    }

    /// Check if colors should be used based on current mode.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal(),
        }
    }
}
