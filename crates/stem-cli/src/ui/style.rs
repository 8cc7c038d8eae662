//! Message styling for CLI output.
//!
//! ## Message Types
//!
//! | Prefix | Meaning | Color |
//! |--------|---------|-------|
//! | `[ok]` | Success | Green |
//! | `[err]` | Error | Red |
//! | `[warn]` | Warning | Yellow |
//! | `[info]` | Information | Blue |
//! | `[hint]` | Suggestion | Cyan |
//! | `[skip]` | Skipped | Dim |

use owo_colors::OwoColorize;

use super::color::ColorMode;

/// Message severity/type for CLI output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Operation completed.
    Ok,
    /// Operation failed.
    Err,
    /// Operation succeeded with caveats.
    Warn,
    /// Neutral status.
    Info,
    /// Actionable next step.
    Hint,
    /// Nothing to do (duplicate nonce, empty queue).
    Skip,
}

impl MessageType {
    /// Returns the prefix text for this message type.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Ok => "[ok]",
            Self::Err => "[err]",
            Self::Warn => "[warn]",
            Self::Info => "[info]",
            Self::Hint => "[hint]",
            Self::Skip => "[skip]",
        }
    }
}

/// Styling for one CLI run.
#[derive(Debug, Clone)]
pub struct Style {
    color_mode: ColorMode,
}

impl Style {
    /// Create a Style with an explicit color mode.
    pub fn new(color_mode: ColorMode) -> Self {
        Self { color_mode }
    }

    /// Check if colors are enabled.
    pub fn colors_enabled(&self) -> bool {
        self.color_mode.is_enabled()
    }

    /// Format a message with a type prefix, e.g. `[ok] Saved b1/2`.
    pub fn message(&self, msg_type: MessageType, text: &str) -> String {
        let prefix = msg_type.prefix();
        if self.colors_enabled() {
            let colored_prefix = match msg_type {
                MessageType::Ok => prefix.green().to_string(),
                MessageType::Err => prefix.red().to_string(),
                MessageType::Warn => prefix.yellow().to_string(),
                MessageType::Info => prefix.blue().to_string(),
                MessageType::Hint => prefix.cyan().to_string(),
                MessageType::Skip => prefix.dimmed().to_string(),
            };
            format!("{} {}", colored_prefix, text)
        } else {
            format!("{} {}", prefix, text)
        }
    }

    /// Format a detail line indented under a message.
    pub fn message_detail(&self, label: &str, value: &str) -> String {
        format!("     {}: {}", label, value)
    }

    /// Format a section header.
    pub fn section(&self, title: &str) -> String {
        if self.colors_enabled() {
            title.bold().to_string()
        } else {
            title.to_string()
        }
    }

    /// Format an error with optional cause and hint lines.
    pub fn error_with_context(&self, msg: &str, cause: Option<&str>, hint: Option<&str>) -> String {
        let mut output = self.message(MessageType::Err, msg);

        if let Some(cause_text) = cause {
            output.push('\n');
            output.push_str(&format!("      Cause: {}", cause_text));
        }

        if let Some(hint_text) = hint {
            output.push('\n');
            output.push_str(&format!("      Hint: {}", hint_text));
        }

        output
    }

    /// Format a key-value pair.
    pub fn key_value(&self, key: &str, value: &str) -> String {
        if self.colors_enabled() {
            format!("{}: {}", key.dimmed(), value)
        } else {
            format!("{}: {}", key, value)
        }
    }

    /// Format a commit hash (first 8 chars, yellow).
    pub fn commit(&self, hash: &str) -> String {
        let short = hash.get(..8).unwrap_or(hash);
        if self.colors_enabled() {
            short.yellow().to_string()
        } else {
            short.to_string()
        }
    }

    /// Format a `branch/leaf` position (cyan).
    pub fn node(&self, node: &str) -> String {
        if self.colors_enabled() {
            node.cyan().to_string()
        } else {
            node.to_string()
        }
    }

    /// Format a quoted prompt (dimmed when it is the auto-checkpoint placeholder).
    pub fn prompt(&self, prompt: &str, placeholder: bool) -> String {
        let quoted = format!("\"{}\"", prompt);
        if placeholder && self.colors_enabled() {
            quoted.dimmed().to_string()
        } else {
            quoted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_prefix() {
        assert_eq!(MessageType::Ok.prefix(), "[ok]");
        assert_eq!(MessageType::Err.prefix(), "[err]");
        assert_eq!(MessageType::Skip.prefix(), "[skip]");
    }

    #[test]
    fn test_message_no_color() {
        let style = Style::new(ColorMode::Never);
        assert_eq!(style.message(MessageType::Ok, "Saved b1/2"), "[ok] Saved b1/2");
        assert_eq!(style.message_detail("Commit", "abc"), "     Commit: abc");
    }

    #[test]
    fn test_error_with_context() {
        let style = Style::new(ColorMode::Never);
        let output = style.error_with_context("Jump failed", Some("checkout"), Some("Re-run with --nonce n1"));
        assert!(output.starts_with("[err] Jump failed"));
        assert!(output.contains("Cause: checkout"));
        assert!(output.contains("Hint: Re-run with --nonce n1"));
    }

    #[test]
    fn test_commit_and_node() {
        let style = Style::new(ColorMode::Never);
        assert_eq!(style.commit("abc12345def67890"), "abc12345");
        assert_eq!(style.commit("abc"), "abc");
        assert_eq!(style.node("b1/2"), "b1/2");
        assert_eq!(style.prompt("auto-checkpoint", true), "\"auto-checkpoint\"");
    }
}
