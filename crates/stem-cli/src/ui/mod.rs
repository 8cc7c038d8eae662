//! # CLI UI Module
//!
//! Consistent styling and formatting for stem CLI output.
//!
//! Human output uses prefixed, optionally colored lines; every command also
//! has a `--json` form for agents and scripts.
//!
//! ## Module Structure
//!
//! - `color`: Color mode detection and terminal capability checks
//! - `style`: Message types, prefixes, and styling functions
//! - `format`: Utility formatters (time, truncation)

pub mod color;
pub mod format;
pub mod style;

// Re-export main types for convenient access
pub use color::ColorMode;
pub use style::{MessageType, Style};
