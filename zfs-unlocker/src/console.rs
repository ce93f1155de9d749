//! Per-target console labeling.
//!
//! Several sessions log concurrently, so every record carries a `[host]`
//! label wrapped in one of a small palette of ANSI colors. Color assignment
//! is an index the orchestrator hands out at construction; there is no
//! global counter.

use std::fmt::Display;

use log::{debug, error, info, warn};

const COLORS: [&str; 5] = [
    "\x1b[34m", // blue
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[33m", // yellow
    "\x1b[31m", // red
];
const RESET: &str = "\x1b[0m";

/// Labeled, colored logging for one target.
#[derive(Debug, Clone)]
pub struct TargetLog {
    label: String,
    color: &'static str,
}

impl TargetLog {
    pub fn new(label: impl Into<String>, color_index: usize) -> Self {
        Self {
            label: label.into(),
            color: COLORS[color_index % COLORS.len()],
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn info(&self, message: impl Display) {
        info!("{}[{}]{} {}", self.color, self.label, RESET, message);
    }

    pub fn warn(&self, message: impl Display) {
        warn!("{}[{}]{} {}", self.color, self.label, RESET, message);
    }

    pub fn error(&self, message: impl Display) {
        error!("{}[{}]{} {}", self.color, self.label, RESET, message);
    }

    pub fn debug(&self, message: impl Display) {
        debug!("{}[{}]{} {}", self.color, self.label, RESET, message);
    }
}
