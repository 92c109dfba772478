//! Logging and observability
//!
//! Timestamped status lines on stderr for the operator, and an append-only
//! JSONL record of every stage invocation for post-mortem analysis.

pub mod jsonl;

pub use jsonl::{RunLogger, StageOutcome};

use colored::Colorize;

/// Print a timestamped per-stage status line to stderr.
pub fn status_line(stage: &str, message: &str) {
    eprintln!(
        "{} {} {}",
        chrono::Utc::now().format("%H:%M:%S").to_string().dimmed(),
        format!("[{stage}]").bold().cyan(),
        message
    );
}

/// Print a loud warning line to stderr.
pub fn warn_line(message: &str) {
    eprintln!("{} {message}", "WARNING:".yellow().bold());
}

/// Print the final fatal line: offending stage name and error kind.
pub fn fatal_line(stage: &str, kind: &str, detail: &str) {
    eprintln!(
        "{} stage '{}' ({kind}): {detail}",
        "FATAL:".red().bold(),
        stage.bold()
    );
}
