//! JSONL (JSON Lines) logging of stage execution history
//!
//! Provides append-only logging of per-stage outcomes to
//! `<data_dir>/run.jsonl`. Records are kept regardless of success or
//! failure so a post-mortem can reconstruct exactly what each run did.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

/// The outcome of a single stage invocation within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageOutcome {
    /// Cycle the stage ran in
    pub cycle: u64,
    /// Name of the stage
    pub stage: String,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
    /// Human-readable summary ("committed", "skipped: already exists", ...)
    pub outcome: String,
    /// Whether the stage ended in a committed artifact
    pub success: bool,
    /// Wall-clock duration in seconds (0 for skipped stages)
    pub duration_secs: u64,
    /// Items suppressed by the dedup filter, for item-bearing stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_count: Option<usize>,
    /// Items flagged recurring, for item-bearing stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_count: Option<usize>,
}

/// Append-only JSONL logger for stage execution history.
pub struct RunLogger {
    log_path: PathBuf,
}

impl RunLogger {
    /// Create a logger writing to `<data_dir>/run.jsonl`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        Ok(Self {
            log_path: data_dir.join("run.jsonl"),
        })
    }

    /// Append a stage outcome to the log.
    pub fn append(&self, outcome: &StageOutcome) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open log file: {}", self.log_path.display()))?;

        let json =
            serde_json::to_string(outcome).context("Failed to serialize stage outcome to JSON")?;
        writeln!(file, "{json}").context("Failed to write to log file")?;
        Ok(())
    }

    /// Read all stage outcomes, in chronological order.
    pub fn read_all(&self) -> Result<Vec<StageOutcome>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.log_path)
            .with_context(|| format!("Failed to read log file: {}", self.log_path.display()))?;

        let mut outcomes = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let outcome: StageOutcome = serde_json::from_str(line)
                .with_context(|| format!("Failed to parse line {} as JSON", line_num + 1))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Get the path to the log file
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}
