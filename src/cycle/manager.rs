//! Cycle identity resolution and run exclusivity
//!
//! Resolves the cycle number for a run — explicit override, or
//! auto-increment from the state store — and guards against two
//! orchestrator instances running against the same data directory at once
//! via a date-keyed lock file. Resolution only *proposes* an id; nothing is
//! committed until the publisher advances the state store.

use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::store::state::StateStore;

/// Documented default cycle id used when no state record exists at all.
/// Bootstrap convenience only; reached exclusively through the loudly
/// logged degraded path in `resolve_cycle`.
pub const BOOTSTRAP_CYCLE: u64 = 1;

/// Lifecycle status of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleStatus {
    /// Stages are still running (or the process died mid-run)
    InProgress,
    /// Locally committed and pushed to the remote
    Complete,
    /// Locally committed but the push exhausted its retries
    CompleteUnpublished,
    /// A fatal error ended the run before the local commit
    Aborted,
}

/// One end-to-end run of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Monotonically increasing identifier, immutable once assigned
    pub id: u64,
    /// The run date all of this cycle's artifacts are keyed under
    pub run_date: NaiveDate,
    /// Current lifecycle status
    pub status: CycleStatus,
}

impl Cycle {
    /// Create a new in-progress cycle.
    #[must_use]
    pub const fn new(id: u64, run_date: NaiveDate) -> Self {
        Self {
            id,
            run_date,
            status: CycleStatus::InProgress,
        }
    }
}

/// Resolves cycle identity and holds the run lock.
pub struct CycleManager<'a> {
    state: &'a StateStore,
}

impl<'a> CycleManager<'a> {
    /// Create a manager reading from the given state store.
    #[must_use]
    pub const fn new(state: &'a StateStore) -> Self {
        Self { state }
    }

    /// Resolve the cycle id for this run.
    ///
    /// An explicit override is used verbatim (replay/backfill). Otherwise
    /// the state store's `current_cycle + 1` is proposed. A fresh
    /// environment with no state record at all falls back to
    /// [`BOOTSTRAP_CYCLE`] with a loud warning; an unreadable or corrupt
    /// record is `StateUnavailable` and fatal without an override, since
    /// silently defaulting over it risks cycle-id collision.
    pub fn resolve_cycle(&self, explicit_override: Option<u64>, run_date: NaiveDate) -> Result<Cycle> {
        if let Some(id) = explicit_override {
            return Ok(Cycle::new(id, run_date));
        }

        match self.state.read() {
            Ok(Some(record)) => Ok(Cycle::new(record.current_cycle + 1, run_date)),
            Ok(None) => {
                eprintln!(
                    "{} no state record found; starting at default cycle {} (bootstrap mode). \
                     Pass --cycle to override.",
                    "WARNING:".yellow().bold(),
                    BOOTSTRAP_CYCLE
                );
                Ok(Cycle::new(BOOTSTRAP_CYCLE, run_date))
            }
            Err(err) => Err(err),
        }
    }
}

/// Exclusive run lock keyed by run-date.
///
/// Created with `create_new` so acquisition fails if another orchestrator
/// instance holds the lock for the same data directory. Released on drop,
/// so a normal exit (success or fatal error) always frees it; a killed
/// process leaves the file behind for the operator to inspect.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Try to acquire the lock for `run_date` under `data_dir`.
    pub fn acquire(data_dir: &Path, run_date: NaiveDate) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("run-{run_date}.lock"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "pid {}", std::process::id())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                Err(OrchestratorError::RunLockHeld(format!(
                    "{} ({})",
                    path.display(),
                    holder.trim()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
