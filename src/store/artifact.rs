//! Write-once artifact store
//!
//! Stores each stage's output under `<root>/<date>/cycle-<N>/<stage>.out`.
//! Keys are namespaced by run-date and cycle so replayed or backfilled runs
//! never collide. A `put` lands on a temp path and is renamed into place, so
//! a partially written artifact is never visible to downstream stages.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::{OrchestratorError, Result};

/// Extension used for committed artifact files.
const ARTIFACT_EXT: &str = "out";

/// Key identifying one artifact: (run-date, cycle, stage-name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    /// Run date the artifact belongs to
    pub date: NaiveDate,
    /// Cycle number the artifact belongs to
    pub cycle: u64,
    /// Name of the stage that produced it
    pub stage: String,
}

impl ArtifactKey {
    /// Create a key for the given date, cycle, and stage.
    #[must_use]
    pub fn new(date: NaiveDate, cycle: u64, stage: &str) -> Self {
        Self {
            date,
            cycle,
            stage: stage.to_string(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/cycle-{}/{}", self.date, self.cycle, self.stage)
    }
}

/// Append-only, write-once store of per-cycle artifacts.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) an artifact store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Filesystem path for a committed artifact.
    #[must_use]
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.date.to_string())
            .join(format!("cycle-{}", key.cycle))
            .join(format!("{}.{ARTIFACT_EXT}", key.stage))
    }

    /// Whether a committed artifact exists at `key`.
    #[must_use]
    pub fn exists(&self, key: &ArtifactKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Commit a payload at `key`, exactly once.
    ///
    /// Writes to a temp path in the same directory and renames into place.
    /// Fails with `DuplicateArtifact` if the key already holds a committed
    /// artifact; the original payload is left untouched.
    pub fn put(&self, key: &ArtifactKey, payload: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            return Err(OrchestratorError::DuplicateArtifact {
                key: key.to_string(),
            });
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tmp = path.with_extension(format!("{ARTIFACT_EXT}.tmp"));
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read the committed payload at `key`.
    pub fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Err(OrchestratorError::ArtifactNotFound {
                key: key.to_string(),
            });
        }
        Ok(fs::read(path)?)
    }

    /// Find the most recent committed artifact for `stage` strictly before
    /// the given (date, cycle) position.
    ///
    /// Used to resolve context-only inputs (e.g. the prior cycle's signals
    /// for dedup) when the current cycle has not produced the stage yet.
    #[must_use]
    pub fn latest_prior(&self, stage: &str, date: NaiveDate, cycle: u64) -> Option<ArtifactKey> {
        self.keys_for_stage(stage)
            .into_iter()
            .filter(|k| (k.date, k.cycle) < (date, cycle))
            .max_by_key(|k| (k.date, k.cycle))
    }

    /// Find the most recent committed artifact for `stage` at or before `date`,
    /// in any cycle.
    ///
    /// This is the existence check behind `--skip-scan`: a bypass is only
    /// legal when the stage's output is already on disk for the run-date or
    /// an earlier one.
    #[must_use]
    pub fn latest_at_or_before(&self, stage: &str, date: NaiveDate) -> Option<ArtifactKey> {
        self.keys_for_stage(stage)
            .into_iter()
            .filter(|k| k.date <= date)
            .max_by_key(|k| (k.date, k.cycle))
    }

    /// Enumerate all committed keys for one stage across all dates and cycles.
    fn keys_for_stage(&self, stage: &str) -> Vec<ArtifactKey> {
        let mut keys = Vec::new();
        let Ok(dates) = fs::read_dir(&self.root) else {
            return keys;
        };
        for date_entry in dates.flatten() {
            let Some(date) = date_entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<NaiveDate>().ok())
            else {
                continue;
            };
            let Ok(cycles) = fs::read_dir(date_entry.path()) else {
                continue;
            };
            for cycle_entry in cycles.flatten() {
                let Some(cycle) = cycle_entry
                    .file_name()
                    .to_str()
                    .and_then(|s| s.strip_prefix("cycle-"))
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                let key = ArtifactKey::new(date, cycle, stage);
                if self.exists(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}
