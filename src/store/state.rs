//! Singleton state record
//!
//! Manages `state.json` — the versioned, process-wide record of
//! `{current_cycle, weights, next_cycle_directives}`. Every stage reads it;
//! only the publisher writes it, and only after a cycle's local commit
//! succeeds, so the record always reflects completed cycles only.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// The versioned singleton state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Monotonic document version, bumped on every commit
    #[serde(default)]
    pub version: u64,
    /// Highest successfully completed cycle
    pub current_cycle: u64,
    /// Tuning weights carried into the next cycle's stages
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Directives emitted by the final stage for the next cycle
    #[serde(default)]
    pub next_cycle_directives: Vec<String>,
}

impl StateRecord {
    /// A fresh record for a bootstrap environment with no history.
    #[must_use]
    pub fn bootstrap() -> Self {
        Self {
            version: 0,
            current_cycle: 0,
            weights: BTreeMap::new(),
            next_cycle_directives: Vec::new(),
        }
    }
}

/// Reads and (single-writer) commits the state record.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store targeting `<data_dir>/state.json`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join("state.json"),
        })
    }

    /// Read the current record.
    ///
    /// Returns `Ok(None)` when no record exists yet (fresh environment).
    /// An unreadable or unparsable record is `StateUnavailable` — distinct
    /// from absence, because silently defaulting over a corrupt record risks
    /// cycle-id collision.
    pub fn read(&self) -> Result<Option<StateRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| OrchestratorError::StateUnavailable {
                reason: format!("cannot read {}: {e}", self.path.display()),
            })?;
        let record =
            serde_json::from_str(&content).map_err(|e| OrchestratorError::StateUnavailable {
                reason: format!("cannot parse {}: {e}", self.path.display()),
            })?;
        Ok(Some(record))
    }

    /// Atomically commit a record (write to temp, then rename), bumping its version.
    pub fn commit(&self, record: &StateRecord) -> Result<StateRecord> {
        let mut next = record.clone();
        next.version = record.version + 1;

        let json = serde_json::to_string_pretty(&next)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.path)?;
        Ok(next)
    }

    /// Path of the underlying state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
