//! Cross-cycle dedup and suppression index
//!
//! Two append-only JSONL files back this module: `seen.jsonl` records every
//! item identity a completed stage has carried, keyed by cycle, and
//! `suppressions.jsonl` holds permanent suppression rules. Suppression
//! entries are never silently removed — retraction is its own logged entry
//! type — and additions only affect cycles that run after them, so each
//! cycle's output stays a pure function of the suppression set as it
//! existed at run time.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The unit of content a pipeline carries (a signal, an opportunity).
///
/// Identity is stable across cycles and is the only field the orchestrator
/// matches on; grade and provenance pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identity, independent of cycle
    pub identity: String,
    /// Numeric grade/score assigned by a grading stage
    pub grade: f64,
    /// References to the artifacts this item appeared in
    #[serde(default)]
    pub provenance: Vec<String>,
    /// Set when the identity appeared in a prior cycle within the lookback
    #[serde(default)]
    pub recurring: bool,
}

/// Matching form of a suppression pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionPattern {
    /// Identity equals the value exactly
    Exact(String),
    /// Identity starts with the value
    Prefix(String),
    /// Identity contains the value
    Substring(String),
}

impl SuppressionPattern {
    /// Whether a (case-normalized) identity matches this pattern.
    #[must_use]
    pub fn matches(&self, identity: &str) -> bool {
        let identity = identity.to_lowercase();
        match self {
            Self::Exact(v) => identity == v.to_lowercase(),
            Self::Prefix(v) => identity.starts_with(&v.to_lowercase()),
            Self::Substring(v) => identity.contains(&v.to_lowercase()),
        }
    }
}

/// One permanent suppression rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    /// The pattern to exclude
    pub pattern: SuppressionPattern,
    /// Why it was suppressed
    pub reason: String,
    /// When the rule was added
    pub added_at: DateTime<Utc>,
}

/// One line of `suppressions.jsonl`: an addition or an explicit retraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum SuppressionOp {
    /// Add a suppression rule
    Add(SuppressionEntry),
    /// Retract a previously added rule (explicit, logged; never silent)
    Retract {
        pattern: SuppressionPattern,
        reason: String,
        retracted_at: DateTime<Utc>,
    },
}

/// The effective suppression set at a point in time.
#[derive(Debug, Clone, Default)]
pub struct SuppressionSet {
    entries: Vec<SuppressionEntry>,
}

impl SuppressionSet {
    /// The active entries, in addition order.
    #[must_use]
    pub fn entries(&self) -> &[SuppressionEntry] {
        &self.entries
    }

    /// Whether any active pattern matches the identity.
    #[must_use]
    pub fn is_suppressed(&self, identity: &str) -> bool {
        self.entries.iter().any(|e| e.pattern.matches(identity))
    }

    /// Partition items into (kept, suppressed).
    #[must_use]
    pub fn filter(&self, items: Vec<Item>) -> (Vec<Item>, Vec<Item>) {
        items
            .into_iter()
            .partition(|item| !self.is_suppressed(&item.identity))
    }
}

/// One line of `seen.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeenRecord {
    cycle: u64,
    identity: String,
    timestamp: DateTime<Utc>,
}

/// Append-only index of seen identities and suppression rules.
pub struct DedupIndex {
    seen_path: PathBuf,
    suppressions_path: PathBuf,
}

impl DedupIndex {
    /// Open (creating the directory if needed) an index under `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            seen_path: data_dir.join("seen.jsonl"),
            suppressions_path: data_dir.join("suppressions.jsonl"),
        })
    }

    /// Load the effective suppression set (additions minus explicit retractions).
    pub fn suppression_set(&self) -> Result<SuppressionSet> {
        let mut entries: Vec<SuppressionEntry> = Vec::new();
        for op in self.read_ops()? {
            match op {
                SuppressionOp::Add(entry) => entries.push(entry),
                SuppressionOp::Retract { pattern, .. } => {
                    entries.retain(|e| e.pattern != pattern);
                }
            }
        }
        Ok(SuppressionSet { entries })
    }

    /// Append a suppression rule. Takes effect starting the next cycle.
    pub fn add_suppression(&self, pattern: SuppressionPattern, reason: &str) -> Result<()> {
        self.append_op(&SuppressionOp::Add(SuppressionEntry {
            pattern,
            reason: reason.to_string(),
            added_at: Utc::now(),
        }))
    }

    /// Explicitly retract a rule. The retraction itself is a logged entry;
    /// the original addition stays in the file for audit.
    pub fn retract_suppression(&self, pattern: SuppressionPattern, reason: &str) -> Result<()> {
        self.append_op(&SuppressionOp::Retract {
            pattern,
            reason: reason.to_string(),
            retracted_at: Utc::now(),
        })
    }

    /// Record the identities of `items` as seen in `cycle`.
    pub fn register_seen(&self, cycle: u64, items: &[Item]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.seen_path)?;
        let now = Utc::now();
        for item in items {
            let record = SeenRecord {
                cycle,
                identity: item.identity.to_lowercase(),
                timestamp: now,
            };
            let json = serde_json::to_string(&record)?;
            writeln!(file, "{json}")?;
        }
        Ok(())
    }

    /// Identities among `items` that were registered in a cycle within
    /// `[cycle - lookback, cycle)`.
    pub fn find_recurring(
        &self,
        cycle: u64,
        lookback: u64,
        items: &[Item],
    ) -> Result<HashSet<String>> {
        let floor = cycle.saturating_sub(lookback);
        let mut prior: HashSet<String> = HashSet::new();
        if self.seen_path.exists() {
            let content = fs::read_to_string(&self.seen_path)?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let record: SeenRecord = serde_json::from_str(line)?;
                if record.cycle >= floor && record.cycle < cycle {
                    prior.insert(record.identity);
                }
            }
        }
        Ok(items
            .iter()
            .map(|i| i.identity.to_lowercase())
            .filter(|id| prior.contains(id))
            .collect())
    }

    fn read_ops(&self) -> Result<Vec<SuppressionOp>> {
        if !self.suppressions_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.suppressions_path)?;
        let mut ops = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            ops.push(serde_json::from_str(line)?);
        }
        Ok(ops)
    }

    fn append_op(&self, op: &SuppressionOp) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.suppressions_path)?;
        let json = serde_json::to_string(op)?;
        writeln!(file, "{json}")?;
        Ok(())
    }
}
