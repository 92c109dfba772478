//! Pipeline configuration parser
//!
//! Parses `pipeline.toml` into the fixed, ordered stage list plus global
//! and publish settings. Stages are configuration, not runtime state —
//! defined once and reused every cycle.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Output schema kind the orchestrator expects from a stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageSchema {
    /// Payload is opaque bytes; the orchestrator only checks it was produced
    #[default]
    Opaque,
    /// Payload is a JSON list of graded items; dedup/suppression applies
    Items,
}

/// Global configuration shared across all stages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    /// Default wall-clock budget per capability invocation (default: 600s)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Default maximum external invocation turns per stage (default: 40)
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    /// How many prior cycles `find_recurring` looks back over (default: 5)
    #[serde(default = "default_lookback_cycles")]
    pub lookback_cycles: u64,
}

const fn default_timeout_secs() -> u64 {
    600
}

const fn default_max_turns() -> u32 {
    40
}

const fn default_lookback_cycles() -> u64 {
    5
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            default_max_turns: default_max_turns(),
            lookback_cycles: default_lookback_cycles(),
        }
    }
}

/// Publish settings: where the cycle is pushed, and how hard to retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishConfig {
    /// Command spawned to push the committed cycle to the shared remote.
    /// Empty means local-commit only (push is skipped, never retried).
    #[serde(default)]
    pub push_command: Vec<String>,
    /// Base delay before the first retry, in milliseconds (default: 500)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum push attempts including the first (default: 5)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

const fn default_retry_base_delay_ms() -> u64 {
    500
}

const fn default_retry_max_attempts() -> u32 {
    5
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            push_command: Vec::new(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

/// A single stage definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    /// Unique name for this stage; also the artifact key component
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Capability command: program followed by its arguments
    pub command: Vec<String>,
    /// Stage outputs required as inputs, resolved from the current cycle
    /// (or, after a legal skip, the latest prior key)
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Context-only inputs: resolved from the most recent prior cycle,
    /// silently omitted when no prior cycle produced them
    #[serde(default)]
    pub context_inputs: Vec<String>,
    /// Expected output schema kind
    #[serde(default)]
    pub schema: StageSchema,
    /// Per-stage turn budget override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Per-stage wall-clock budget override, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageConfig {
    /// Effective wall-clock budget for this stage.
    #[must_use]
    pub fn timeout(&self, global: &GlobalConfig) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(global.default_timeout_secs))
    }

    /// Effective turn budget for this stage.
    #[must_use]
    pub fn turn_budget(&self, global: &GlobalConfig) -> u32 {
        self.max_turns.unwrap_or(global.default_max_turns)
    }
}

/// Top-level pipeline configuration parsed from pipeline.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Global configuration
    #[serde(default)]
    pub global: GlobalConfig,
    /// Publish settings
    #[serde(default)]
    pub publish: PublishConfig,
    /// Ordered stage definitions
    #[serde(rename = "stage")]
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Parse a pipeline.toml file from a path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse pipeline.toml content from a string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse pipeline.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Find a stage by name
    #[must_use]
    pub fn get_stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The first stage in declared order — the raw-data-pull stage that
    /// `--skip-scan` targets.
    #[must_use]
    pub fn scan_stage(&self) -> &StageConfig {
        // validate() guarantees at least one stage
        &self.stages[0]
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("Pipeline must declare at least one stage");
        }

        // Check for duplicate and empty stage names
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                bail!("Stage name cannot be empty");
            }
            if !seen.insert(&stage.name) {
                bail!("Duplicate stage name: '{}'", stage.name);
            }
            if stage.command.is_empty() {
                bail!("Stage '{}' has an empty command", stage.name);
            }
        }

        // Inputs must reference earlier stages only: artifact hand-off is
        // strictly forward through the declared order
        let mut earlier: HashSet<&str> = HashSet::new();
        for stage in &self.stages {
            for input in &stage.inputs {
                if !earlier.contains(input.as_str()) {
                    bail!(
                        "Stage '{}' declares input '{}' which is not an earlier stage",
                        stage.name,
                        input
                    );
                }
            }
            earlier.insert(stage.name.as_str());
        }

        // Context inputs may reference any declared stage (they resolve to
        // prior cycles), but the name must exist
        let names: HashSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &self.stages {
            for input in &stage.context_inputs {
                if !names.contains(input.as_str()) {
                    bail!(
                        "Stage '{}' references unknown stage '{}' in context_inputs",
                        stage.name,
                        input
                    );
                }
            }
        }

        if self.publish.retry_max_attempts == 0 {
            bail!("publish.retry_max_attempts must be at least 1");
        }

        Ok(())
    }
}
