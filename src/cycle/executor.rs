//! Stage pipeline executor
//!
//! Runs the configured stage list strictly in declared order for one cycle.
//! Each stage gets its declared inputs (current-cycle keys first, most
//! recent prior keys as fallback), the invocation context, and a bounded
//! budget; its single output is committed to the artifact store atomically,
//! exactly once. Any stage failure aborts the remainder of the pipeline so
//! a partial cycle is never mistaken for a complete one.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, InvocationRequest};
use crate::cycle::config::{PipelineConfig, StageConfig, StageSchema};
use crate::cycle::manager::Cycle;
use crate::error::{OrchestratorError, Result};
use crate::log::{self, RunLogger, StageOutcome};
use crate::store::artifact::{ArtifactKey, ArtifactStore};
use crate::store::dedup::{DedupIndex, Item, SuppressionEntry, SuppressionSet};
use crate::store::state::StateRecord;

/// Context handed to every capability invocation, serialized to a file.
#[derive(Debug, Serialize)]
struct InvocationContext<'a> {
    cycle: u64,
    date: String,
    weights: &'a BTreeMap<String, f64>,
    suppressions: &'a [SuppressionEntry],
    directives: &'a [String],
}

/// Next-cycle directives a final stage may emit through its directives file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NextCycleDirectives {
    /// Free-form directives for the next cycle
    #[serde(default)]
    pub directives: Vec<String>,
    /// Weight adjustments, merged key-by-key into the state record
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

/// Result of a full pipeline run for one cycle.
#[derive(Debug)]
pub struct PipelineResult {
    /// Stages that actually invoked their capability this run
    pub executed: Vec<String>,
    /// Stages bypassed (already committed, or a legal skip)
    pub skipped: Vec<String>,
    /// Directives emitted by the final stage, if it ran and wrote any
    pub directives: NextCycleDirectives,
}

/// Executes the fixed stage pipeline for one cycle.
pub struct PipelineExecutor<'a> {
    config: &'a PipelineConfig,
    artifacts: &'a ArtifactStore,
    dedup: &'a DedupIndex,
    capability: &'a dyn Capability,
    logger: &'a RunLogger,
    scratch_dir: PathBuf,
    logs_dir: PathBuf,
}

impl<'a> PipelineExecutor<'a> {
    /// Create an executor over the given stores and capability.
    ///
    /// `data_dir` hosts the per-invocation scratch files (context,
    /// directives) and the preserved stderr logs.
    pub fn new(
        config: &'a PipelineConfig,
        artifacts: &'a ArtifactStore,
        dedup: &'a DedupIndex,
        capability: &'a dyn Capability,
        logger: &'a RunLogger,
        data_dir: &std::path::Path,
    ) -> Self {
        Self {
            config,
            artifacts,
            dedup,
            capability,
            logger,
            scratch_dir: data_dir.join("tmp"),
            logs_dir: data_dir.join("logs"),
        }
    }

    /// Run all stages in declared order for `cycle`.
    ///
    /// `skip_set` names stages whose execution was bypassed from the CLI
    /// (e.g. `--skip-scan`); a bypass is refused unless the stage's output
    /// already exists for the run-date or earlier. Stages whose output is
    /// already committed for this exact (date, cycle) are always skipped —
    /// that is what makes a restart after a crash an idempotent resume.
    pub async fn run(
        &self,
        cycle: &Cycle,
        skip_set: &HashSet<String>,
        state: &StateRecord,
        suppression: &SuppressionSet,
    ) -> Result<PipelineResult> {
        let mut executed = Vec::new();
        let mut skipped = Vec::new();
        let mut directives = NextCycleDirectives::default();
        let last_stage = &self.config.stages[self.config.stages.len() - 1].name;

        for stage in &self.config.stages {
            let key = ArtifactKey::new(cycle.run_date, cycle.id, &stage.name);

            if self.artifacts.exists(&key) {
                log::status_line(&stage.name, "output already committed, skipping");
                self.log_skip(cycle, stage, "skipped: already committed")?;
                if stage.name == *last_stage {
                    // A resume can land here after the final stage committed
                    // but before publish; its directives file still holds
                    // what it emitted and must reach the publisher.
                    directives = read_directives(&self.directives_path_for(stage))?;
                }
                skipped.push(stage.name.clone());
                continue;
            }

            if skip_set.contains(&stage.name) {
                let Some(prior) = self
                    .artifacts
                    .latest_at_or_before(&stage.name, cycle.run_date)
                else {
                    return Err(OrchestratorError::PrerequisiteMissing {
                        stage: stage.name.clone(),
                        detail: format!(
                            "skip requested but no committed artifact exists at or before {}",
                            cycle.run_date
                        ),
                    });
                };
                log::status_line(&stage.name, &format!("bypassed, reusing {prior}"));
                self.log_skip(cycle, stage, &format!("skipped: reusing {prior}"))?;
                skipped.push(stage.name.clone());
                continue;
            }

            let outcome = self.run_stage(cycle, stage, state, suppression).await;
            match outcome {
                Ok(stage_directives) => {
                    if stage.name == *last_stage {
                        directives = stage_directives;
                    }
                    executed.push(stage.name.clone());
                }
                Err(err) => {
                    // Preserve the failure in the run log before aborting.
                    // A log-write failure must not mask the stage error.
                    if let Err(log_err) = self.logger.append(&StageOutcome {
                        cycle: cycle.id,
                        stage: stage.name.clone(),
                        timestamp: chrono::Utc::now(),
                        outcome: err.to_string(),
                        success: false,
                        duration_secs: 0,
                        suppressed_count: None,
                        recurring_count: None,
                    }) {
                        log::warn_line(&format!(
                            "failed to record stage failure in run log: {log_err}"
                        ));
                    }
                    return Err(err);
                }
            }
        }

        Ok(PipelineResult {
            executed,
            skipped,
            directives,
        })
    }

    /// Execute one stage: resolve inputs, invoke the capability within
    /// budget, post-process item-bearing payloads, and commit the artifact.
    async fn run_stage(
        &self,
        cycle: &Cycle,
        stage: &StageConfig,
        state: &StateRecord,
        suppression: &SuppressionSet,
    ) -> Result<NextCycleDirectives> {
        let key = ArtifactKey::new(cycle.run_date, cycle.id, &stage.name);
        log::status_line(&stage.name, &stage.description);

        let inputs = self.resolve_inputs(cycle, stage)?;
        let (context_path, directives_path) =
            self.write_invocation_files(cycle, stage, state, suppression)?;

        let request = InvocationRequest {
            stage: stage.name.clone(),
            cycle: cycle.id,
            date: cycle.run_date,
            command: stage.command.clone(),
            inputs,
            context_path,
            directives_path: directives_path.clone(),
            max_turns: stage.turn_budget(&self.config.global),
            timeout: stage.timeout(&self.config.global),
            log_path: self.logs_dir.join(format!(
                "{}-cycle-{}-{}.log",
                cycle.run_date, cycle.id, stage.name
            )),
        };

        let output = self.capability.invoke(&request).await?;
        if output.payload.is_empty() {
            return Err(OrchestratorError::StageFailure {
                stage: stage.name.clone(),
                reason: "produced empty output".to_string(),
            });
        }

        let (payload, suppressed_count, recurring_count) = match stage.schema {
            StageSchema::Opaque => (output.payload, None, None),
            StageSchema::Items => {
                let (payload, suppressed, recurring) =
                    self.process_items(cycle, stage, &output.payload, suppression)?;
                (payload, Some(suppressed), Some(recurring))
            }
        };

        self.artifacts.put(&key, &payload)?;

        let directives = read_directives(&directives_path)?;

        log::status_line(
            &stage.name,
            &format!("committed {key} in {}s", output.duration_secs),
        );
        self.logger
            .append(&StageOutcome {
                cycle: cycle.id,
                stage: stage.name.clone(),
                timestamp: chrono::Utc::now(),
                outcome: format!("committed {key}"),
                success: true,
                duration_secs: output.duration_secs,
                suppressed_count,
                recurring_count,
            })
            .map_err(|e| OrchestratorError::StageFailure {
                stage: stage.name.clone(),
                reason: format!("failed to write run log: {e}"),
            })?;

        Ok(directives)
    }

    /// Resolve a stage's declared inputs to on-disk artifact paths.
    ///
    /// Required inputs prefer the current cycle's key and fall back to the
    /// most recent prior key (covers legally skipped predecessors); a
    /// required input with no artifact anywhere is `PrerequisiteMissing`.
    /// Context-only inputs resolve the same way but are omitted when
    /// nothing exists yet (first cycle has no prior signals).
    fn resolve_inputs(
        &self,
        cycle: &Cycle,
        stage: &StageConfig,
    ) -> Result<Vec<(String, PathBuf)>> {
        let mut resolved = Vec::new();

        for input in &stage.inputs {
            match self.resolve_one(cycle, input) {
                Some(key) => resolved.push((input.clone(), self.artifacts.path_for(&key))),
                None => {
                    return Err(OrchestratorError::PrerequisiteMissing {
                        stage: stage.name.clone(),
                        detail: format!("required input '{input}' has no committed artifact"),
                    })
                }
            }
        }

        for input in &stage.context_inputs {
            if let Some(key) = self.resolve_one(cycle, input) {
                resolved.push((input.clone(), self.artifacts.path_for(&key)));
            }
        }

        Ok(resolved)
    }

    fn resolve_one(&self, cycle: &Cycle, input: &str) -> Option<ArtifactKey> {
        let current = ArtifactKey::new(cycle.run_date, cycle.id, input);
        if self.artifacts.exists(&current) {
            return Some(current);
        }
        self.artifacts
            .latest_prior(input, cycle.run_date, cycle.id)
    }

    /// Write the per-invocation context file and clear any stale directives
    /// file, returning both paths.
    fn write_invocation_files(
        &self,
        cycle: &Cycle,
        stage: &StageConfig,
        state: &StateRecord,
        suppression: &SuppressionSet,
    ) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(&self.scratch_dir)?;

        let context = InvocationContext {
            cycle: cycle.id,
            date: cycle.run_date.to_string(),
            weights: &state.weights,
            suppressions: suppression.entries(),
            directives: &state.next_cycle_directives,
        };
        let context_path = self.scratch_dir.join(format!("{}-context.json", stage.name));
        fs::write(&context_path, serde_json::to_vec_pretty(&context)?)?;

        let directives_path = self.directives_path_for(stage);
        if directives_path.exists() {
            fs::remove_file(&directives_path)?;
        }

        Ok((context_path, directives_path))
    }

    fn directives_path_for(&self, stage: &StageConfig) -> PathBuf {
        self.scratch_dir
            .join(format!("{}-directives.json", stage.name))
    }

    /// Post-process an item-bearing payload: parse the graded-items schema,
    /// drop suppressed identities, flag recurring ones, and register the
    /// kept identities for future-cycle recurrence detection.
    fn process_items(
        &self,
        cycle: &Cycle,
        stage: &StageConfig,
        payload: &[u8],
        suppression: &SuppressionSet,
    ) -> Result<(Vec<u8>, usize, usize)> {
        let items: Vec<Item> =
            serde_json::from_slice(payload).map_err(|e| OrchestratorError::StageFailure {
                stage: stage.name.clone(),
                reason: format!("output does not parse as a graded-items list: {e}"),
            })?;

        let (mut kept, suppressed) = suppression.filter(items);
        if !suppressed.is_empty() {
            log::status_line(
                &stage.name,
                &format!("suppressed {} item(s)", suppressed.len()),
            );
        }

        let recurring =
            self.dedup
                .find_recurring(cycle.id, self.config.global.lookback_cycles, &kept)?;
        for item in &mut kept {
            item.recurring = recurring.contains(&item.identity.to_lowercase());
        }

        self.dedup.register_seen(cycle.id, &kept)?;

        let payload = serde_json::to_vec_pretty(&kept)?;
        Ok((payload, suppressed.len(), recurring.len()))
    }

    fn log_skip(&self, cycle: &Cycle, stage: &StageConfig, outcome: &str) -> Result<()> {
        self.logger
            .append(&StageOutcome {
                cycle: cycle.id,
                stage: stage.name.clone(),
                timestamp: chrono::Utc::now(),
                outcome: outcome.to_string(),
                success: true,
                duration_secs: 0,
                suppressed_count: None,
                recurring_count: None,
            })
            .map_err(|e| OrchestratorError::StageFailure {
                stage: stage.name.clone(),
                reason: format!("failed to write run log: {e}"),
            })
    }
}

/// Read a directives file written by a stage, if any.
fn read_directives(path: &std::path::Path) -> Result<NextCycleDirectives> {
    if !path.exists() {
        return Ok(NextCycleDirectives::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
