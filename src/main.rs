//! Cadence - Research-cycle pipeline orchestrator
//!
//! CLI entry point for the Cadence orchestrator.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;

use cadence::cycle::manager::{CycleManager, CycleStatus, RunLock};
use cadence::error::OrchestratorError;
use cadence::log::{fatal_line, status_line, warn_line};
use cadence::publish::{CommandRemote, Publisher, Remote, RetryPolicy};
use cadence::store::state::StateRecord;
use cadence::{
    ArtifactStore, CommandCapability, DedupIndex, PipelineConfig, PipelineExecutor, RunLogger,
    StateStore,
};

/// Research-cycle pipeline orchestrator
///
/// Runs the configured stage pipeline for one cycle: pulls raw data,
/// hands artifacts from stage to stage, applies cross-cycle suppression,
/// and publishes the completed cycle with bounded push retries.
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Cycle number override (replay/backfill); auto-incremented otherwise
    #[arg(long)]
    cycle: Option<u64>,

    /// Bypass the raw-data-pull stage, reusing an existing artifact
    #[arg(long)]
    skip_scan: bool,

    /// Run date (YYYY-MM-DD); defaults to today (UTC)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Path to the pipeline.toml configuration file
    #[arg(long, default_value = "pipeline.toml")]
    config: PathBuf,

    /// Directory for persisted state, artifacts, and logs
    #[arg(long, default_value = ".cadence")]
    data_dir: PathBuf,
}

/// Component name to blame in the final log line for errors that carry no
/// stage of their own.
fn offending_stage(err: &OrchestratorError) -> String {
    match err {
        OrchestratorError::PrerequisiteMissing { stage, .. }
        | OrchestratorError::StageFailure { stage, .. } => stage.clone(),
        OrchestratorError::StateUnavailable { .. } | OrchestratorError::RunLockHeld(_) => {
            "cycle-manager".to_string()
        }
        OrchestratorError::PublishPushFailure { .. } => "publish".to_string(),
        _ => "orchestrator".to_string(),
    }
}

/// Print the final fatal line and exit non-zero.
fn die(err: &OrchestratorError) -> ! {
    fatal_line(&offending_stage(err), err.kind(), &err.to_string());
    std::process::exit(1);
}

/// Read the state record for the executor's context, tolerating an
/// unreadable record only when an explicit cycle override was given.
fn load_state_record(state: &StateStore, has_override: bool) -> Result<StateRecord> {
    match state.read() {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Ok(StateRecord::bootstrap()),
        Err(err) if has_override => {
            warn_line(&format!(
                "state record unreadable ({err}); running from an empty record \
                 because --cycle was given"
            ));
            Ok(StateRecord::bootstrap())
        }
        Err(err) => {
            die(&err);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let run_date = cli
        .date
        .unwrap_or_else(|| chrono::Utc::now().date_naive());

    // Load configuration
    let config = PipelineConfig::from_path(&cli.config)
        .with_context(|| format!("Failed to load config from '{}'", cli.config.display()))?;

    // Open the persisted collections
    let artifacts = ArtifactStore::new(cli.data_dir.join("artifacts")).unwrap_or_else(|e| die(&e));
    let state = StateStore::new(&cli.data_dir).unwrap_or_else(|e| die(&e));
    let dedup = DedupIndex::new(&cli.data_dir).unwrap_or_else(|e| die(&e));
    let logger = RunLogger::new(&cli.data_dir).context("Failed to initialize run log")?;

    // Resolve the cycle and take the exclusivity lock before any work
    let manager = CycleManager::new(&state);
    let cycle = manager
        .resolve_cycle(cli.cycle, run_date)
        .unwrap_or_else(|e| die(&e));
    let _lock = RunLock::acquire(&cli.data_dir, run_date).unwrap_or_else(|e| die(&e));

    status_line(
        "cycle",
        &format!("starting cycle {} for {}", cycle.id, cycle.run_date),
    );

    let state_record = load_state_record(&state, cli.cycle.is_some())?;
    let suppression = dedup.suppression_set().unwrap_or_else(|e| die(&e));

    // Run the stage pipeline, fail-fast
    let skip_set: HashSet<String> = if cli.skip_scan {
        [config.scan_stage().name.clone()].into()
    } else {
        HashSet::new()
    };
    let capability = CommandCapability::new();
    let executor = PipelineExecutor::new(
        &config,
        &artifacts,
        &dedup,
        &capability,
        &logger,
        &cli.data_dir,
    );
    let result = executor
        .run(&cycle, &skip_set, &state_record, &suppression)
        .await
        .unwrap_or_else(|e| die(&e));

    // Publish: local commit, state advance, best-effort push
    let policy = RetryPolicy::from_config(&config.publish);
    let publisher = Publisher::new(&artifacts, &state, &cli.data_dir, policy)
        .unwrap_or_else(|e| die(&e));
    let remote = (!config.publish.push_command.is_empty())
        .then(|| CommandRemote::new(config.publish.push_command.clone()));
    let stage_names: Vec<String> = config.stages.iter().map(|s| s.name.clone()).collect();
    let publish_result = publisher
        .publish(
            &cycle,
            &stage_names,
            &state_record,
            &result.directives,
            remote.as_ref().map(|r| r as &dyn Remote),
        )
        .await
        .unwrap_or_else(|e| die(&e));

    match publish_result.status {
        CycleStatus::CompleteUnpublished => {
            warn_line(&format!(
                "cycle {} complete-unpublished: {} stage(s) executed, {} skipped; \
                 push must be retried manually",
                cycle.id,
                result.executed.len(),
                result.skipped.len()
            ));
        }
        _ => {
            status_line(
                "cycle",
                &format!(
                    "cycle {} complete: {} stage(s) executed, {} skipped",
                    cycle.id,
                    result.executed.len(),
                    result.skipped.len()
                ),
            );
        }
    }

    Ok(())
}
