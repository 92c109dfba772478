#![allow(missing_docs)]

use std::collections::HashSet;

use tempfile::TempDir;

use cadence::cycle::manager::{Cycle, CycleManager, CycleStatus};
use cadence::publish::{Publisher, RetryPolicy};
use cadence::store::state::StateRecord;
use cadence::{
    ArtifactKey, ArtifactStore, CommandCapability, DedupIndex, Item, NextCycleDirectives,
    PipelineConfig, PipelineExecutor, RunLogger, StateStore, SuppressionPattern,
};

const CONFIG: &str = r#"
[global]
default_timeout_secs = 30
lookback_cycles = 5

[publish]
retry_base_delay_ms = 1
retry_max_attempts = 3

[[stage]]
name = "scan"
description = "Pull raw data"
command = ["sh", "-c", "printf 'source-a item-1\nsource-b item-2\n'"]

[[stage]]
name = "signals"
description = "Extract and grade signals"
command = ["sh", "-c", "printf '[{\"identity\":\"item-1\",\"grade\":0.8},{\"identity\":\"item-2\",\"grade\":0.4}]'"]
inputs = ["scan"]
context_inputs = ["signals"]
schema = "items"

[[stage]]
name = "digest"
description = "Write the cycle digest"
command = ["sh", "-c", "wc -l < \"$CADENCE_INPUT_SIGNALS\"; printf 'digest for cycle %s' \"$CADENCE_CYCLE\""]
inputs = ["signals"]
"#;

struct Env {
    tmp: TempDir,
    config: PipelineConfig,
}

impl Env {
    fn new() -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
            config: PipelineConfig::parse(CONFIG).unwrap(),
        }
    }

    fn artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(self.tmp.path().join("artifacts")).unwrap()
    }

    fn state(&self) -> StateStore {
        StateStore::new(self.tmp.path()).unwrap()
    }

    fn dedup(&self) -> DedupIndex {
        DedupIndex::new(self.tmp.path()).unwrap()
    }

    /// Run one full cycle end-to-end: resolve, execute, publish.
    async fn run_cycle(&self, skip_scan: bool) -> (Cycle, CycleStatus) {
        let state = self.state();
        let artifacts = self.artifacts();
        let dedup = self.dedup();
        let logger = RunLogger::new(self.tmp.path()).unwrap();
        let capability = CommandCapability::new();

        let manager = CycleManager::new(&state);
        let cycle = manager
            .resolve_cycle(None, "2026-08-28".parse().unwrap())
            .unwrap();

        let state_record = state.read().unwrap().unwrap_or_else(StateRecord::bootstrap);
        let suppression = dedup.suppression_set().unwrap();
        let skip: HashSet<String> = if skip_scan {
            [self.config.scan_stage().name.clone()].into()
        } else {
            HashSet::new()
        };

        let executor = PipelineExecutor::new(
            &self.config,
            &artifacts,
            &dedup,
            &capability,
            &logger,
            self.tmp.path(),
        );
        let result = executor
            .run(&cycle, &skip, &state_record, &suppression)
            .await
            .unwrap();

        let publisher = Publisher::new(
            &artifacts,
            &state,
            self.tmp.path(),
            RetryPolicy::from_config(&self.config.publish),
        )
        .unwrap();
        let stage_names: Vec<String> =
            self.config.stages.iter().map(|s| s.name.clone()).collect();
        let published = publisher
            .publish(&cycle, &stage_names, &state_record, &result.directives, None)
            .await
            .unwrap();

        (cycle, published.status)
    }
}

/// Full end-to-end run: all three stages commit, the cycle publishes, and
/// the state store advances.
#[tokio::test]
async fn test_first_cycle_end_to_end() {
    let env = Env::new();
    let (cycle, status) = env.run_cycle(false).await;

    assert_eq!(cycle.id, 1, "fresh environment starts at bootstrap cycle");
    assert_eq!(status, CycleStatus::Complete);

    let artifacts = env.artifacts();
    for stage in ["scan", "signals", "digest"] {
        assert!(
            artifacts.exists(&ArtifactKey::new(cycle.run_date, 1, stage)),
            "missing artifact for {stage}"
        );
    }

    assert_eq!(env.state().read().unwrap().unwrap().current_cycle, 1);
    assert!(env
        .tmp
        .path()
        .join("published/2026-08-28-cycle-1/manifest.json")
        .exists());
}

/// Resolving with no override after a successful cycle N returns N+1.
#[tokio::test]
async fn test_cycle_numbers_increase_monotonically() {
    let env = Env::new();

    let (first, _) = env.run_cycle(false).await;
    let (second, _) = env.run_cycle(true).await;
    let (third, _) = env.run_cycle(true).await;

    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert_eq!(third.id, 3);
}

/// A second run of the same cycle with --skip-scan re-executes nothing and
/// leaves byte-identical artifacts.
#[tokio::test]
async fn test_idempotent_resume_produces_identical_artifacts() {
    let env = Env::new();
    let (cycle, _) = env.run_cycle(false).await;

    let artifacts = env.artifacts();
    let before: Vec<Vec<u8>> = ["scan", "signals", "digest"]
        .iter()
        .map(|s| artifacts.get(&ArtifactKey::new(cycle.run_date, 1, s)).unwrap())
        .collect();

    // Re-run cycle 1 explicitly: every stage output exists, so everything
    // is skipped and nothing is rewritten
    let state = env.state();
    let dedup = env.dedup();
    let logger = RunLogger::new(env.tmp.path()).unwrap();
    let capability = CommandCapability::new();
    let executor = PipelineExecutor::new(
        &env.config,
        &artifacts,
        &dedup,
        &capability,
        &logger,
        env.tmp.path(),
    );
    let record = state.read().unwrap().unwrap();
    let suppression = dedup.suppression_set().unwrap();
    let skip: HashSet<String> = ["scan".to_string()].into();
    let result = executor
        .run(&cycle, &skip, &record, &suppression)
        .await
        .unwrap();

    assert!(result.executed.is_empty());
    assert_eq!(result.skipped.len(), 3);

    let after: Vec<Vec<u8>> = ["scan", "signals", "digest"]
        .iter()
        .map(|s| artifacts.get(&ArtifactKey::new(cycle.run_date, 1, s)).unwrap())
        .collect();
    assert_eq!(before, after);
}

/// Suppression added after cycle N affects cycle N+1 only.
#[tokio::test]
async fn test_suppression_is_cycle_scoped() {
    let env = Env::new();
    let (first, _) = env.run_cycle(false).await;

    env.dedup()
        .add_suppression(SuppressionPattern::Exact("item-2".to_string()), "low grade")
        .unwrap();

    let (second, _) = env.run_cycle(true).await;

    let artifacts = env.artifacts();
    let cycle1: Vec<Item> = serde_json::from_slice(
        &artifacts
            .get(&ArtifactKey::new(first.run_date, first.id, "signals"))
            .unwrap(),
    )
    .unwrap();
    let cycle2: Vec<Item> = serde_json::from_slice(
        &artifacts
            .get(&ArtifactKey::new(second.run_date, second.id, "signals"))
            .unwrap(),
    )
    .unwrap();

    // Cycle 1's committed artifact is untouched
    assert!(cycle1.iter().any(|i| i.identity == "item-2"));
    // Cycle 2 excludes the suppressed identity
    assert!(!cycle2.iter().any(|i| i.identity == "item-2"));
    assert!(cycle2.iter().any(|i| i.identity == "item-1"));
}

/// Items seen in a prior cycle come back flagged recurring.
#[tokio::test]
async fn test_recurrence_detected_across_cycles() {
    let env = Env::new();
    let (first, _) = env.run_cycle(false).await;
    let (second, _) = env.run_cycle(true).await;

    let artifacts = env.artifacts();
    let cycle1: Vec<Item> = serde_json::from_slice(
        &artifacts
            .get(&ArtifactKey::new(first.run_date, first.id, "signals"))
            .unwrap(),
    )
    .unwrap();
    let cycle2: Vec<Item> = serde_json::from_slice(
        &artifacts
            .get(&ArtifactKey::new(second.run_date, second.id, "signals"))
            .unwrap(),
    )
    .unwrap();

    assert!(cycle1.iter().all(|i| !i.recurring));
    assert!(cycle2.iter().all(|i| i.recurring));
}

/// The publish directives round-trip: a final stage writing to
/// $CADENCE_DIRECTIVES seeds the next cycle's state record.
#[tokio::test]
async fn test_directives_flow_into_next_cycle_state() {
    let config = PipelineConfig::parse(
        r#"
[[stage]]
name = "tune"
description = "Adjust weights for the next cycle"
command = ["sh", "-c", "printf '{\"directives\":[\"go deeper\"],\"weights\":{\"depth\":0.6}}' > \"$CADENCE_DIRECTIVES\"; printf 'tuned'"]
"#,
    )
    .unwrap();
    let tmp = TempDir::new().unwrap();
    let artifacts = ArtifactStore::new(tmp.path().join("artifacts")).unwrap();
    let state = StateStore::new(tmp.path()).unwrap();
    let dedup = DedupIndex::new(tmp.path()).unwrap();
    let logger = RunLogger::new(tmp.path()).unwrap();
    let capability = CommandCapability::new();

    let cycle = Cycle::new(1, "2026-08-28".parse().unwrap());
    let executor =
        PipelineExecutor::new(&config, &artifacts, &dedup, &capability, &logger, tmp.path());
    let result = executor
        .run(
            &cycle,
            &HashSet::new(),
            &StateRecord::bootstrap(),
            &cadence::SuppressionSet::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        result.directives,
        NextCycleDirectives {
            directives: vec!["go deeper".to_string()],
            weights: [("depth".to_string(), 0.6)].into(),
        }
    );

    let publisher = Publisher::new(
        &artifacts,
        &state,
        tmp.path(),
        RetryPolicy::from_config(&config.publish),
    )
    .unwrap();
    publisher
        .publish(
            &cycle,
            &["tune".to_string()],
            &StateRecord::bootstrap(),
            &result.directives,
            None,
        )
        .await
        .unwrap();

    let record = state.read().unwrap().unwrap();
    assert_eq!(record.next_cycle_directives, vec!["go deeper"]);
    assert!((record.weights["depth"] - 0.6).abs() < f64::EPSILON);
}

/// A crash between the final stage's commit and publish must not lose the
/// emitted directives: the resumed run recovers them and publish folds them
/// into the state record.
#[tokio::test]
async fn test_resume_after_crash_still_publishes_directives() {
    let config = PipelineConfig::parse(
        r#"
[[stage]]
name = "tune"
description = "Adjust weights for the next cycle"
command = ["sh", "-c", "printf '{\"directives\":[\"go deeper\"],\"weights\":{\"depth\":0.6}}' > \"$CADENCE_DIRECTIVES\"; printf 'tuned'"]
"#,
    )
    .unwrap();
    let tmp = TempDir::new().unwrap();
    let artifacts = ArtifactStore::new(tmp.path().join("artifacts")).unwrap();
    let state = StateStore::new(tmp.path()).unwrap();
    let dedup = DedupIndex::new(tmp.path()).unwrap();
    let logger = RunLogger::new(tmp.path()).unwrap();
    let capability = CommandCapability::new();
    let cycle = Cycle::new(1, "2026-08-28".parse().unwrap());

    // First run commits the artifact, then "crashes" before publish
    {
        let executor =
            PipelineExecutor::new(&config, &artifacts, &dedup, &capability, &logger, tmp.path());
        executor
            .run(
                &cycle,
                &HashSet::new(),
                &StateRecord::bootstrap(),
                &cadence::SuppressionSet::default(),
            )
            .await
            .unwrap();
    }

    // The resumed run skips the committed stage but still carries what it
    // emitted through to publish
    let executor =
        PipelineExecutor::new(&config, &artifacts, &dedup, &capability, &logger, tmp.path());
    let resumed = executor
        .run(
            &cycle,
            &HashSet::new(),
            &StateRecord::bootstrap(),
            &cadence::SuppressionSet::default(),
        )
        .await
        .unwrap();
    assert!(resumed.executed.is_empty());
    assert_eq!(resumed.directives.directives, vec!["go deeper"]);

    let publisher = Publisher::new(
        &artifacts,
        &state,
        tmp.path(),
        RetryPolicy::from_config(&config.publish),
    )
    .unwrap();
    publisher
        .publish(
            &cycle,
            &["tune".to_string()],
            &StateRecord::bootstrap(),
            &resumed.directives,
            None,
        )
        .await
        .unwrap();

    let record = state.read().unwrap().unwrap();
    assert_eq!(record.next_cycle_directives, vec!["go deeper"]);
    assert!((record.weights["depth"] - 0.6).abs() < f64::EPSILON);
}
