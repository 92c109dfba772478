//! Publisher: durable local commit plus best-effort remote push
//!
//! Publishing is two sub-steps. The local commit copies the cycle's
//! artifacts into `<data_dir>/published/<date>-cycle-<N>/` with a SHA-256
//! manifest; re-committing an unchanged cycle is a no-op, distinguished
//! from an error. The push is the only network-dependent operation and is
//! retried with exponential backoff behind the [`Remote`] trait; exhausting
//! the retries leaves the cycle locally committed but
//! `complete-unpublished`. The state store advances only after the local
//! commit succeeds, so publish trouble never blocks future cycles.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cycle::config::PublishConfig;
use crate::cycle::executor::NextCycleDirectives;
use crate::cycle::manager::{Cycle, CycleStatus};
use crate::error::{OrchestratorError, Result};
use crate::log;
use crate::store::artifact::{ArtifactKey, ArtifactStore};
use crate::store::state::{StateRecord, StateStore};

/// Parametrized exponential backoff schedule.
///
/// Delays double each retry starting from `base_delay`; the schedule is a
/// pure function of the attempt number so it can be unit-tested without
/// real network calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry (i.e. before attempt 2)
    pub base_delay: Duration,
    /// Factor applied to the delay after each failed attempt
    pub multiplier: u32,
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Build a policy from publish configuration (multiplier fixed at 2).
    #[must_use]
    pub const fn from_config(config: &PublishConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: 2,
            max_attempts: config.retry_max_attempts,
        }
    }

    /// Delay to sleep before the given attempt (attempts are 1-indexed;
    /// attempt 1 has no delay).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_delay * self.multiplier.saturating_pow(attempt - 2)
    }
}

/// Whether the local commit wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Artifacts were copied and the manifest (re)written
    Committed,
    /// An identical commit already existed; nothing was written
    Unchanged,
}

/// Result of publishing one cycle.
#[derive(Debug)]
pub struct PublishResult {
    /// Final status: `Complete` or `CompleteUnpublished`
    pub status: CycleStatus,
    /// Whether the local commit wrote anything
    pub commit: CommitOutcome,
    /// Push attempts made (0 when no remote is configured)
    pub push_attempts: u32,
}

/// Shared remote store the committed cycle is pushed to.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Push the committed cycle. Any error is retried per the policy.
    async fn push(&self, cycle: &Cycle) -> anyhow::Result<()>;
}

/// Remote that pushes by spawning a configured command (e.g. `git push`).
pub struct CommandRemote {
    command: Vec<String>,
}

impl CommandRemote {
    /// Create a remote from a command vector; an empty one errors at push time.
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Remote for CommandRemote {
    async fn push(&self, _cycle: &Cycle) -> anyhow::Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            anyhow::bail!("push command is empty");
        };
        let status = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await?;
        anyhow::ensure!(status.success(), "push command exited with {status}");
        Ok(())
    }
}

/// Manifest of one published cycle.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    cycle: u64,
    date: String,
    committed_at: chrono::DateTime<chrono::Utc>,
    /// stage name -> hex SHA-256 of the artifact payload
    files: BTreeMap<String, String>,
}

/// Durably commits cycles and pushes them with bounded retries.
pub struct Publisher<'a> {
    artifacts: &'a ArtifactStore,
    state: &'a StateStore,
    publish_root: PathBuf,
    policy: RetryPolicy,
}

impl<'a> Publisher<'a> {
    /// Create a publisher committing under `<data_dir>/published`.
    pub fn new(
        artifacts: &'a ArtifactStore,
        state: &'a StateStore,
        data_dir: &Path,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let publish_root = data_dir.join("published");
        fs::create_dir_all(&publish_root)?;
        Ok(Self {
            artifacts,
            state,
            publish_root,
            policy,
        })
    }

    /// Publish a cycle: local commit, state advance, then remote push.
    ///
    /// `stage_names` is the declared stage order; only stages that actually
    /// committed an artifact for this (date, cycle) are included. The state
    /// record advances immediately after the local commit, so push failure
    /// surfaces as `complete-unpublished` without blocking future cycles.
    pub async fn publish(
        &self,
        cycle: &Cycle,
        stage_names: &[String],
        prior_state: &StateRecord,
        directives: &NextCycleDirectives,
        remote: Option<&dyn Remote>,
    ) -> Result<PublishResult> {
        let commit = self.commit_local(cycle, stage_names)?;
        self.advance_state(cycle, prior_state, directives)?;

        let (status, push_attempts) = match remote {
            None => (CycleStatus::Complete, 0),
            Some(remote) => self.push_with_retry(cycle, remote).await,
        };

        Ok(PublishResult {
            status,
            commit,
            push_attempts,
        })
    }

    /// Copy the cycle's artifacts into the publish directory and write the
    /// manifest atomically. Unchanged content is a no-op.
    fn commit_local(&self, cycle: &Cycle, stage_names: &[String]) -> Result<CommitOutcome> {
        let dest = self
            .publish_root
            .join(format!("{}-cycle-{}", cycle.run_date, cycle.id));

        let mut files = BTreeMap::new();
        let mut payloads = Vec::new();
        for stage in stage_names {
            let key = ArtifactKey::new(cycle.run_date, cycle.id, stage);
            if !self.artifacts.exists(&key) {
                continue;
            }
            let payload = self.artifacts.get(&key)?;
            files.insert(stage.clone(), hex::encode(Sha256::digest(&payload)));
            payloads.push((stage.clone(), payload));
        }

        let manifest_path = dest.join("manifest.json");
        if manifest_path.exists() {
            let existing: Manifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
            if existing.files == files {
                return Ok(CommitOutcome::Unchanged);
            }
        }

        fs::create_dir_all(&dest)?;
        for (stage, payload) in payloads {
            fs::write(dest.join(format!("{stage}.out")), payload)?;
        }

        let manifest = Manifest {
            cycle: cycle.id,
            date: cycle.run_date.to_string(),
            committed_at: chrono::Utc::now(),
            files,
        };
        let tmp = manifest_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)?;
        fs::rename(&tmp, &manifest_path)?;
        Ok(CommitOutcome::Committed)
    }

    /// Advance `current_cycle` and fold in the final stage's directives.
    ///
    /// The cycle id is never decremented: replaying an old cycle with
    /// `--cycle` republishes its artifacts without rolling state back.
    fn advance_state(
        &self,
        cycle: &Cycle,
        prior: &StateRecord,
        directives: &NextCycleDirectives,
    ) -> Result<()> {
        let mut next = prior.clone();
        next.current_cycle = prior.current_cycle.max(cycle.id);
        if !directives.directives.is_empty() {
            next.next_cycle_directives = directives.directives.clone();
        }
        for (key, value) in &directives.weights {
            next.weights.insert(key.clone(), *value);
        }
        self.state.commit(&next)?;
        Ok(())
    }

    /// Push with exponential backoff, up to the policy's attempt budget.
    async fn push_with_retry(&self, cycle: &Cycle, remote: &dyn Remote) -> (CycleStatus, u32) {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match remote.push(cycle).await {
                Ok(()) => {
                    log::status_line(
                        "publish",
                        &format!("pushed cycle {} (attempt {attempt})", cycle.id),
                    );
                    return (CycleStatus::Complete, attempt);
                }
                Err(e) => {
                    last_error = e.to_string();
                    log::warn_line(&format!(
                        "push attempt {attempt}/{} failed: {last_error}",
                        self.policy.max_attempts
                    ));
                }
            }
        }
        log::warn_line(&format!(
            "push exhausted {} attempts ({last_error}); cycle {} is complete-unpublished, \
             artifacts remain locally committed",
            self.policy.max_attempts, cycle.id
        ));
        (CycleStatus::CompleteUnpublished, self.policy.max_attempts)
    }
}
