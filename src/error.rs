//! Error taxonomy for the orchestrator
//!
//! Every fatal condition the pipeline can hit maps to one variant here,
//! so the final log line can name the error kind precisely. Only
//! `PublishPushFailure` is non-fatal to a cycle's completion.

use thiserror::Error;

/// Errors raised by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A skip was requested (or an input required) but the prior artifact is absent.
    #[error("prerequisite artifact missing for stage '{stage}': {detail}")]
    PrerequisiteMissing {
        /// Stage whose prerequisite is missing
        stage: String,
        /// What was looked for and not found
        detail: String,
    },

    /// A stage's capability invocation errored, timed out, or returned unparsable output.
    #[error("stage '{stage}' failed: {reason}")]
    StageFailure {
        /// Stage that failed
        stage: String,
        /// Human-readable failure reason
        reason: String,
    },

    /// Attempted rewrite of an already-committed artifact key.
    ///
    /// Indicates a cycle-id reuse bug; the original payload is never overwritten.
    #[error("artifact already committed: {key}")]
    DuplicateArtifact {
        /// The contested artifact key
        key: String,
    },

    /// An artifact lookup found nothing at the given key.
    #[error("artifact not found: {key}")]
    ArtifactNotFound {
        /// The missing artifact key
        key: String,
    },

    /// The state store could not be read and no cycle override was given.
    #[error("state store unavailable: {reason}")]
    StateUnavailable {
        /// Why the state could not be read
        reason: String,
    },

    /// The remote push exhausted its retry budget.
    ///
    /// Non-fatal: the cycle's artifacts remain locally committed and the
    /// cycle is marked `complete-unpublished`.
    #[error("push failed after {attempts} attempts: {reason}")]
    PublishPushFailure {
        /// Number of attempts made
        attempts: u32,
        /// Last failure reason
        reason: String,
    },

    /// Another orchestrator run holds the exclusivity lock.
    #[error("run lock already held: {0}")]
    RunLockHeld(String),

    /// Underlying filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Short stable name of the error kind, used in the final status line.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PrerequisiteMissing { .. } => "PrerequisiteMissing",
            Self::StageFailure { .. } => "StageFailure",
            Self::DuplicateArtifact { .. } => "DuplicateArtifact",
            Self::ArtifactNotFound { .. } => "ArtifactNotFound",
            Self::StateUnavailable { .. } => "StateUnavailable",
            Self::PublishPushFailure { .. } => "PublishPushFailure",
            Self::RunLockHeld(_) => "RunLockHeld",
            Self::Io(_) => "Io",
            Self::Serialization(_) => "Serialization",
        }
    }

    /// Whether this error aborts the cycle.
    ///
    /// Everything except push exhaustion is fatal; a cycle whose push fails
    /// is still locally complete.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::PublishPushFailure { .. })
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
