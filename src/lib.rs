//! Cadence - Research-cycle pipeline orchestrator
//!
//! Cadence runs a fixed sequence of configured stages once per cycle:
//! pull raw data, transform it stage by stage, and publish the result,
//! carrying dedup history, suppression rules, and tuning weights forward
//! across cycles. Stage content lives behind a narrow capability
//! interface; the orchestrator owns cycle numbering, artifact hand-off,
//! fail-fast sequencing, and the publish retry discipline.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

pub mod capability;
pub mod cycle;
pub mod error;
pub mod log;
pub mod publish;
pub mod store;

// Re-export commonly used types
pub use capability::{Capability, CommandCapability, InvocationOutput, InvocationRequest};
pub use cycle::config::{GlobalConfig, PipelineConfig, PublishConfig, StageConfig, StageSchema};
pub use cycle::executor::{NextCycleDirectives, PipelineExecutor, PipelineResult};
pub use cycle::manager::{Cycle, CycleManager, CycleStatus, RunLock, BOOTSTRAP_CYCLE};
pub use error::{OrchestratorError, Result};
pub use log::{RunLogger, StageOutcome};
pub use publish::{CommandRemote, CommitOutcome, PublishResult, Publisher, Remote, RetryPolicy};
pub use store::{ArtifactKey, ArtifactStore, DedupIndex, Item, StateRecord, StateStore,
    SuppressionEntry, SuppressionPattern, SuppressionSet};
