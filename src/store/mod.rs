//! Persisted collections
//!
//! The three durable collections that form the contract between one run and
//! any resumed or future run: the artifact store, the singleton state record,
//! and the append-only dedup/suppression index.

pub mod artifact;
pub mod dedup;
pub mod state;

pub use artifact::{ArtifactKey, ArtifactStore};
pub use dedup::{DedupIndex, Item, SuppressionEntry, SuppressionPattern, SuppressionSet};
pub use state::{StateRecord, StateStore};
