//! Cycle management
//!
//! Cycle identity resolution, pipeline configuration, and the stage
//! pipeline executor.

pub mod config;
pub mod executor;
pub mod manager;
