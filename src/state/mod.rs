//! # Job State Mutation
//!
//! Transactional per-step updates of the shared job state record.

pub mod step_updater;

pub use step_updater::{apply_step_update, StepStateUpdater, StepUpdate};
