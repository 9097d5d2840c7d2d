//! Durable multi-step jobs.
//!
//! ## Components
//!
//! - `types`: job and step records, statuses, per-kind concurrency policy
//! - `store`: the `JobStore` contract (Postgres implementation lives in `db`)
//! - `engine`: runs a job's steps in order against registered handlers
//! - `snapshot`: the four-step snapshot pipeline
//! - `restore`: restore planning and execution steps

pub mod engine;
#[cfg(test)]
pub mod memory;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod types;

pub use engine::{StepEngine, StepFailure, StepHandler, StepHandlers};
pub use store::{JobStore, StoreError};
pub use types::{Job, JobFilter, JobId, JobKind, JobStatus, NewJob, Step, StepStatus, StepUpdate};
