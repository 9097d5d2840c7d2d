pub mod actor;
pub mod error;
pub mod health;
pub mod restore;
pub mod snapshot;
pub mod validation;

pub use restore::RestoreService;
pub use snapshot::SnapshotService;
