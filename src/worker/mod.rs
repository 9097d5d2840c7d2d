pub mod job_worker;
pub mod recovery;

pub use job_worker::JobWorker;
pub use recovery::reconcile_stale_jobs;
