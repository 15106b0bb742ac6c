//! The job execution pipeline: credential scheduling, the admission
//! pipeline, and the worker pool.

pub mod executor;
pub mod runner;
pub mod scheduler;

use pixgate_coord::CoordError;
use pixgate_store::StoreError;

pub use executor::{ExecOutcome, ExecutorConfig, JobExecutor};
pub use runner::{RunnerConfig, WorkerHandle, WorkerPool, WorkerStats};
pub use scheduler::{pick_credential, rank_candidates, Candidate, PickRequest};

/// Infrastructure failure inside the worker; the job it was processing
/// stays leased and is retried once the lease lapses.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Coord(#[from] CoordError),
}
