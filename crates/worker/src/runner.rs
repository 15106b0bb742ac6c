//! The worker pool: a bounded set of concurrent job tasks fed by the
//! persistent queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use pixgate_store::JobRepository;

use crate::executor::{ExecOutcome, JobExecutor};

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Concurrent job tasks per process.
    pub concurrency: usize,
    /// Idle sleep between empty queue polls.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Pool counters, updated as jobs settle.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_skipped: u64,
}

#[derive(Default)]
struct StatsInner {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
}

impl StatsInner {
    fn record(&self, outcome: &ExecOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            ExecOutcome::Succeeded { .. } => self.succeeded.fetch_add(1, Ordering::Relaxed),
            ExecOutcome::Failed { .. } => self.failed.fetch_add(1, Ordering::Relaxed),
            ExecOutcome::Retrying { .. } => self.retried.fetch_add(1, Ordering::Relaxed),
            ExecOutcome::Skipped | ExecOutcome::Discarded => {
                self.skipped.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running pool.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<StatsInner>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }
}

/// Background job-pulling pool.
pub struct WorkerPool {
    executor: Arc<JobExecutor>,
    jobs: Arc<dyn JobRepository>,
    config: RunnerConfig,
}

impl WorkerPool {
    pub fn new(
        executor: JobExecutor,
        jobs: Arc<dyn JobRepository>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            jobs,
            config,
        }
    }

    /// Spawn the pull loop.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(StatsInner::default());
        let stats_clone = stats.clone();

        let join = tokio::spawn(async move {
            self.run(shutdown_rx, stats_clone).await;
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, stats: Arc<StatsInner>) {
        info!(concurrency = self.config.concurrency, "worker pool started");
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            match self.jobs.claim_next().await {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, attempts = job.attempts, "claimed job");
                    let executor = Arc::clone(&self.executor);
                    let stats = Arc::clone(&stats);
                    tokio::spawn(async move {
                        match executor.execute(job).await {
                            Ok(outcome) => stats.record(&outcome),
                            Err(e) => {
                                // The lease lapses and the job is retried.
                                error!(error = %e, "job execution hit an infrastructure error");
                            }
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            // A closed channel means every handle is gone.
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "failed to claim next job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Drain: wait until every in-flight task returns its permit.
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("worker pool stopped");
    }
}
