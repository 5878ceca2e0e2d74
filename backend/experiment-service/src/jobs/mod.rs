//! Background jobs
//!
//! Periodic jobs run on a fixed interval, never abort the loop on failure,
//! back off exponentially after repeated failures and stop on a broadcast
//! shutdown signal.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info};
use uuid::Uuid;

pub mod results_snapshot;

pub use results_snapshot::{run_results_snapshot_loop, ResultsSnapshotJob};

/// Per-run context carrying a correlation id for log tracing
#[derive(Debug, Clone)]
pub struct JobContext {
    pub correlation_id: String,
}

impl JobContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    async fn run_once(&self, ctx: &JobContext) -> Result<()>;

    /// Interval between runs (seconds)
    fn interval_sec(&self) -> u64;

    /// Job name for logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Run a job until `shutdown` fires
pub async fn run_job_loop(job: Arc<dyn PeriodicJob>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval_timer = interval(Duration::from_secs(job.interval_sec().max(1)));
    let mut consecutive_failures = 0u32;

    info!(
        job_name = %job.name(),
        interval_sec = job.interval_sec(),
        "Starting job loop"
    );

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let ctx = JobContext::new();

                match job.run_once(&ctx).await {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            info!(
                                job_name = %job.name(),
                                recovered_after = consecutive_failures,
                                "Job recovered after failures"
                            );
                            consecutive_failures = 0;
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            job_name = %job.name(),
                            correlation_id = %ctx.correlation_id,
                            error = %e,
                            consecutive_failures,
                            "Job execution failed, will retry on next interval"
                        );

                        if consecutive_failures >= 3 {
                            let backoff_secs = 2u64.pow(consecutive_failures.min(5));
                            info!(
                                job_name = %job.name(),
                                backoff_secs,
                                "Applying exponential backoff due to consecutive failures"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                                _ = shutdown.recv() => break,
                            }
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(
                    job_name = %job.name(),
                    "Received shutdown signal, stopping job loop"
                );
                break;
            }
        }
    }

    info!(job_name = %job.name(), "Job loop stopped");
}
