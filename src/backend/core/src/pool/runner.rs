//! Job wrapper.
//!
//! Executes one dequeued payload: marks the record `Running`, builds
//! the per-job execution context, invokes the registered job, maps the
//! outcome to a status transition and a queue disposition, and always
//! releases the unique marker and closes the job logger.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::joblog::JobLogStore;
use crate::jobs::{
    BackoffStrategy, JobContext, JobRegistry, JobStatus, RunError, SubJobLauncher,
    DEFAULT_MAX_FAILS,
};
use crate::pool::dedup::DeDuplicator;
use crate::pool::queue::{Queue, QueuedJob};
use crate::stats::StatsManager;

/// How a finished run leaves the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing left to do
    Done,
    /// Re-enter the retry set after the delay
    Retry { delay: Duration },
    /// Move to the dead set
    Dead,
}

/// Collapsed run outcome used for the disposition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Stopped,
    Cancelled,
    Failed,
}

/// Decide what happens to a payload after a run.
///
/// `fails` counts completed failed runs including this one. A job
/// reporting `max_fails() == 0` gets the pool default. Stopped jobs are
/// never retried or dead-lettered; cancelled jobs retry on their
/// failure budget alone; failures additionally consult `should_retry`.
pub fn decide(
    outcome: Outcome,
    fails: u32,
    max_fails: u32,
    should_retry: bool,
    backoff: &BackoffStrategy,
) -> Disposition {
    let max_fails = if max_fails == 0 { DEFAULT_MAX_FAILS } else { max_fails };

    match outcome {
        Outcome::Success | Outcome::Stopped => Disposition::Done,
        Outcome::Cancelled => {
            if fails < max_fails {
                Disposition::Retry {
                    delay: backoff.delay_for_attempt(fails.saturating_sub(1)),
                }
            } else {
                Disposition::Dead
            }
        }
        Outcome::Failed => {
            if should_retry && fails < max_fails {
                Disposition::Retry {
                    delay: backoff.delay_for_attempt(fails.saturating_sub(1)),
                }
            } else {
                Disposition::Dead
            }
        }
    }
}

/// Executes dequeued payloads against the registered job types.
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    stats: Arc<StatsManager>,
    queue: Queue,
    dedup: DeDuplicator,
    logs: JobLogStore,
    launcher: Arc<RwLock<Option<Arc<dyn SubJobLauncher>>>>,
    backoff: BackoffStrategy,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        stats: Arc<StatsManager>,
        queue: Queue,
        dedup: DeDuplicator,
        logs: JobLogStore,
        launcher: Arc<RwLock<Option<Arc<dyn SubJobLauncher>>>>,
    ) -> Self {
        Self {
            registry,
            stats,
            queue,
            dedup,
            logs,
            launcher,
            backoff: BackoffStrategy::default(),
        }
    }

    /// Run one payload to completion.
    pub async fn run(&self, queued: QueuedJob) {
        let Some(job) = self.registry.get(&queued.name) else {
            error!(job = %queued.name, job_id = %queued.id, "dequeued job of unknown type");
            let _ = self.stats.set_job_status(&queued.id, JobStatus::Error).await;
            self.dead_letter(&queued).await;
            self.release_unique(&queued).await;
            return;
        };

        let logger = match self.logs.create(&queued.id) {
            Ok(logger) => logger,
            Err(e) => {
                // Building the execution context failed; not retryable.
                error!(job_id = %queued.id, error = %e, "building job context failed");
                let _ = self.stats.set_job_status(&queued.id, JobStatus::Error).await;
                self.dead_letter(&queued).await;
                self.release_unique(&queued).await;
                return;
            }
        };

        if let Err(e) = self.stats.set_job_status(&queued.id, JobStatus::Running).await {
            error!(job_id = %queued.id, error = %e, "marking job running failed");
        }

        let launcher = self.launcher.read().clone();
        let ctx = JobContext::new(
            queued.id.clone(),
            queued.name.clone(),
            self.stats.clone(),
            launcher,
            logger,
        );

        let result = AssertUnwindSafe(job.run(&ctx, queued.params.clone()))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => {
                info!(job = %format!("{}:{}", queued.name, queued.id), "job exit with success");
                let _ = self.stats.set_job_status(&queued.id, JobStatus::Success).await;
                Outcome::Success
            }
            Ok(Err(RunError::Stopped)) => {
                info!(job = %format!("{}:{}", queued.name, queued.id), "job stopped");
                let _ = self.stats.set_job_status(&queued.id, JobStatus::Stopped).await;
                Outcome::Stopped
            }
            Ok(Err(RunError::Cancelled)) => {
                info!(job = %format!("{}:{}", queued.name, queued.id), "job cancelled");
                let _ = self.stats.set_job_status(&queued.id, JobStatus::Cancelled).await;
                Outcome::Cancelled
            }
            Ok(Err(RunError::Failed(e))) => {
                ctx.logger().error(&format!("job failed: {:#}", e));
                error!(
                    job = %format!("{}:{}", queued.name, queued.id),
                    error = %e,
                    "job exit with error"
                );
                let _ = self.stats.set_job_status(&queued.id, JobStatus::Error).await;
                Outcome::Failed
            }
            Err(panic) => {
                let message = panic_message(panic);
                ctx.logger().error(&format!("runtime error: {}", message));
                error!(
                    job = %format!("{}:{}", queued.name, queued.id),
                    panic = %message,
                    "runtime error while executing job"
                );
                let _ = self.stats.set_job_status(&queued.id, JobStatus::Error).await;
                Outcome::Failed
            }
        };

        counter!(
            "stevedore_jobs_finished_total",
            "outcome" => outcome_label(outcome)
        )
        .increment(1);

        let fails = queued.fails + 1;
        match decide(outcome, fails, job.max_fails(), job.should_retry(), &self.backoff) {
            Disposition::Done => {}
            Disposition::Retry { delay } => {
                let mut retried = queued.clone();
                retried.fails = fails;
                let retry_at = chrono::Utc::now().timestamp() + delay.as_secs() as i64;
                if let Err(e) = self.queue.push_retry(&retried, retry_at).await {
                    error!(job_id = %queued.id, error = %e, "pushing job to retry set failed");
                }
            }
            Disposition::Dead => self.dead_letter(&queued).await,
        }

        self.release_unique(&queued).await;
        ctx.logger().close();
    }

    /// Explicit dead-letter primitive: the payload lands in the dead
    /// set and `die_at` is recorded on the stats record.
    async fn dead_letter(&self, queued: &QueuedJob) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.queue.push_dead(queued, now).await {
            error!(job_id = %queued.id, error = %e, "pushing job to dead set failed");
            return;
        }
        self.stats.die_at(&queued.id, now).await;
    }

    async fn release_unique(&self, queued: &QueuedJob) {
        if !queued.unique {
            return;
        }
        if let Err(e) = self.dedup.release(&queued.name, &queued.params).await {
            error!(job_id = %queued.id, error = %e, "delete job unique sign error");
        }
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::Stopped => "stopped",
        Outcome::Cancelled => "cancelled",
        Outcome::Failed => "failed",
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> BackoffStrategy {
        BackoffStrategy::fixed(10)
    }

    #[test]
    fn test_success_and_stopped_are_final() {
        assert_eq!(
            decide(Outcome::Success, 1, 3, true, &backoff()),
            Disposition::Done
        );
        // A stopped job is neither retried nor dead-lettered.
        assert_eq!(
            decide(Outcome::Stopped, 3, 3, true, &backoff()),
            Disposition::Done
        );
    }

    #[test]
    fn test_failed_respects_retry_budget() {
        assert_eq!(
            decide(Outcome::Failed, 1, 3, true, &backoff()),
            Disposition::Retry { delay: Duration::from_secs(10) }
        );
        assert_eq!(decide(Outcome::Failed, 3, 3, true, &backoff()), Disposition::Dead);
    }

    #[test]
    fn test_failed_without_should_retry_goes_dead() {
        assert_eq!(decide(Outcome::Failed, 1, 3, false, &backoff()), Disposition::Dead);
    }

    #[test]
    fn test_cancelled_retries_up_to_max_fails() {
        // Cancelled runs retry regardless of should_retry.
        assert_eq!(
            decide(Outcome::Cancelled, 1, 3, false, &backoff()),
            Disposition::Retry { delay: Duration::from_secs(10) }
        );
        assert_eq!(
            decide(Outcome::Cancelled, 3, 3, false, &backoff()),
            Disposition::Dead
        );
    }

    #[test]
    fn test_zero_max_fails_means_default() {
        // fails below the default of 4 keeps retrying
        assert_eq!(
            decide(Outcome::Failed, 3, 0, true, &backoff()),
            Disposition::Retry { delay: Duration::from_secs(10) }
        );
        assert_eq!(decide(Outcome::Failed, 4, 0, true, &backoff()), Disposition::Dead);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed), "kaboom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed), "unknown panic payload");
    }
}
