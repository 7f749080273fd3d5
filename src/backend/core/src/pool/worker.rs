//! Worker dispatch loop.
//!
//! Claims ready payloads, runs them with bounded concurrency, keeps
//! the pool heartbeat fresh and ticks the requeuer that fires due
//! scheduled and retried jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

use crate::jobs::{JobRegistry, JobStatus};
use crate::pool::queue::{DelayedSet, Heartbeat, Queue};
use crate::pool::runner::JobRunner;
use crate::stats::StatsManager;

/// Heartbeat refresh cadence; §5 declares a pool dead after 10s.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Requeuer cadence for the scheduled and retry sets.
const REQUEUE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Sleep between empty queue polls
    pub poll_interval: Duration,
    /// Identity of this pool instance
    pub pool_id: String,
}

/// The dispatch half of the work pool.
pub struct Worker {
    config: WorkerConfig,
    queue: Queue,
    runner: Arc<JobRunner>,
    registry: Arc<JobRegistry>,
    stats: Arc<StatsManager>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Queue,
        runner: Arc<JobRunner>,
        registry: Arc<JobRegistry>,
        stats: Arc<StatsManager>,
    ) -> Self {
        Self {
            config,
            queue,
            runner,
            registry,
            stats,
        }
    }

    /// Start the dispatch, heartbeat and requeuer loops.
    pub fn start(self, shutdown: watch::Receiver<bool>) {
        let worker = Arc::new(self);

        let w = worker.clone();
        let s = shutdown.clone();
        tokio::spawn(async move { w.heartbeat_loop(s).await });

        let w = worker.clone();
        let s = shutdown.clone();
        tokio::spawn(async move { w.requeue_loop(s).await });

        tokio::spawn(async move { worker.dispatch_loop(shutdown).await });
    }

    async fn dispatch_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let names = self.registry.names();

        info!(
            pool_id = %self.config.pool_id,
            concurrency = self.config.concurrency,
            jobs = ?names,
            "worker dispatch loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim_ready(&names, &self.config.pool_id).await {
                Ok(Some((raw, job))) => {
                    info!("job incoming: {}:{}", job.name, job.id);

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let runner = self.runner.clone();
                    let queue = self.queue.clone();
                    let pool_id = self.config.pool_id.clone();
                    tokio::spawn(async move {
                        runner.run(job).await;
                        if let Err(e) = queue.release_in_progress(&pool_id, &raw).await {
                            error!(error = %e, "releasing in-progress payload failed");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "claiming ready job failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        // Let in-flight jobs finish before reporting the stop.
        let _ = semaphore.acquire_many(self.config.concurrency as u32).await;
        info!(pool_id = %self.config.pool_id, "worker dispatch loop stopped");
    }

    async fn heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let started_at = chrono::Utc::now().timestamp();
        let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let hb = Heartbeat {
                        worker_pool_id: self.config.pool_id.clone(),
                        started_at,
                        heartbeat_at: chrono::Utc::now().timestamp(),
                        job_names: self.registry.names(),
                        concurrency: self.config.concurrency,
                    };
                    if let Err(e) = self.queue.write_heartbeat(&hb).await {
                        error!(error = %e, "writing pool heartbeat failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("heartbeat loop stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn requeue_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REQUEUE_PERIOD);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for set in [DelayedSet::Scheduled, DelayedSet::Retry] {
                        match self.queue.requeue_due(set).await {
                            Ok(moved) => {
                                for job in moved {
                                    // Fired jobs become visible as Pending until a
                                    // worker picks them up.
                                    if let Err(e) =
                                        self.stats.set_job_status(&job.id, JobStatus::Pending).await
                                    {
                                        error!(job_id = %job.id, error = %e, "marking fired job pending failed");
                                    }
                                }
                            }
                            Err(e) => error!(error = %e, "requeueing due jobs failed"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("requeue loop stopped");
                        return;
                    }
                }
            }
        }
    }
}
