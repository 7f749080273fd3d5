//! The work pool.
//!
//! Coordinates the Redis queue backend, the job registry, the stats
//! manager, the periodic scheduler and the worker dispatch loop behind
//! one facade. The controller talks to this type only.

pub mod dedup;
pub mod queue;
pub mod runner;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, StevedoreError};
use crate::joblog::JobLogStore;
use crate::jobs::{
    CtlCommand, Job, JobKind, JobRegistry, JobStats, JobStatus, Parameters, PoolStats,
    PoolStatsEntry, SubJobLauncher, POOL_STATUS_DEAD, POOL_STATUS_HEALTHY,
};
use crate::mq::{BusEvent, BusEventHandler, MessageServer};
use crate::period::{Enqueuer, Scheduler, Sweeper, PERIODIC_ENQUEUER_HORIZON};
use crate::stats::{is_valid_hook_url, StatsManager};

use dedup::DeDuplicator;
use queue::{Queue, QueuedJob};
use runner::JobRunner;
use worker::{Worker, WorkerConfig};

/// A pool is reported dead when its heartbeat is older than this.
const WORKER_POOL_DEAD_AFTER: Duration = Duration::from_secs(10);

/// Redis-backed worker pool.
pub struct WorkerPool {
    redis: crate::db::RedisPool,
    registry: Arc<JobRegistry>,
    queue: Queue,
    dedup: DeDuplicator,
    stats: Arc<StatsManager>,
    scheduler: Arc<Scheduler>,
    bus: MessageServer,
    logs: JobLogStore,
    launcher: Arc<RwLock<Option<Arc<dyn SubJobLauncher>>>>,
    worker_config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(redis: crate::db::RedisPool, logs: JobLogStore, config: &Config) -> Self {
        let bus = MessageServer::new(redis.clone());
        let stats = Arc::new(StatsManager::new(redis.clone(), bus.clone()));
        let scheduler = Arc::new(Scheduler::new(redis.clone(), bus.clone()));
        let queue = Queue::new(redis.clone());
        let dedup = DeDuplicator::new(redis.clone());

        let worker_config = WorkerConfig {
            concurrency: config.pool.workers,
            poll_interval: Duration::from_millis(config.pool.poll_interval_ms),
            pool_id: Uuid::new_v4().simple().to_string(),
        };

        Self {
            redis,
            registry: Arc::new(JobRegistry::new()),
            queue,
            dedup,
            stats,
            scheduler,
            bus,
            logs,
            launcher: Arc::new(RwLock::new(None)),
            worker_config,
        }
    }

    /// Wire the sub-job launch capability. Called once by the bootstrap
    /// after the controller exists.
    pub fn set_sub_job_launcher(&self, launcher: Arc<dyn SubJobLauncher>) {
        *self.launcher.write() = Some(launcher);
    }

    /// The stats manager shared with this pool.
    pub fn stats_manager(&self) -> Arc<StatsManager> {
        self.stats.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a job implementation under a name.
    pub fn register_job<J: Job>(&self, name: &str, job: J) -> Result<()> {
        self.registry.register(name, job)
    }

    /// Whether the name belongs to a registered job.
    pub fn is_known_job(&self, name: &str) -> bool {
        self.registry.is_known(name)
    }

    /// Run the registered type's parameter validator.
    pub fn validate_job_parameters(&self, name: &str, params: &Parameters) -> Result<()> {
        let job = self
            .registry
            .get(name)
            .ok_or_else(|| StevedoreError::validation(format!("job with name '{}' is unknown", name)))?;
        job.validate(params)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the pool. Non-blocking; background failures are reported
    /// through `error_tx`.
    pub async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
        error_tx: mpsc::Sender<StevedoreError>,
    ) -> Result<()> {
        // The backend must answer before anything is started.
        self.redis.ping_with_retry().await?;

        // Bus subscription: policy, hook and command events.
        let handler: Arc<dyn BusEventHandler> = Arc::new(PoolEventHandler {
            scheduler: self.scheduler.clone(),
            stats: self.stats.clone(),
        });
        let bus = self.bus.clone();
        let bus_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.run(handler, bus_shutdown).await {
                let _ = error_tx.send(e).await;
            }
        });

        // Clear dirty data before the pool starts consuming.
        let sweeper = Sweeper::new(self.queue.clone());
        if let Err(e) = sweeper.clear_outdated_scheduled_jobs().await {
            warn!(error = %e, "clearing outdated scheduled jobs failed");
        }

        self.stats.start(shutdown.clone()).await;

        match self.scheduler.load().await {
            Ok(count) => info!(policies = count, "periodic policies loaded"),
            Err(e) => warn!(error = %e, "loading periodic policies failed"),
        }

        let enqueuer = Enqueuer::new(
            self.redis.clone(),
            self.scheduler.clone(),
            self.stats.clone(),
            self.queue.clone(),
        );
        let enqueuer_shutdown = shutdown.clone();
        tokio::spawn(async move { enqueuer.run(enqueuer_shutdown).await });

        let log_store = self.logs.clone();
        let log_shutdown = shutdown.clone();
        tokio::spawn(async move { log_store.sweep_loop(log_shutdown).await });

        let runner = Arc::new(JobRunner::new(
            self.registry.clone(),
            self.stats.clone(),
            self.queue.clone(),
            self.dedup.clone(),
            self.logs.clone(),
            self.launcher.clone(),
        ));
        Worker::new(
            self.worker_config.clone(),
            self.queue.clone(),
            runner,
            self.registry.clone(),
            self.stats.clone(),
        )
        .start(shutdown);

        info!(pool_id = %self.worker_config.pool_id, "redis worker pool is started");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Submit a generic job to the ready queue.
    pub async fn enqueue(&self, name: &str, params: Parameters, unique: bool) -> Result<JobStats> {
        let digest = if unique {
            Some(self.dedup.claim(name, &params).await?)
        } else {
            None
        };

        let job_id = Uuid::new_v4().simple().to_string();
        let queued = QueuedJob::new(&job_id, name, params, unique);

        if let Err(e) = self.queue.push_ready(&queued).await {
            // No side effects may remain on failure.
            if let Some(ref digest) = digest {
                let _ = self.dedup.release_digest(digest).await;
            }
            return Err(e);
        }

        let mut stats = JobStats::new(&job_id, name, JobKind::Generic, unique, JobStatus::Pending);
        stats.parameters_digest = digest;
        self.stats.save(stats.clone());
        Ok(stats)
    }

    /// Submit a job to run once after `delay_seconds`.
    pub async fn schedule(
        &self,
        name: &str,
        params: Parameters,
        delay_seconds: u64,
        unique: bool,
    ) -> Result<JobStats> {
        let digest = if unique {
            Some(self.dedup.claim(name, &params).await?)
        } else {
            None
        };

        let job_id = Uuid::new_v4().simple().to_string();
        let run_at = chrono::Utc::now().timestamp() + delay_seconds as i64;
        let mut queued = QueuedJob::new(&job_id, name, params, unique);
        queued.run_at = Some(run_at);

        if let Err(e) = self.queue.push_scheduled(&queued, run_at).await {
            if let Some(ref digest) = digest {
                let _ = self.dedup.release_digest(digest).await;
            }
            return Err(e);
        }

        let mut stats = JobStats::new(&job_id, name, JobKind::Scheduled, unique, JobStatus::Scheduled);
        stats.parameters_digest = digest;
        stats.run_at = Some(run_at);
        self.stats.save(stats.clone());
        Ok(stats)
    }

    /// Store a periodic policy; the scheduler materializes children.
    ///
    /// Returns a synthetic parent record that is never executed itself.
    pub async fn periodically_enqueue(
        &self,
        name: &str,
        params: Parameters,
        cron_spec: &str,
    ) -> Result<JobStats> {
        let (policy_id, next_run) = self.scheduler.schedule(name, params, cron_spec).await?;

        let mut stats = JobStats::new(&policy_id, name, JobKind::Periodic, false, JobStatus::Pending);
        stats.cron_spec = Some(cron_spec.to_string());
        stats.run_at = Some(next_run);
        stats.is_multiple_executions = true;
        self.stats.save(stats.clone());
        Ok(stats)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Stats record of one job.
    pub async fn get_job_stats(&self, job_id: &str) -> Result<JobStats> {
        self.stats.retrieve(job_id).await
    }

    /// Heartbeat stats of every pool in the cluster.
    pub async fn stats(&self) -> Result<PoolStats> {
        let heartbeats = self.queue.read_heartbeats().await?;
        if heartbeats.is_empty() {
            return Err(StevedoreError::internal("failed to get stats of worker pools"));
        }

        let now = chrono::Utc::now().timestamp();
        let dead_after = WORKER_POOL_DEAD_AFTER.as_secs() as i64;

        let pools = heartbeats
            .into_iter()
            .filter(|hb| hb.heartbeat_at != 0)
            .map(|hb| {
                let status = if now - hb.heartbeat_at > dead_after {
                    POOL_STATUS_DEAD
                } else {
                    POOL_STATUS_HEALTHY
                };
                PoolStatsEntry {
                    worker_pool_id: hb.worker_pool_id,
                    started_at: hb.started_at,
                    heartbeat_at: hb.heartbeat_at,
                    job_names: hb.job_names,
                    concurrency: hb.concurrency,
                    status: status.to_string(),
                }
            })
            .collect();

        Ok(PoolStats { pools })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop a job; behavior depends on its kind.
    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        let stats = self.stats.retrieve(job_id).await?;

        match stats.kind {
            JobKind::Generic => {
                // Only running jobs can be stopped.
                if stats.status != JobStatus::Running {
                    return Err(StevedoreError::status_mismatch(job_id, "Running"));
                }
                self.stats.send_command(job_id, CtlCommand::Stop, false).await
            }
            JobKind::Scheduled => {
                if matches!(stats.status, JobStatus::Pending | JobStatus::Scheduled) {
                    let run_at = stats.run_at.unwrap_or(0);
                    if self.queue.delete_scheduled(run_at, job_id).await? {
                        self.stats.set_job_status(job_id, JobStatus::Stopped).await?;
                        info!(job_id, run_at, "scheduled job stopped before firing");
                        return Ok(());
                    }
                }
                if stats.status == JobStatus::Running {
                    return self.stats.send_command(job_id, CtlCommand::Stop, false).await;
                }
                Ok(())
            }
            JobKind::Periodic => {
                // 1) drop the policy
                self.scheduler.unschedule(job_id).await?;
                info!(policy_id = %job_id, "periodic job policy removed");

                // 2) best effort: take down the materialized children
                if let Err(e) = self.stop_periodic_children(job_id).await {
                    error!(policy_id = %job_id, error = %e, "stopping periodic children failed");
                }

                // 3) let the parent record age out
                if let Err(e) = self.stats.expire_periodic_job_stats(job_id).await {
                    error!(policy_id = %job_id, error = %e, "expiring periodic job stats failed");
                }
                Ok(())
            }
        }
    }

    /// Stop or delete the children of a periodic policy within the
    /// enqueuer horizon.
    async fn stop_periodic_children(&self, policy_id: &str) -> Result<()> {
        let start = chrono::Utc::now().timestamp() - PERIODIC_ENQUEUER_HORIZON.as_secs() as i64;
        let children = self.stats.get_executions(policy_id, Some(start)).await?;

        let mut failures = Vec::new();
        for child_id in children {
            let child = match self.stats.retrieve(&child_id).await {
                Ok(child) => child,
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };

            if child.status == JobStatus::Running {
                if let Err(e) = self.stats.send_command(&child_id, CtlCommand::Stop, false).await {
                    failures.push(e.to_string());
                }
            } else if matches!(child.status, JobStatus::Pending | JobStatus::Scheduled) {
                let run_at = child.run_at.unwrap_or(0);
                match self.queue.delete_scheduled(run_at, &child_id).await {
                    Ok(true) => {
                        let _ = self.stats.set_job_status(&child_id, JobStatus::Stopped).await;
                    }
                    Ok(false) => {}
                    Err(e) => failures.push(e.to_string()),
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StevedoreError::internal(failures.join("; ")))
        }
    }

    /// Cancel a running generic job.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let stats = self.stats.retrieve(job_id).await?;

        if stats.kind != JobKind::Generic {
            return Err(StevedoreError::new(
                crate::error::ErrorCode::StatusMismatch,
                format!("job kind '{}' does not support 'cancel'", stats.kind),
            ));
        }
        if stats.status != JobStatus::Running {
            return Err(StevedoreError::status_mismatch(job_id, "Running"));
        }

        self.stats.send_command(job_id, CtlCommand::Cancel, false).await
    }

    /// Resubmit a dead-lettered job.
    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        let stats = self.stats.retrieve(job_id).await?;

        if stats.die_at == 0 {
            return Err(StevedoreError::new(
                crate::error::ErrorCode::StatusMismatch,
                format!("job '{}' is not a retryable job", job_id),
            ));
        }

        match self.queue.retry_dead(stats.die_at, job_id).await? {
            Some(_) => {
                self.stats
                    .update(job_id, vec![("die_at".to_string(), "0".to_string())])
                    .await;
                self.stats.set_job_status(job_id, JobStatus::Pending).await?;
                Ok(())
            }
            None => Err(StevedoreError::job_not_found(job_id)),
        }
    }

    /// Register a status hook for a job (canonical write + broadcast).
    pub async fn register_hook(&self, job_id: &str, hook_url: &str) -> Result<()> {
        if !is_valid_hook_url(hook_url) {
            return Err(StevedoreError::validation("invalid hook url"));
        }
        self.stats.register_hook(job_id, hook_url, false).await
    }
}

/// Bus event dispatch into the scheduler cache and the stats caches.
struct PoolEventHandler {
    scheduler: Arc<Scheduler>,
    stats: Arc<StatsManager>,
}

#[async_trait]
impl BusEventHandler for PoolEventHandler {
    async fn handle(&self, event: BusEvent) -> Result<()> {
        match event {
            BusEvent::SchedulePeriodicPolicy(policy) => {
                self.scheduler.accept(policy);
                Ok(())
            }
            BusEvent::UnSchedulePeriodicPolicy(policy) => {
                if self.scheduler.remove(&policy.policy_id).is_none() {
                    warn!(policy_id = %policy.policy_id, "unschedule event for unknown policy");
                }
                Ok(())
            }
            BusEvent::RegisterStatusHook(hook) => {
                self.stats.register_hook(&hook.job_id, &hook.hook_url, true).await
            }
            BusEvent::FireCommand(cmd) => {
                self.stats.send_command(&cmd.job_id, cmd.command, true).await
            }
        }
    }
}
