//! Periodic enqueuer.
//!
//! At most one node at a time materializes upcoming runs. Election
//! uses a short-TTL lock key renewed on every tick; the elected node
//! expands each cached policy into scheduled children covering the
//! enqueuer horizon. Child ids are deterministic hashes of
//! (policy id, fire time), so a lock handover can never
//! double-materialize a run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::jobs::{JobKind, JobStats, JobStatus};
use crate::period::scheduler::Scheduler;
use crate::period::parse_cron_spec;
use crate::pool::queue::{Queue, QueuedJob};
use crate::db::{keys, RedisPool};
use crate::stats::StatsManager;

/// Look-ahead window for materializing upcoming runs.
pub const PERIODIC_ENQUEUER_HORIZON: Duration = Duration::from_secs(4 * 60);

/// Tick between materialization passes.
const ENQUEUE_PERIOD: Duration = Duration::from_secs(60);

/// Lock TTL; outlives one tick so the holder renews before expiry.
const LOCK_TTL_SECS: i64 = 75;

/// Deterministic child job id for one fire time of a policy.
pub fn child_job_id(policy_id: &str, fire_time: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy_id.as_bytes());
    hasher.update(b":");
    hasher.update(fire_time.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..24].to_string()
}

/// All fire times of a schedule within `[from, from + horizon)`.
pub fn fire_times(
    schedule: &cron::Schedule,
    from: DateTime<Utc>,
    horizon: Duration,
) -> Vec<DateTime<Utc>> {
    let end = from + chrono::Duration::from_std(horizon).unwrap_or_default();
    schedule
        .after(&from)
        .take_while(|t| *t < end)
        .collect()
}

pub struct Enqueuer {
    redis: RedisPool,
    scheduler: Arc<Scheduler>,
    stats: Arc<StatsManager>,
    queue: Queue,
    node_id: String,
}

impl Enqueuer {
    pub fn new(
        redis: RedisPool,
        scheduler: Arc<Scheduler>,
        stats: Arc<StatsManager>,
        queue: Queue,
    ) -> Self {
        Self {
            redis,
            scheduler,
            stats,
            queue,
            node_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Run the election/materialization loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(ENQUEUE_PERIOD);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.try_acquire_lock().await {
                        Ok(true) => {
                            if let Err(e) = self.enqueue_once().await {
                                error!(error = %e, "periodic enqueue pass failed");
                            }
                        }
                        Ok(false) => debug!("another node holds the periodic enqueuer lock"),
                        Err(e) => error!(error = %e, "periodic enqueuer election failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("periodic enqueuer stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Acquire or renew the enqueuer lock for this node.
    async fn try_acquire_lock(&self) -> Result<bool> {
        let key = keys::periodic_enqueuer_lock(self.redis.namespace());
        let mut conn = self.redis.conn().await?;

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.node_id)
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        if set.is_some() {
            return Ok(true);
        }

        // Renew if we already hold it.
        let holder: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        if holder.as_deref() == Some(self.node_id.as_str()) {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(LOCK_TTL_SECS)
                .query_async::<_, i64>(&mut conn)
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Materialize all fire times within the horizon for every cached
    /// policy. Idempotent: already-inserted children are skipped.
    async fn enqueue_once(&self) -> Result<()> {
        let now = Utc::now();
        let mut inserted = 0usize;

        for policy in self.scheduler.policies() {
            let schedule = match parse_cron_spec(&policy.cron_spec) {
                Ok(s) => s,
                Err(e) => {
                    warn!(policy_id = %policy.policy_id, error = %e, "skipping policy with bad cron spec");
                    continue;
                }
            };

            for fire_time in fire_times(&schedule, now, PERIODIC_ENQUEUER_HORIZON) {
                let fire_ts = fire_time.timestamp();
                let id = child_job_id(&policy.policy_id, fire_ts);

                let mut child = QueuedJob::new(&id, &policy.job_name, policy.parameters.clone(), false);
                // Stable payload bytes across elected nodes.
                child.enqueued_at = fire_ts;
                child.run_at = Some(fire_ts);

                if !self.queue.push_scheduled(&child, fire_ts).await? {
                    continue;
                }

                let mut stats =
                    JobStats::new(&id, &policy.job_name, JobKind::Scheduled, false, JobStatus::Scheduled);
                stats.run_at = Some(fire_ts);
                stats.upstream_job_id = Some(policy.policy_id.clone());
                self.stats.save(stats);

                self.stats
                    .attach_execution_at(&policy.policy_id, &id, fire_ts)
                    .await;
                inserted += 1;
            }
        }

        if inserted > 0 {
            info!(inserted, "materialized periodic job runs");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn test_child_job_id_deterministic() {
        let a = child_job_id("policy-1", 1_700_000_000);
        let b = child_job_id("policy-1", 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);

        assert_ne!(a, child_job_id("policy-1", 1_700_000_060));
        assert_ne!(a, child_job_id("policy-2", 1_700_000_000));
    }

    #[test]
    fn test_fire_times_every_minute_within_horizon() {
        let schedule = cron::Schedule::from_str("0 * * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 30).unwrap();

        let times = fire_times(&schedule, from, PERIODIC_ENQUEUER_HORIZON);

        // Horizon of 4 minutes starting 12:00:30 covers 12:01..=12:04.
        assert_eq!(times.len(), 4);
        assert_eq!(times[0], Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap());
        assert_eq!(times[3], Utc.with_ymd_and_hms(2026, 1, 1, 12, 4, 0).unwrap());
    }

    #[test]
    fn test_fire_times_outside_horizon_empty() {
        // Fires once a day at midnight; a 4 minute horizon at noon sees nothing.
        let schedule = cron::Schedule::from_str("0 0 0 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let times = fire_times(&schedule, from, PERIODIC_ENQUEUER_HORIZON);
        assert!(times.is_empty());
    }
}
