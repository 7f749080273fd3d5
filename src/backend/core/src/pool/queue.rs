//! Redis queue backend.
//!
//! Ready work lives in one list per registered job name; a claim moves
//! the payload into the pool's in-progress list until the run finishes.
//! Scheduled, retry and dead jobs live in sorted sets scored by their
//! run-at, retry-at and die-at times. A requeuer tick claims due
//! members atomically (ZREM wins on exactly one node) and pushes them
//! onto the ready lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::jobs::Parameters;
use crate::db::{keys, RedisPool};

/// A job payload travelling through the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub unique: bool,
    /// Completed failed runs of this payload
    #[serde(default)]
    pub fails: u32,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
}

impl QueuedJob {
    pub fn new(id: &str, name: &str, params: Parameters, unique: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            params,
            unique,
            fails: 0,
            enqueued_at: chrono::Utc::now().timestamp(),
            run_at: None,
        }
    }
}

/// The delayed sets a requeuer tick drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedSet {
    Scheduled,
    Retry,
}

/// Worker pool heartbeat record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
}

/// Redis-backed queue operations shared by the pool, the runner and
/// the periodic enqueuer.
#[derive(Clone)]
pub struct Queue {
    redis: RedisPool,
}

impl Queue {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    fn ns(&self) -> &str {
        self.redis.namespace()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ready queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a job to the ready list of its name.
    pub async fn push_ready(&self, job: &QueuedJob) -> Result<()> {
        let key = keys::queue(self.ns(), &job.name);
        let payload = serde_json::to_string(job)?;
        let mut conn = self.redis.conn().await?;
        redis::cmd("LPUSH")
            .arg(&key)
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        debug!(queue = %key, job_id = %job.id, "job enqueued");
        Ok(())
    }

    /// Try to claim one ready job across the given names, moving the
    /// payload into this pool's in-progress list.
    pub async fn claim_ready(
        &self,
        names: &[String],
        pool_id: &str,
    ) -> Result<Option<(String, QueuedJob)>> {
        let in_progress = keys::in_progress(self.ns(), pool_id);
        let mut conn = self.redis.conn().await?;

        for name in names {
            let key = keys::queue(self.ns(), name);
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&key)
                .arg(&in_progress)
                .query_async(&mut conn)
                .await?;

            if let Some(raw) = raw {
                match serde_json::from_str::<QueuedJob>(&raw) {
                    Ok(job) => return Ok(Some((raw, job))),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed queue payload");
                        redis::cmd("LREM")
                            .arg(&in_progress)
                            .arg(1)
                            .arg(&raw)
                            .query_async::<_, i64>(&mut conn)
                            .await?;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Drop a finished payload from the in-progress list.
    pub async fn release_in_progress(&self, pool_id: &str, raw: &str) -> Result<()> {
        let key = keys::in_progress(self.ns(), pool_id);
        let mut conn = self.redis.conn().await?;
        redis::cmd("LREM")
            .arg(&key)
            .arg(1)
            .arg(raw)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delayed sets
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a job to the scheduled set.
    ///
    /// Members are added with `NX`, so a byte-identical payload (the
    /// deterministic periodic children) cannot be double-inserted.
    /// Returns whether the member was new.
    pub async fn push_scheduled(&self, job: &QueuedJob, run_at: i64) -> Result<bool> {
        let key = keys::scheduled(self.ns());
        let payload = serde_json::to_string(job)?;
        let mut conn = self.redis.conn().await?;
        let added: i64 = redis::cmd("ZADD")
            .arg(&key)
            .arg("NX")
            .arg(run_at)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    /// Add a failed job to the retry set.
    pub async fn push_retry(&self, job: &QueuedJob, retry_at: i64) -> Result<()> {
        let key = keys::retry(self.ns());
        let payload = serde_json::to_string(job)?;
        let mut conn = self.redis.conn().await?;
        redis::cmd("ZADD")
            .arg(&key)
            .arg(retry_at)
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    /// Move an exhausted job to the dead set.
    pub async fn push_dead(&self, job: &QueuedJob, die_at: i64) -> Result<()> {
        let key = keys::dead(self.ns());
        let payload = serde_json::to_string(job)?;
        let mut conn = self.redis.conn().await?;
        redis::cmd("ZADD")
            .arg(&key)
            .arg(die_at)
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    /// Claim due members of a delayed set and push them onto their
    /// ready lists. Returns the moved jobs so the caller can flip
    /// their status.
    pub async fn requeue_due(&self, set: DelayedSet) -> Result<Vec<QueuedJob>> {
        let key = match set {
            DelayedSet::Scheduled => keys::scheduled(self.ns()),
            DelayedSet::Retry => keys::retry(self.ns()),
        };
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.redis.conn().await?;

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(50)
            .query_async(&mut conn)
            .await?;

        let mut moved = Vec::new();
        for raw in due {
            // ZREM is the cross-node claim: exactly one requeuer wins.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&key)
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if removed != 1 {
                continue;
            }

            match serde_json::from_str::<QueuedJob>(&raw) {
                Ok(job) => {
                    let ready = keys::queue(self.ns(), &job.name);
                    redis::cmd("LPUSH")
                        .arg(&ready)
                        .arg(&raw)
                        .query_async::<_, i64>(&mut conn)
                        .await?;
                    moved.push(job);
                }
                Err(e) => warn!(error = %e, "dropping malformed delayed payload"),
            }
        }

        Ok(moved)
    }

    /// Delete a pending scheduled job by its run-at score and id.
    pub async fn delete_scheduled(&self, run_at: i64, job_id: &str) -> Result<bool> {
        let key = keys::scheduled(self.ns());
        let mut conn = self.redis.conn().await?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg(run_at)
            .arg(run_at)
            .query_async(&mut conn)
            .await?;

        for raw in members {
            if let Ok(job) = serde_json::from_str::<QueuedJob>(&raw) {
                if job.id == job_id {
                    let removed: i64 = redis::cmd("ZREM")
                        .arg(&key)
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await?;
                    return Ok(removed == 1);
                }
            }
        }

        Ok(false)
    }

    /// Resubmit a dead job by its die-at score and id. The failure
    /// budget is reset so the retried job gets a fresh run.
    pub async fn retry_dead(&self, die_at: i64, job_id: &str) -> Result<Option<QueuedJob>> {
        let key = keys::dead(self.ns());
        let mut conn = self.redis.conn().await?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg(die_at)
            .arg(die_at)
            .query_async(&mut conn)
            .await?;

        for raw in members {
            if let Ok(mut job) = serde_json::from_str::<QueuedJob>(&raw) {
                if job.id == job_id {
                    let removed: i64 = redis::cmd("ZREM")
                        .arg(&key)
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await?;
                    if removed != 1 {
                        return Ok(None);
                    }

                    job.fails = 0;
                    self.push_ready(&job).await?;
                    return Ok(Some(job));
                }
            }
        }

        Ok(None)
    }

    /// Purge scheduled entries whose run-at lies further in the past
    /// than `horizon_secs`. Returns the number removed.
    pub async fn clear_outdated_scheduled(&self, horizon_secs: i64) -> Result<usize> {
        let key = keys::scheduled(self.ns());
        let cutoff = chrono::Utc::now().timestamp() - horizon_secs;
        let mut conn = self.redis.conn().await?;

        let removed: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;

        Ok(removed as usize)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Heartbeats
    // ─────────────────────────────────────────────────────────────────────────

    /// Refresh this pool's heartbeat record.
    pub async fn write_heartbeat(&self, hb: &Heartbeat) -> Result<()> {
        let key = keys::pool_heartbeat(self.ns(), &hb.worker_pool_id);
        let pools = keys::pools(self.ns());
        let mut conn = self.redis.conn().await?;

        redis::cmd("HSET")
            .arg(&key)
            .arg("worker_pool_id")
            .arg(&hb.worker_pool_id)
            .arg("started_at")
            .arg(hb.started_at)
            .arg("heartbeat_at")
            .arg(hb.heartbeat_at)
            .arg("job_names")
            .arg(hb.job_names.join(","))
            .arg("concurrency")
            .arg(hb.concurrency)
            .query_async::<_, i64>(&mut conn)
            .await?;

        redis::cmd("SADD")
            .arg(&pools)
            .arg(&hb.worker_pool_id)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    /// Read the heartbeats of every registered pool.
    pub async fn read_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        let pools = keys::pools(self.ns());
        let mut conn = self.redis.conn().await?;

        let ids: Vec<String> = redis::cmd("SMEMBERS").arg(&pools).query_async(&mut conn).await?;

        let mut heartbeats = Vec::with_capacity(ids.len());
        for id in ids {
            let key = keys::pool_heartbeat(self.ns(), &id);
            let fields: HashMap<String, String> =
                redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;
            if fields.is_empty() {
                continue;
            }

            heartbeats.push(Heartbeat {
                worker_pool_id: id,
                started_at: fields
                    .get("started_at")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                heartbeat_at: fields
                    .get("heartbeat_at")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                job_names: fields
                    .get("job_names")
                    .map(|v| v.split(',').map(String::from).collect())
                    .unwrap_or_default(),
                concurrency: fields
                    .get("concurrency")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            });
        }

        Ok(heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_job_roundtrip() {
        let mut params = Parameters::new();
        params.insert("image".into(), serde_json::json!("library/nginx"));
        let job = QueuedJob::new("abc", "demo", params, true);

        let payload = serde_json::to_string(&job).unwrap();
        let back: QueuedJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.fails, 0);
        assert!(back.run_at.is_none());
    }

    #[test]
    fn test_deterministic_payload_bytes() {
        // Periodic children rely on byte-identical payloads for ZADD NX
        // idempotency; the serialized form must not depend on insertion
        // order of parameters.
        let mut p1 = Parameters::new();
        p1.insert("b".into(), serde_json::json!(2));
        p1.insert("a".into(), serde_json::json!(1));

        let mut p2 = Parameters::new();
        p2.insert("a".into(), serde_json::json!(1));
        p2.insert("b".into(), serde_json::json!(2));

        let mut j1 = QueuedJob::new("id", "demo", p1, false);
        let mut j2 = QueuedJob::new("id", "demo", p2, false);
        j1.enqueued_at = 100;
        j2.enqueued_at = 100;
        j1.run_at = Some(200);
        j2.run_at = Some(200);

        assert_eq!(
            serde_json::to_string(&j1).unwrap(),
            serde_json::to_string(&j2).unwrap()
        );
    }
}
