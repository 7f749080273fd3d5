//! Job stats manager.
//!
//! The authoritative job records live in Redis hashes. Non-critical
//! writes flow through a bounded channel drained by a single writer
//! task; status changes and all reads are synchronous Redis calls.
//! The manager also owns the control-command mailbox, the hook
//! registry and the execution links of periodic policies.

use std::collections::HashMap;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};

use crate::error::{Result, StevedoreError};
use crate::jobs::{CtlCommand, JobStats, JobStatus, HOOK_STATUS_ACTIVATED, HOOK_STATUS_ERROR};
use crate::mq::{BusEvent, CommandData, HookData, MessageServer};
use crate::db::{keys, RedisPool};
use crate::stats::hooks::{HookClient, HookEvent, HookEventMetadata};

/// TTL of a job stats record (and its command mailbox).
const STATS_EXPIRE_SECS: i64 = 7 * 24 * 3600;

/// Shortened TTL applied when a periodic parent is expired.
const PERIODIC_EXPIRE_SECS: i64 = 3600;

/// Capacity of the writer channel.
const WRITE_CHANNEL_CAPACITY: usize = 1024;

/// Write operations drained by the writer task.
enum StatsOp {
    Save(JobStats),
    Update {
        job_id: String,
        pairs: Vec<(String, String)>,
    },
    CheckIn {
        job_id: String,
        message: String,
    },
    DieAt {
        job_id: String,
        die_at: i64,
    },
}

struct Inner {
    redis: RedisPool,
    bus: MessageServer,
    hooks: HookClient,
    commands: DashMap<String, CtlCommand>,
    hook_urls: DashMap<String, String>,
    tx: mpsc::Sender<StatsOp>,
    rx: Mutex<Option<mpsc::Receiver<StatsOp>>>,
}

/// Handle to the stats manager; cloning shares the same state.
#[derive(Clone)]
pub struct StatsManager {
    inner: std::sync::Arc<Inner>,
}

impl StatsManager {
    pub fn new(redis: RedisPool, bus: MessageServer) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        Self {
            inner: std::sync::Arc::new(Inner {
                redis,
                bus,
                hooks: HookClient::new(),
                commands: DashMap::new(),
                hook_urls: DashMap::new(),
                tx,
                rx: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Start the writer task. Non-blocking; call once.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self
            .inner
            .rx
            .lock()
            .await
            .take()
            .expect("stats manager started twice");
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    op = rx.recv() => {
                        match op {
                            Some(op) => this.apply(op).await,
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            // Drain whatever is already queued.
                            while let Ok(op) = rx.try_recv() {
                                this.apply(op).await;
                            }
                            break;
                        }
                    }
                }
            }
            debug!("stats manager writer stopped");
        });
    }

    fn ns(&self) -> &str {
        self.inner.redis.namespace()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Record CRUD
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a record save. Fire-and-forget; on channel overflow the
    /// write is logged and dropped.
    pub fn save(&self, stats: JobStats) {
        self.enqueue_op(StatsOp::Save(stats));
    }

    /// Queue a field update on a record.
    pub async fn update(&self, job_id: &str, pairs: Vec<(String, String)>) {
        self.enqueue_op(StatsOp::Update {
            job_id: job_id.to_string(),
            pairs,
        });
    }

    /// Queue an in-progress check-in message.
    pub async fn check_in(&self, job_id: &str, message: &str) {
        self.enqueue_op(StatsOp::CheckIn {
            job_id: job_id.to_string(),
            message: message.to_string(),
        });
    }

    /// Queue the dead-letter timestamp of a job.
    pub async fn die_at(&self, job_id: &str, die_at: i64) {
        self.enqueue_op(StatsOp::DieAt {
            job_id: job_id.to_string(),
            die_at,
        });
    }

    /// Read a record back. Synchronous; missing records are `JobNotFound`.
    pub async fn retrieve(&self, job_id: &str) -> Result<JobStats> {
        let key = keys::job_stats(self.ns(), job_id);
        let mut conn = self.inner.redis.conn().await?;

        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;

        if fields.is_empty() {
            return Err(StevedoreError::job_not_found(job_id));
        }

        JobStats::from_hash(&fields)
    }

    /// Move a record to a new status, enforcing the transition rules.
    ///
    /// Terminal statuses trigger webhook notification. Synchronous so
    /// lifecycle transitions are never lost to channel overflow.
    pub async fn set_job_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let key = keys::job_stats(self.ns(), job_id);
        let mut conn = self.inner.redis.conn().await?;

        let current: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg("status")
            .query_async(&mut conn)
            .await?;

        let Some(current) = current else {
            warn!(job_id, status = %status, "status update for unknown job dropped");
            return Ok(());
        };

        let current: JobStatus = current.parse()?;
        if !current.can_transition(status) {
            debug!(job_id, from = %current, to = %status, "illegal status transition skipped");
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        redis::cmd("HSET")
            .arg(&key)
            .arg("status")
            .arg(status.to_string())
            .arg("update_time")
            .arg(now)
            .query_async::<_, i64>(&mut conn)
            .await?;

        counter!("stevedore_job_status_total", "status" => status.to_string()).increment(1);

        if status.is_terminal() {
            self.fire_hook_event(job_id, status, None).await;
        }

        Ok(())
    }

    /// Shorten the TTL of a periodic parent record.
    pub async fn expire_periodic_job_stats(&self, job_id: &str) -> Result<()> {
        let key = keys::job_stats(self.ns(), job_id);
        let mut conn = self.inner.redis.conn().await?;
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(PERIODIC_EXPIRE_SECS)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control-command mailbox
    // ─────────────────────────────────────────────────────────────────────────

    /// Fire a control command at a job.
    ///
    /// `is_cached` writes only the local mailbox (the bus handler path
    /// on remote nodes); otherwise the command is persisted and
    /// broadcast so every node caches it.
    pub async fn send_command(&self, job_id: &str, command: CtlCommand, is_cached: bool) -> Result<()> {
        if !is_cached {
            let key = keys::command(self.ns(), job_id);
            let mut conn = self.inner.redis.conn().await?;
            redis::cmd("SET")
                .arg(&key)
                .arg(command.as_str())
                .arg("EX")
                .arg(STATS_EXPIRE_SECS)
                .query_async::<_, ()>(&mut conn)
                .await?;

            self.inner
                .bus
                .publish(&BusEvent::FireCommand(CommandData {
                    job_id: job_id.to_string(),
                    command,
                }))
                .await?;
        }

        self.inner.commands.insert(job_id.to_string(), command);
        Ok(())
    }

    /// Read the local command mailbox of a job.
    pub fn ctl_command(&self, job_id: &str) -> Option<CtlCommand> {
        self.inner.commands.get(job_id).map(|c| *c.value())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hook registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a status hook URL for a job, with the same caching
    /// discipline as commands.
    pub async fn register_hook(&self, job_id: &str, hook_url: &str, is_cached: bool) -> Result<()> {
        if !is_cached {
            let key = keys::hooks(self.ns());
            let mut conn = self.inner.redis.conn().await?;
            redis::cmd("HSET")
                .arg(&key)
                .arg(job_id)
                .arg(hook_url)
                .query_async::<_, i64>(&mut conn)
                .await?;

            self.inner
                .bus
                .publish(&BusEvent::RegisterStatusHook(HookData {
                    job_id: job_id.to_string(),
                    hook_url: hook_url.to_string(),
                }))
                .await?;
        }

        self.inner
            .hook_urls
            .insert(job_id.to_string(), hook_url.to_string());
        Ok(())
    }

    /// Look up the hook URL of a job: local cache first, Redis second.
    pub async fn get_hook(&self, job_id: &str) -> Option<String> {
        if let Some(url) = self.inner.hook_urls.get(job_id) {
            return Some(url.clone());
        }

        let key = keys::hooks(self.ns());
        let mut conn = self.inner.redis.conn().await.ok()?;
        let url: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .ok()?;

        if let Some(ref url) = url {
            self.inner.hook_urls.insert(job_id.to_string(), url.clone());
        }
        url
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution links
    // ─────────────────────────────────────────────────────────────────────────

    /// Link a child execution to its upstream job, scored by run-at.
    pub async fn attach_execution_at(&self, upstream_job_id: &str, job_id: &str, score: i64) {
        let key = keys::executions(self.ns(), upstream_job_id);
        match self.inner.redis.conn().await {
            Ok(mut conn) => {
                if let Err(e) = redis::cmd("ZADD")
                    .arg(&key)
                    .arg(score)
                    .arg(job_id)
                    .query_async::<_, i64>(&mut conn)
                    .await
                {
                    error!(upstream_job_id, job_id, error = %e, "attach execution failed");
                }
            }
            Err(e) => error!(upstream_job_id, job_id, error = %e, "attach execution failed"),
        }
    }

    /// Link a child execution scored by the current time.
    pub async fn attach_execution(&self, upstream_job_id: &str, job_id: &str) {
        self.attach_execution_at(upstream_job_id, job_id, chrono::Utc::now().timestamp())
            .await;
    }

    /// Child executions of an upstream job with run-at >= `start`
    /// (unbounded when `None`).
    pub async fn get_executions(&self, upstream_job_id: &str, start: Option<i64>) -> Result<Vec<String>> {
        let key = keys::executions(self.ns(), upstream_job_id);
        let mut conn = self.inner.redis.conn().await?;

        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(&key);
        match start {
            Some(start) => cmd.arg(start),
            None => cmd.arg("-inf"),
        };
        cmd.arg("+inf");

        Ok(cmd.query_async(&mut conn).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writer task
    // ─────────────────────────────────────────────────────────────────────────

    fn enqueue_op(&self, op: StatsOp) {
        if self.inner.tx.try_send(op).is_err() {
            warn!("stats write channel full, dropping non-critical update");
            counter!("stevedore_stats_writes_dropped_total").increment(1);
        }
    }

    async fn apply(&self, op: StatsOp) {
        let result = match op {
            StatsOp::Save(stats) => self.write_save(stats).await,
            StatsOp::Update { job_id, pairs } => self.write_update(&job_id, pairs).await,
            StatsOp::CheckIn { job_id, message } => self.write_check_in(&job_id, &message).await,
            StatsOp::DieAt { job_id, die_at } => {
                self.write_update(
                    &job_id,
                    vec![("die_at".to_string(), die_at.to_string())],
                )
                .await
            }
        };

        if let Err(e) = result {
            error!(error = %e, "stats write failed");
        }
    }

    async fn write_save(&self, stats: JobStats) -> Result<()> {
        let key = keys::job_stats(self.ns(), &stats.job_id);
        let mut conn = self.inner.redis.conn().await?;

        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key);
        for (field, value) in stats.to_field_pairs() {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, i64>(&mut conn).await?;

        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(STATS_EXPIRE_SECS)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn write_update(&self, job_id: &str, pairs: Vec<(String, String)>) -> Result<()> {
        let key = keys::job_stats(self.ns(), job_id);
        let mut conn = self.inner.redis.conn().await?;

        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key);
        for (field, value) in pairs {
            cmd.arg(field).arg(value);
        }
        cmd.arg("update_time")
            .arg(chrono::Utc::now().timestamp());
        cmd.query_async::<_, i64>(&mut conn).await?;
        Ok(())
    }

    async fn write_check_in(&self, job_id: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.write_update(
            job_id,
            vec![
                ("check_in".to_string(), message.to_string()),
                ("check_in_at".to_string(), now.to_string()),
            ],
        )
        .await?;

        // A check-in is also delivered to the status hook.
        let status = self
            .retrieve(job_id)
            .await
            .map(|s| s.status)
            .unwrap_or(JobStatus::Running);
        self.fire_hook_event(job_id, status, Some(message.to_string()))
            .await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Webhook firing
    // ─────────────────────────────────────────────────────────────────────────

    /// Deliver a status event to the registered hook, if any. Delivery
    /// runs in its own task; the outcome lands in `hook_status`.
    async fn fire_hook_event(&self, job_id: &str, status: JobStatus, check_in: Option<String>) {
        let Some(url) = self.get_hook(job_id).await else {
            return;
        };

        let stats = match self.retrieve(job_id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(job_id, error = %e, "hook event skipped, record unavailable");
                return;
            }
        };

        let event = HookEvent {
            job_id: job_id.to_string(),
            status,
            check_in,
            revision: stats.update_time,
            metadata: HookEventMetadata {
                kind: stats.kind,
                unique: stats.unique,
            },
        };

        let this = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let outcome = match this.inner.hooks.deliver(&url, &event).await {
                Ok(()) => HOOK_STATUS_ACTIVATED,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "status hook delivery gave up");
                    HOOK_STATUS_ERROR
                }
            };

            if let Err(e) = this
                .write_update(
                    &job_id,
                    vec![("hook_status".to_string(), outcome.to_string())],
                )
                .await
            {
                error!(job_id = %job_id, error = %e, "recording hook status failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_command_mailbox() {
        let redis = RedisPool::new("redis://localhost:6379", "testing").unwrap();
        let bus = MessageServer::new(redis.clone());
        let mgr = StatsManager::new(redis, bus);

        assert!(mgr.ctl_command("j1").is_none());
        mgr.inner.commands.insert("j1".to_string(), CtlCommand::Stop);
        assert_eq!(mgr.ctl_command("j1"), Some(CtlCommand::Stop));
    }
}
