//! Periodic policy scheduling.
//!
//! Stores cron policies in the namespaced sorted set and keeps the
//! per-node cache consistent through the message bus. Materializing
//! upcoming runs is the enqueuer's task.

use uuid::Uuid;

use crate::error::{Result, StevedoreError};
use crate::jobs::Parameters;
use crate::mq::{BusEvent, MessageServer};
use crate::period::policy::{PeriodicJobPolicy, PolicyCache, PolicyStore};
use crate::period::parse_cron_spec;
use crate::db::RedisPool;

pub struct Scheduler {
    store: PolicyStore,
    cache: PolicyCache,
    bus: MessageServer,
}

impl Scheduler {
    pub fn new(redis: RedisPool, bus: MessageServer) -> Self {
        Self {
            store: PolicyStore::new(redis),
            cache: PolicyCache::new(),
            bus,
        }
    }

    /// Store a new cron policy and broadcast it to every node.
    ///
    /// Returns the policy id and the next trigger time.
    pub async fn schedule(
        &self,
        job_name: &str,
        params: Parameters,
        cron_spec: &str,
    ) -> Result<(String, i64)> {
        let schedule = parse_cron_spec(cron_spec)?;
        let next_run = schedule
            .upcoming(chrono::Utc)
            .next()
            .map(|t| t.timestamp())
            .ok_or_else(|| {
                StevedoreError::new(
                    crate::error::ErrorCode::InvalidCronSpec,
                    format!("cron spec '{}' never fires", cron_spec),
                )
            })?;

        let policy = PeriodicJobPolicy {
            policy_id: Uuid::new_v4().simple().to_string(),
            job_name: job_name.to_string(),
            parameters: params,
            cron_spec: cron_spec.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };

        self.store.add(&policy).await?;
        self.bus
            .publish(&BusEvent::SchedulePeriodicPolicy(policy.clone()))
            .await?;

        // The bus delivers to this node as well, but priming the cache
        // now removes the round-trip window.
        let policy_id = policy.policy_id.clone();
        self.cache.accept(policy);

        Ok((policy_id, next_run))
    }

    /// Remove a policy everywhere.
    pub async fn unschedule(&self, policy_id: &str) -> Result<()> {
        let removed = self
            .store
            .remove(policy_id)
            .await?
            .ok_or_else(|| StevedoreError::job_not_found(policy_id))?;

        self.bus
            .publish(&BusEvent::UnSchedulePeriodicPolicy(removed))
            .await?;
        self.cache.remove(policy_id);
        Ok(())
    }

    /// Rebuild the cache from the store. Returns the policy count.
    pub async fn load(&self) -> Result<usize> {
        let policies = self.store.load_all().await?;
        self.cache.clear();
        for policy in policies {
            self.cache.accept(policy);
        }
        Ok(self.cache.len())
    }

    /// Accept a policy pushed by a remote node (bus handler).
    pub fn accept(&self, policy: PeriodicJobPolicy) {
        self.cache.accept(policy);
    }

    /// Evict a policy from the cache only (bus handler on remote nodes).
    pub fn remove(&self, policy_id: &str) -> Option<PeriodicJobPolicy> {
        self.cache.remove(policy_id)
    }

    /// Snapshot of all cached policies.
    pub fn policies(&self) -> Vec<PeriodicJobPolicy> {
        self.cache.snapshot()
    }
}
