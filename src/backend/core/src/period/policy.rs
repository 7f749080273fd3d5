//! Periodic job policies: the persistent sorted-set store and the
//! per-node in-memory cache kept consistent by the message bus.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jobs::Parameters;
use crate::db::{keys, RedisPool};

/// A stored cron policy that produces scheduled child jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicJobPolicy {
    pub policy_id: String,
    pub job_name: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub cron_spec: String,
    pub created_at: i64,
}

/// Redis-backed policy store.
///
/// Policies live as JSON members of a sorted set scored by creation
/// time; the member bytes are the canonical identity, so removal goes
/// through a scan-and-match on the policy id.
#[derive(Clone)]
pub struct PolicyStore {
    redis: RedisPool,
}

impl PolicyStore {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    /// Persist a policy.
    pub async fn add(&self, policy: &PeriodicJobPolicy) -> Result<()> {
        let key = keys::periodic_policies(self.redis.namespace());
        let member = serde_json::to_string(policy)?;
        let mut conn = self.redis.conn().await?;
        redis::cmd("ZADD")
            .arg(&key)
            .arg(policy.created_at)
            .arg(&member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove a policy by id, returning it if it was stored.
    pub async fn remove(&self, policy_id: &str) -> Result<Option<PeriodicJobPolicy>> {
        let key = keys::periodic_policies(self.redis.namespace());
        let mut conn = self.redis.conn().await?;

        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        for member in members {
            if let Ok(policy) = serde_json::from_str::<PeriodicJobPolicy>(&member) {
                if policy.policy_id == policy_id {
                    redis::cmd("ZREM")
                        .arg(&key)
                        .arg(&member)
                        .query_async::<_, i64>(&mut conn)
                        .await?;
                    return Ok(Some(policy));
                }
            }
        }

        Ok(None)
    }

    /// Load every stored policy.
    pub async fn load_all(&self) -> Result<Vec<PeriodicJobPolicy>> {
        let key = keys::periodic_policies(self.redis.namespace());
        let mut conn = self.redis.conn().await?;

        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut policies = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<PeriodicJobPolicy>(&member) {
                Ok(policy) => policies.push(policy),
                Err(e) => tracing::warn!(error = %e, "skipping malformed periodic policy"),
            }
        }

        Ok(policies)
    }
}

/// Per-node policy cache, refreshed through the message bus.
#[derive(Default)]
pub struct PolicyCache {
    policies: DashMap<String, PeriodicJobPolicy>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, policy: PeriodicJobPolicy) {
        self.policies.insert(policy.policy_id.clone(), policy);
    }

    pub fn remove(&self, policy_id: &str) -> Option<PeriodicJobPolicy> {
        self.policies.remove(policy_id).map(|(_, p)| p)
    }

    pub fn clear(&self) {
        self.policies.clear();
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Snapshot of all cached policies.
    pub fn snapshot(&self) -> Vec<PeriodicJobPolicy> {
        self.policies.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> PeriodicJobPolicy {
        PeriodicJobPolicy {
            policy_id: id.to_string(),
            job_name: "demo".to_string(),
            parameters: Parameters::new(),
            cron_spec: "0 * * * * *".to_string(),
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_cache_accept_remove() {
        let cache = PolicyCache::new();
        cache.accept(sample("p1"));
        cache.accept(sample("p2"));
        assert_eq!(cache.len(), 2);

        let removed = cache.remove("p1").unwrap();
        assert_eq!(removed.policy_id, "p1");
        assert!(cache.remove("p1").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_policy_json_roundtrip() {
        let policy = sample("p1");
        let json = serde_json::to_string(&policy).unwrap();
        let back: PeriodicJobPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
