//! Unique-job deduplication.
//!
//! A job declared unique holds a marker keyed by the digest of its
//! (name, parameters). The marker exists exactly while the job is
//! alive; any terminal transition releases it, and a 24 hour TTL
//! covers crash recovery.

use sha2::{Digest, Sha256};

use crate::error::{Result, StevedoreError};
use crate::jobs::Parameters;
use crate::db::{keys, RedisPool};

/// Marker TTL covering crashed executions.
const UNIQUE_TTL_SECS: i64 = 24 * 3600;

/// Digest of a (name, parameters) pair.
///
/// Parameters serialize with ordered keys, so the digest is stable
/// across nodes and submission order.
pub fn parameters_digest(name: &str, params: &Parameters) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    if let Ok(encoded) = serde_json::to_vec(params) {
        hasher.update(&encoded);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct DeDuplicator {
    redis: RedisPool,
}

impl DeDuplicator {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    /// Claim the unique marker for a job, returning its digest.
    ///
    /// Fails with `ConflictError` when a live job already holds it.
    pub async fn claim(&self, name: &str, params: &Parameters) -> Result<String> {
        let digest = parameters_digest(name, params);
        let key = keys::unique_job(self.redis.namespace(), &digest);
        let mut conn = self.redis.conn().await?;

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(name)
            .arg("NX")
            .arg("EX")
            .arg(UNIQUE_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        match set {
            Some(_) => Ok(digest),
            None => Err(StevedoreError::conflict(name)),
        }
    }

    /// Release the unique marker of a job.
    pub async fn release(&self, name: &str, params: &Parameters) -> Result<()> {
        let digest = parameters_digest(name, params);
        self.release_digest(&digest).await
    }

    /// Release a marker by its digest.
    pub async fn release_digest(&self, digest: &str) -> Result<()> {
        let key = keys::unique_job(self.redis.namespace(), digest);
        let mut conn = self.redis.conn().await?;
        redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_under_key_order() {
        let mut p1 = Parameters::new();
        p1.insert("b".into(), serde_json::json!(2));
        p1.insert("a".into(), serde_json::json!(1));

        let mut p2 = Parameters::new();
        p2.insert("a".into(), serde_json::json!(1));
        p2.insert("b".into(), serde_json::json!(2));

        assert_eq!(parameters_digest("demo", &p1), parameters_digest("demo", &p2));
    }

    #[test]
    fn test_digest_distinguishes_name_and_params() {
        let mut p1 = Parameters::new();
        p1.insert("a".into(), serde_json::json!(1));
        let mut p2 = Parameters::new();
        p2.insert("a".into(), serde_json::json!(2));

        assert_ne!(parameters_digest("demo", &p1), parameters_digest("demo", &p2));
        assert_ne!(parameters_digest("demo", &p1), parameters_digest("other", &p1));
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = parameters_digest("demo", &Parameters::new());
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
