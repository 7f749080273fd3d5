//! Redis key layout.
//!
//! All keys carry the brace-wrapped namespace prefix so one deployment
//! stays inside a single cluster hash slot.

/// Hash holding the stats record of one job.
pub fn job_stats(ns: &str, job_id: &str) -> String {
    format!("{}:job_stats:{}", ns, job_id)
}

/// Ready queue (list) for one registered job name.
pub fn queue(ns: &str, job_name: &str) -> String {
    format!("{}:queue:{}", ns, job_name)
}

/// In-progress list of one worker pool instance.
pub fn in_progress(ns: &str, pool_id: &str) -> String {
    format!("{}:inprogress:{}", ns, pool_id)
}

/// Sorted set of scheduled jobs, scored by run-at time.
pub fn scheduled(ns: &str) -> String {
    format!("{}:scheduled", ns)
}

/// Sorted set of jobs awaiting retry, scored by retry-at time.
pub fn retry(ns: &str) -> String {
    format!("{}:retry", ns)
}

/// Sorted set of dead jobs, scored by die-at time.
pub fn dead(ns: &str) -> String {
    format!("{}:dead", ns)
}

/// Unique-job deduplication marker for one parameters digest.
pub fn unique_job(ns: &str, digest: &str) -> String {
    format!("{}:unique_jobs:{}", ns, digest)
}

/// Hash mapping job id to status hook URL.
pub fn hooks(ns: &str) -> String {
    format!("{}:hooks", ns)
}

/// Control-command mailbox of one job.
pub fn command(ns: &str, job_id: &str) -> String {
    format!("{}:cmd:{}", ns, job_id)
}

/// Sorted set of periodic job policies, scored by creation time.
pub fn periodic_policies(ns: &str) -> String {
    format!("{}:periodic_policies", ns)
}

/// Election lock for the periodic enqueuer.
pub fn periodic_enqueuer_lock(ns: &str) -> String {
    format!("{}:periodic_enqueuer_lock", ns)
}

/// Execution links of one periodic policy, scored by scheduled run-at.
pub fn executions(ns: &str, policy_id: &str) -> String {
    format!("{}:exec:{}", ns, policy_id)
}

/// Pub/sub channel for policy, hook and command notifications.
pub fn notifications(ns: &str) -> String {
    format!("{}:period:notifications", ns)
}

/// Hash holding the heartbeat of one worker pool instance.
pub fn pool_heartbeat(ns: &str, pool_id: &str) -> String {
    format!("{}:pool:{}", ns, pool_id)
}

/// Set of known worker pool ids.
pub fn pools(ns: &str) -> String {
    format!("{}:pools", ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let ns = "{testing}";
        assert_eq!(job_stats(ns, "abc"), "{testing}:job_stats:abc");
        assert_eq!(queue(ns, "demo"), "{testing}:queue:demo");
        assert_eq!(scheduled(ns), "{testing}:scheduled");
        assert_eq!(unique_job(ns, "d1"), "{testing}:unique_jobs:d1");
        assert_eq!(command(ns, "abc"), "{testing}:cmd:abc");
        assert_eq!(notifications(ns), "{testing}:period:notifications");
        assert_eq!(executions(ns, "p1"), "{testing}:exec:p1");
    }
}
