//! Job definitions: the job capability trait, kinds, statuses, control
//! commands, retry backoff and the request/stats data model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Result, StevedoreError};
use crate::jobs::context::JobContext;

/// Job parameters as submitted by the caller.
///
/// `serde_json::Map` keeps keys ordered, which makes parameter digests
/// stable across nodes.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Default failure ceiling applied when a job reports `max_fails() == 0`.
pub const DEFAULT_MAX_FAILS: u32 = 4;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// The three execution modes a job can be submitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Run as soon as a worker is free
    Generic,
    /// Run once after a delay
    Scheduled,
    /// Run repeatedly on a cron policy
    Periodic,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "Generic"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Periodic => write!(f, "Periodic"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Generic" => Ok(Self::Generic),
            "Scheduled" => Ok(Self::Scheduled),
            "Periodic" => Ok(Self::Periodic),
            other => Err(StevedoreError::validation(format!(
                "job kind '{}' is not supported",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in the ready queue
    Pending,
    /// Waiting in the scheduled set for its run-at time
    Scheduled,
    /// Currently executing on a worker
    Running,
    /// Finished without error
    Success,
    /// Finished with an error (may be retried or dead-lettered)
    Error,
    /// Stopped by a control command
    Stopped,
    /// Cancelled by a control command (may be retried)
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses trigger webhook notification.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Stopped | Self::Cancelled)
    }

    /// Whether a record may move from `self` to `to`.
    ///
    /// `Success` and `Stopped` are absorbing; `Error` and `Cancelled`
    /// stay open for the retry path back through `Pending`/`Running`.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        if *self == to {
            return true;
        }
        match self {
            Self::Pending => matches!(to, Self::Running | Self::Stopped | Self::Error),
            Self::Scheduled => matches!(to, Self::Pending | Self::Running | Self::Stopped),
            Self::Running => {
                matches!(to, Self::Success | Self::Error | Self::Stopped | Self::Cancelled)
            }
            Self::Error => matches!(to, Self::Pending | Self::Running),
            Self::Cancelled => matches!(to, Self::Pending | Self::Running),
            Self::Success | Self::Stopped => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Scheduled" => Ok(Self::Scheduled),
            "Running" => Ok(Self::Running),
            "Success" => Ok(Self::Success),
            "Error" => Ok(Self::Error),
            "Stopped" => Ok(Self::Stopped),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(StevedoreError::internal(format!("unknown job status '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Control Commands
// ═══════════════════════════════════════════════════════════════════════════════

/// Control commands the mailbox can carry; at most one is pending per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtlCommand {
    Stop,
    Cancel,
    Retry,
}

impl CtlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "cancel" => Some(Self::Cancel),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for CtlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type returned from a job run.
///
/// `Stopped` and `Cancelled` are the cooperative exits a job takes after
/// observing the matching control command; anything else is a failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("job received stop command")]
    Stopped,

    #[error("job received cancel command")]
    Cancelled,

    #[error("{0}")]
    Failed(#[from] anyhow::Error),
}

impl RunError {
    /// Create a plain failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(anyhow::anyhow!(message.into()))
    }
}

/// Result type for job execution.
pub type RunResult = std::result::Result<(), RunError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The capability set every registered job type must implement.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Maximum failures before the job is dead-lettered.
    ///
    /// Returning 0 selects the pool default of [`DEFAULT_MAX_FAILS`].
    fn max_fails(&self) -> u32 {
        0
    }

    /// Whether a failed run should be retried at all.
    ///
    /// When this returns false the first failure goes straight to the
    /// dead set regardless of `max_fails`.
    fn should_retry(&self) -> bool {
        true
    }

    /// Validate the submitted parameters before the job is enqueued.
    fn validate(&self, params: &Parameters) -> Result<()>;

    /// Execute the job.
    ///
    /// Long-running jobs should poll `ctx.op_command()` and return
    /// [`RunError::Stopped`] or [`RunError::Cancelled`] when asked to.
    async fn run(&self, ctx: &JobContext, params: Parameters) -> RunResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 15,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Request Model
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata of a job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Execution mode
    pub kind: JobKind,

    /// When true, at most one live job may exist per (name, parameters)
    #[serde(default)]
    pub unique: bool,

    /// Required for `Scheduled` jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_delay_seconds: Option<u64>,

    /// Required for `Periodic` jobs; 6-field cron expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// A job submission as accepted on the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Registered job type name
    pub name: String,

    /// Parameters handed to the job; validated by the job type
    #[serde(default)]
    pub parameters: Parameters,

    /// Execution metadata
    pub metadata: JobMetadata,

    /// Optional absolute URL receiving JSON status notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hook: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stats Model
// ═══════════════════════════════════════════════════════════════════════════════

/// Hook registration outcome recorded on the stats record.
pub const HOOK_STATUS_ACTIVATED: &str = "activated";
/// Hook registration or delivery failure marker.
pub const HOOK_STATUS_ERROR: &str = "error";

/// The authoritative record of a single job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStats {
    pub job_id: String,
    pub name: String,
    pub kind: JobKind,
    #[serde(default)]
    pub unique: bool,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_digest: Option<String>,
    pub enqueue_time: i64,
    pub update_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    /// Unix time the job entered the dead set; 0 while alive
    #[serde(default)]
    pub die_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_spec: Option<String>,
    /// Path to query this record
    pub ref_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_status: Option<String>,
    /// True for periodic parents and jobs that launched sub-jobs
    #[serde(default)]
    pub is_multiple_executions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_job_id: Option<String>,
}

impl JobStats {
    /// Build a fresh record for an accepted job.
    pub fn new(job_id: &str, name: &str, kind: JobKind, unique: bool, status: JobStatus) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            kind,
            unique,
            status,
            parameters_digest: None,
            enqueue_time: now,
            update_time: now,
            run_at: None,
            die_at: 0,
            check_in: None,
            check_in_at: None,
            cron_spec: None,
            ref_link: format!("/api/v1/jobs/{}", job_id),
            hook_status: None,
            is_multiple_executions: false,
            upstream_job_id: None,
        }
    }

    /// Flatten into field/value pairs for the Redis hash.
    pub fn to_field_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("job_id".into(), self.job_id.clone()),
            ("name".into(), self.name.clone()),
            ("kind".into(), self.kind.to_string()),
            ("unique".into(), self.unique.to_string()),
            ("status".into(), self.status.to_string()),
            ("enqueue_time".into(), self.enqueue_time.to_string()),
            ("update_time".into(), self.update_time.to_string()),
            ("die_at".into(), self.die_at.to_string()),
            ("ref_link".into(), self.ref_link.clone()),
            (
                "is_multiple_executions".into(),
                self.is_multiple_executions.to_string(),
            ),
        ];

        if let Some(ref v) = self.parameters_digest {
            pairs.push(("parameters_digest".into(), v.clone()));
        }
        if let Some(v) = self.run_at {
            pairs.push(("run_at".into(), v.to_string()));
        }
        if let Some(ref v) = self.check_in {
            pairs.push(("check_in".into(), v.clone()));
        }
        if let Some(v) = self.check_in_at {
            pairs.push(("check_in_at".into(), v.to_string()));
        }
        if let Some(ref v) = self.cron_spec {
            pairs.push(("cron_spec".into(), v.clone()));
        }
        if let Some(ref v) = self.hook_status {
            pairs.push(("hook_status".into(), v.clone()));
        }
        if let Some(ref v) = self.upstream_job_id {
            pairs.push(("upstream_job_id".into(), v.clone()));
        }

        pairs
    }

    /// Rebuild a record from the Redis hash fields.
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| -> Result<&String> {
            fields
                .get(k)
                .ok_or_else(|| StevedoreError::internal(format!("job stats field '{}' missing", k)))
        };

        Ok(Self {
            job_id: get("job_id")?.clone(),
            name: get("name")?.clone(),
            kind: get("kind")?.parse()?,
            unique: fields.get("unique").map(|v| v == "true").unwrap_or(false),
            status: get("status")?.parse()?,
            parameters_digest: fields.get("parameters_digest").cloned(),
            enqueue_time: get("enqueue_time")?.parse().unwrap_or(0),
            update_time: get("update_time")?.parse().unwrap_or(0),
            run_at: fields.get("run_at").and_then(|v| v.parse().ok()),
            die_at: fields.get("die_at").and_then(|v| v.parse().ok()).unwrap_or(0),
            check_in: fields.get("check_in").cloned(),
            check_in_at: fields.get("check_in_at").and_then(|v| v.parse().ok()),
            cron_spec: fields.get("cron_spec").cloned(),
            ref_link: get("ref_link")?.clone(),
            hook_status: fields.get("hook_status").cloned(),
            is_multiple_executions: fields
                .get("is_multiple_executions")
                .map(|v| v == "true")
                .unwrap_or(false),
            upstream_job_id: fields.get("upstream_job_id").cloned(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pool Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Health classification of a worker pool heartbeat.
pub const POOL_STATUS_HEALTHY: &str = "Healthy";
/// A pool whose last heartbeat is older than the dead horizon.
pub const POOL_STATUS_DEAD: &str = "Dead";

/// Heartbeat snapshot of one worker pool instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatsEntry {
    pub worker_pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
    pub status: String,
}

/// Aggregated stats across all worker pools of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pools: Vec<PoolStatsEntry>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_roundtrip() {
        for kind in [JobKind::Generic, JobKind::Scheduled, JobKind::Periodic] {
            let s = kind.to_string();
            assert_eq!(s.parse::<JobKind>().unwrap(), kind);
        }
        assert!("generic".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;

        assert!(Pending.can_transition(Running));
        assert!(Scheduled.can_transition(Pending));
        assert!(Scheduled.can_transition(Stopped));
        assert!(Running.can_transition(Success));
        assert!(Running.can_transition(Cancelled));
        assert!(Error.can_transition(Pending));
        assert!(Cancelled.can_transition(Running));

        // Absorbing states never transition away.
        assert!(!Success.can_transition(Running));
        assert!(!Stopped.can_transition(Pending));
        assert!(!Success.can_transition(Error));

        // Re-asserting the same status is a no-op, not a violation.
        assert!(Success.can_transition(Success));
    }

    #[test]
    fn test_ctl_command_parse() {
        assert_eq!(CtlCommand::parse("stop"), Some(CtlCommand::Stop));
        assert_eq!(CtlCommand::parse("cancel"), Some(CtlCommand::Cancel));
        assert_eq!(CtlCommand::parse("retry"), Some(CtlCommand::Retry));
        assert_eq!(CtlCommand::parse("pause"), None);
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay_secs: 1,
            max_delay_secs: 100,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(10);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_secs(10));
    }

    #[test]
    fn test_stats_hash_roundtrip() {
        let mut stats = JobStats::new("abc123", "demo", JobKind::Scheduled, true, JobStatus::Scheduled);
        stats.run_at = Some(1_700_000_000);
        stats.cron_spec = Some("0 * * * * *".into());
        stats.hook_status = Some(HOOK_STATUS_ACTIVATED.into());
        stats.upstream_job_id = Some("policy-1".into());

        let fields: HashMap<String, String> = stats.to_field_pairs().into_iter().collect();
        let rebuilt = JobStats::from_hash(&fields).unwrap();

        assert_eq!(rebuilt.job_id, "abc123");
        assert_eq!(rebuilt.kind, JobKind::Scheduled);
        assert_eq!(rebuilt.status, JobStatus::Scheduled);
        assert!(rebuilt.unique);
        assert_eq!(rebuilt.run_at, Some(1_700_000_000));
        assert_eq!(rebuilt.cron_spec.as_deref(), Some("0 * * * * *"));
        assert_eq!(rebuilt.upstream_job_id.as_deref(), Some("policy-1"));
        assert_eq!(rebuilt.ref_link, "/api/v1/jobs/abc123");
    }

    #[test]
    fn test_request_deserialization() {
        let body = r#"{
            "name": "demo",
            "metadata": {"kind": "Generic", "unique": true},
            "parameters": {"a": 1}
        }"#;
        let req: JobRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.name, "demo");
        assert_eq!(req.metadata.kind, JobKind::Generic);
        assert!(req.metadata.unique);
        assert!(req.status_hook.is_none());
        assert_eq!(req.parameters.get("a").and_then(|v| v.as_i64()), Some(1));
    }
}
