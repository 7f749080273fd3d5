//! Controller: validates requests and coordinates the work pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Result, StevedoreError};
use crate::joblog::{valid_log_id, JobLogStore};
use crate::jobs::{
    JobKind, JobRequest, JobStats, PoolStats, SubJobLauncher, HOOK_STATUS_ACTIVATED,
    HOOK_STATUS_ERROR,
};
use crate::period::parse_cron_spec;
use crate::pool::WorkerPool;

pub struct Controller {
    pool: Arc<WorkerPool>,
    logs: JobLogStore,
}

impl Controller {
    pub fn new(pool: Arc<WorkerPool>, logs: JobLogStore) -> Self {
        Self { pool, logs }
    }

    /// Validate a submission and dispatch it by kind.
    ///
    /// A failed hook registration marks `hook_status = "error"` but
    /// never fails the launch.
    pub async fn launch_job(&self, req: JobRequest) -> Result<JobStats> {
        validate_job_request(&req)?;

        if !self.pool.is_known_job(&req.name) {
            return Err(StevedoreError::validation(format!(
                "job with name '{}' is unknown",
                req.name
            )));
        }
        self.pool.validate_job_parameters(&req.name, &req.parameters)?;

        let mut stats = match req.metadata.kind {
            JobKind::Scheduled => {
                let delay = req.metadata.schedule_delay_seconds.unwrap_or(0);
                self.pool
                    .schedule(&req.name, req.parameters, delay, req.metadata.unique)
                    .await?
            }
            JobKind::Periodic => {
                let cron = req.metadata.cron.as_deref().unwrap_or_default();
                self.pool
                    .periodically_enqueue(&req.name, req.parameters, cron)
                    .await?
            }
            JobKind::Generic => {
                self.pool
                    .enqueue(&req.name, req.parameters, req.metadata.unique)
                    .await?
            }
        };

        if let Some(ref hook_url) = req.status_hook {
            let hook_status = match self.pool.register_hook(&stats.job_id, hook_url).await {
                Ok(()) => HOOK_STATUS_ACTIVATED,
                Err(e) => {
                    warn!(job_id = %stats.job_id, error = %e, "status hook registration failed");
                    HOOK_STATUS_ERROR
                }
            };
            stats.hook_status = Some(hook_status.to_string());
            self.pool
                .stats_manager()
                .update(
                    &stats.job_id,
                    vec![("hook_status".to_string(), hook_status.to_string())],
                )
                .await;
        }

        Ok(stats)
    }

    /// Stats record of one job.
    pub async fn get_job(&self, job_id: &str) -> Result<JobStats> {
        non_empty_id(job_id)?;
        self.pool.get_job_stats(job_id).await
    }

    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        non_empty_id(job_id)?;
        self.pool.stop_job(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        non_empty_id(job_id)?;
        self.pool.cancel_job(job_id).await
    }

    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        non_empty_id(job_id)?;
        self.pool.retry_job(job_id).await
    }

    /// Log text of one job.
    pub fn get_job_log(&self, job_id: &str) -> Result<String> {
        if !valid_log_id(job_id) {
            return Err(StevedoreError::validation(format!("invalid job ID: {}", job_id)));
        }
        self.logs.retrieve(job_id)
    }

    /// Heartbeat stats of the worker pools.
    pub async fn check_status(&self) -> Result<PoolStats> {
        self.pool.stats().await
    }
}

fn non_empty_id(job_id: &str) -> Result<()> {
    if job_id.trim().is_empty() {
        return Err(StevedoreError::validation("empty job ID"));
    }
    Ok(())
}

/// Exposes the controller to running jobs as the sub-job capability.
pub struct ControllerSubJobLauncher(pub Arc<Controller>);

#[async_trait]
impl SubJobLauncher for ControllerSubJobLauncher {
    async fn launch(&self, req: JobRequest) -> Result<JobStats> {
        self.0.launch_job(req).await
    }
}

/// Validate the basic shape of a submission before touching the pool.
fn validate_job_request(req: &JobRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(StevedoreError::validation("name of job must be specified"));
    }

    match req.metadata.kind {
        JobKind::Scheduled => {
            if req.metadata.schedule_delay_seconds.unwrap_or(0) == 0 {
                return Err(StevedoreError::validation(
                    "'schedule_delay_seconds' must be specified if the job kind is 'Scheduled'",
                ));
            }
        }
        JobKind::Periodic => {
            let cron = req.metadata.cron.as_deref().unwrap_or_default();
            if cron.trim().is_empty() {
                return Err(StevedoreError::validation(
                    "'cron' must be specified if the job kind is 'Periodic'",
                ));
            }
            parse_cron_spec(cron)?;
        }
        JobKind::Generic => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::{JobMetadata, Parameters};

    fn request(kind: JobKind) -> JobRequest {
        JobRequest {
            name: "demo".to_string(),
            parameters: Parameters::new(),
            metadata: JobMetadata {
                kind,
                unique: false,
                schedule_delay_seconds: None,
                cron: None,
            },
            status_hook: None,
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut req = request(JobKind::Generic);
        req.name = "  ".to_string();
        let err = validate_job_request(&req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_scheduled_requires_positive_delay() {
        let mut req = request(JobKind::Scheduled);
        assert!(validate_job_request(&req).is_err());

        req.metadata.schedule_delay_seconds = Some(0);
        assert!(validate_job_request(&req).is_err());

        req.metadata.schedule_delay_seconds = Some(60);
        assert!(validate_job_request(&req).is_ok());
    }

    #[test]
    fn test_periodic_requires_valid_cron() {
        let mut req = request(JobKind::Periodic);
        assert!(validate_job_request(&req).is_err());

        // 5-field expressions are rejected.
        req.metadata.cron = Some("* * * * *".to_string());
        let err = validate_job_request(&req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronSpec);

        req.metadata.cron = Some("0 * * * * *".to_string());
        assert!(validate_job_request(&req).is_ok());
    }

    #[test]
    fn test_generic_needs_no_extras() {
        assert!(validate_job_request(&request(JobKind::Generic)).is_ok());
    }
}
