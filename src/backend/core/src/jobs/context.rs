//! Per-job execution context.
//!
//! Each dequeued job receives a [`JobContext`] value carrying the stats
//! manager handle and the job identity. The context exposes the
//! control-command mailbox, progress check-ins, the per-job log sink
//! and a capability to launch sub-jobs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, StevedoreError};
use crate::joblog::JobLogger;
use crate::jobs::job::{CtlCommand, JobRequest, JobStats};
use crate::stats::StatsManager;

/// Capability to submit a job from within a running job.
///
/// The bootstrap wires the controller in behind this trait so the work
/// pool never has to hold a controller reference itself.
#[async_trait]
pub trait SubJobLauncher: Send + Sync {
    async fn launch(&self, req: JobRequest) -> Result<JobStats>;
}

/// Execution context handed to a job's `run`.
pub struct JobContext {
    job_id: String,
    job_name: String,
    stats: Arc<StatsManager>,
    launcher: Option<Arc<dyn SubJobLauncher>>,
    logger: JobLogger,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        stats: Arc<StatsManager>,
        launcher: Option<Arc<dyn SubJobLauncher>>,
        logger: JobLogger,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            stats,
            launcher,
            logger,
        }
    }

    /// ID of the executing job.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Registered name of the executing job.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// The per-job log sink.
    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Read the control-command mailbox.
    ///
    /// Long-running jobs poll this and return
    /// [`RunError::Stopped`](crate::jobs::RunError::Stopped) or
    /// [`RunError::Cancelled`](crate::jobs::RunError::Cancelled) when a
    /// command is pending.
    pub fn op_command(&self) -> Option<CtlCommand> {
        self.stats.ctl_command(&self.job_id)
    }

    /// Record an in-progress message on the stats record. The message
    /// is also delivered to the registered status hook, if any.
    pub async fn check_in(&self, message: &str) {
        self.stats.check_in(&self.job_id, message).await;
    }

    /// Launch a sub-job and record the upstream/execution links.
    pub async fn launch_sub_job(&self, req: JobRequest) -> Result<JobStats> {
        let launcher = self
            .launcher
            .as_ref()
            .ok_or_else(|| StevedoreError::internal("no sub-job launcher provided"))?;

        if req.name == self.job_name {
            return Err(StevedoreError::validation(
                "a job may not launch a sub-job of its own type",
            ));
        }

        let res = launcher.launch(req).await?;

        self.stats
            .update(&self.job_id, vec![("is_multiple_executions".into(), "true".into())])
            .await;
        self.stats
            .update(
                &res.job_id,
                vec![("upstream_job_id".into(), self.job_id.clone())],
            )
            .await;
        self.stats.attach_execution(&self.job_id, &res.job_id).await;

        info!(
            sub_job = %format!("{}:{}", res.name, res.job_id),
            upstream = %self.job_id,
            "launched sub job"
        );

        Ok(res)
    }
}
