//! Controller and execution-context tests that run without a backend.

use std::sync::Arc;

use async_trait::async_trait;

use stevedore_core::config::Config;
use stevedore_core::controller::Controller;
use stevedore_core::db::RedisPool;
use stevedore_core::error::{ErrorCode, Result};
use stevedore_core::joblog::JobLogStore;
use stevedore_core::jobs::{
    Job, JobContext, JobKind, JobMetadata, JobRequest, JobStats, JobStatus, Parameters, RunResult,
    SubJobLauncher,
};
use stevedore_core::mq::MessageServer;
use stevedore_core::pool::WorkerPool;
use stevedore_core::stats::StatsManager;

/// A job whose validator requires an `image` parameter.
struct ScanJob;

#[async_trait]
impl Job for ScanJob {
    fn validate(&self, params: &Parameters) -> Result<()> {
        if !params.contains_key("image") {
            return Err(stevedore_core::StevedoreError::validation(
                "parameter 'image' is required",
            ));
        }
        Ok(())
    }

    async fn run(&self, _ctx: &JobContext, _params: Parameters) -> RunResult {
        Ok(())
    }
}

fn test_controller() -> Controller {
    let redis = RedisPool::new("redis://127.0.0.1:6399", "testing").unwrap();
    let dir = tempfile::tempdir().unwrap().into_path();
    let logs = JobLogStore::new(dir, 24).unwrap();
    let pool = Arc::new(WorkerPool::new(redis, logs.clone(), &Config::default()));
    pool.register_job("scan", ScanJob).unwrap();
    Controller::new(pool, logs)
}

fn generic_request(name: &str) -> JobRequest {
    JobRequest {
        name: name.to_string(),
        parameters: Parameters::new(),
        metadata: JobMetadata {
            kind: JobKind::Generic,
            unique: false,
            schedule_delay_seconds: None,
            cron: None,
        },
        status_hook: None,
    }
}

#[tokio::test]
async fn test_launch_runs_the_type_validator() {
    let controller = test_controller();

    // Missing required parameter is rejected before any enqueue.
    let err = controller
        .launch_job(generic_request("scan"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(err.user_message().contains("image"));
}

#[tokio::test]
async fn test_launch_unknown_job_rejected() {
    let controller = test_controller();
    let err = controller
        .launch_job(generic_request("replicate"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_control_ops_reject_empty_id() {
    let controller = test_controller();
    assert!(controller.get_job(" ").await.is_err());
    assert!(controller.stop_job("").await.is_err());
    assert!(controller.cancel_job("").await.is_err());
    assert!(controller.retry_job("").await.is_err());
}

#[tokio::test]
async fn test_job_log_id_validation() {
    let controller = test_controller();

    let err = controller.get_job_log("../../etc/passwd").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let err = controller.get_job_log("missing-job").unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotFound);
}

// ============================================================================
// Execution context
// ============================================================================

struct StubLauncher;

#[async_trait]
impl SubJobLauncher for StubLauncher {
    async fn launch(&self, req: JobRequest) -> Result<JobStats> {
        Ok(JobStats::new(
            "sub-1",
            &req.name,
            JobKind::Generic,
            false,
            JobStatus::Pending,
        ))
    }
}

fn test_context(job_name: &str) -> JobContext {
    let redis = RedisPool::new("redis://127.0.0.1:6399", "testing").unwrap();
    let bus = MessageServer::new(redis.clone());
    let stats = Arc::new(StatsManager::new(redis, bus));
    let dir = tempfile::tempdir().unwrap().into_path();
    let logs = JobLogStore::new(dir, 24).unwrap();
    let logger = logs.create("ctx-job-1").unwrap();

    JobContext::new(
        "ctx-job-1",
        job_name,
        stats,
        Some(Arc::new(StubLauncher)),
        logger,
    )
}

#[tokio::test]
async fn test_sub_job_of_same_type_is_refused() {
    let ctx = test_context("scan");
    let err = ctx.launch_sub_job(generic_request("scan")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_sub_job_of_other_type_launches() {
    let ctx = test_context("scan");
    let stats = ctx
        .launch_sub_job(generic_request("replicate"))
        .await
        .unwrap();
    assert_eq!(stats.job_id, "sub-1");
    assert_eq!(stats.name, "replicate");
}

#[tokio::test]
async fn test_empty_command_mailbox() {
    let ctx = test_context("scan");
    assert!(ctx.op_command().is_none());
}
