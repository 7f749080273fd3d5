//! Job abstractions: the capability trait, execution context, typed
//! registry and the request/stats data model.

pub mod context;
pub mod demo;
pub mod job;
pub mod registry;

pub use context::{JobContext, SubJobLauncher};
pub use demo::{DemoJob, DEMO_JOB_NAME};
pub use job::{
    BackoffStrategy, CtlCommand, Job, JobKind, JobMetadata, JobRequest, JobStats, JobStatus,
    Parameters, PoolStats, PoolStatsEntry, RunError, RunResult, DEFAULT_MAX_FAILS,
    HOOK_STATUS_ACTIVATED, HOOK_STATUS_ERROR, POOL_STATUS_DEAD, POOL_STATUS_HEALTHY,
};
pub use registry::JobRegistry;
