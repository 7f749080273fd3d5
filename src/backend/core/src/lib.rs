//! # Stevedore Core
//!
//! Distributed job execution service for a container registry platform.
//!
//! ## Architecture
//!
//! - **API**: HTTP control plane with shared-secret authentication
//! - **Controller**: request validation and dispatch by job kind
//! - **Work Pool**: Redis-backed queues (ready, scheduled, retry, dead,
//!   in-progress) with bounded concurrent executors
//! - **Periodic Scheduler**: cron policies expanded into scheduled runs
//!   by a single elected enqueuer
//! - **Stats Manager**: per-job records, control-command mailbox, hook
//!   registry and webhook delivery
//! - **Message Bus**: pub/sub keeping per-node caches consistent across
//!   the cluster

pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod joblog;
pub mod jobs;
pub mod mq;
pub mod period;
pub mod pool;
pub mod runtime;
pub mod stats;

pub use error::{ErrorCode, Result, StevedoreError};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::controller::Controller;
    pub use crate::error::{ErrorCode, Result, StevedoreError};
    pub use crate::jobs::{
        CtlCommand, Job, JobContext, JobKind, JobRequest, JobStats, JobStatus, Parameters,
        RunError, RunResult, SubJobLauncher,
    };
    pub use crate::pool::WorkerPool;
    pub use crate::runtime::Bootstrap;
}
