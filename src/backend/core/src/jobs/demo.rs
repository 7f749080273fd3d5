//! Demo job registered at bootstrap for smoke testing the pipeline.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobs::context::JobContext;
use crate::jobs::job::{CtlCommand, Job, Parameters, RunError, RunResult};

/// Name the demo job is registered under.
pub const DEMO_JOB_NAME: &str = "DEMO";

/// A small job that logs its parameters, checks in once and honours
/// stop/cancel commands while it works.
pub struct DemoJob;

#[async_trait]
impl Job for DemoJob {
    fn max_fails(&self) -> u32 {
        3
    }

    fn validate(&self, _params: &Parameters) -> Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &JobContext, params: Parameters) -> RunResult {
        ctx.logger().info("demo job starting");
        for (key, value) in &params {
            ctx.logger().info(&format!("parameter {} = {}", key, value));
        }

        ctx.check_in("demo job is running").await;

        for _ in 0..5 {
            match ctx.op_command() {
                Some(CtlCommand::Stop) => {
                    ctx.logger().info("stop command received");
                    return Err(RunError::Stopped);
                }
                Some(CtlCommand::Cancel) => {
                    ctx.logger().info("cancel command received");
                    return Err(RunError::Cancelled);
                }
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        ctx.logger().info("demo job finished");
        Ok(())
    }
}
