//! Startup sweeper.
//!
//! Scheduled entries whose run-at lies further in the past than the
//! enqueuer horizon are orphans left behind by a previous process;
//! they are purged before the pool starts consuming.

use tracing::info;

use crate::error::Result;
use crate::period::enqueuer::PERIODIC_ENQUEUER_HORIZON;
use crate::pool::queue::Queue;

pub struct Sweeper {
    queue: Queue,
}

impl Sweeper {
    pub fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Remove outdated scheduled entries; returns the number purged.
    pub async fn clear_outdated_scheduled_jobs(&self) -> Result<usize> {
        let removed = self
            .queue
            .clear_outdated_scheduled(PERIODIC_ENQUEUER_HORIZON.as_secs() as i64)
            .await?;

        if removed > 0 {
            info!(removed, "cleared outdated scheduled jobs");
        }
        Ok(removed)
    }
}
