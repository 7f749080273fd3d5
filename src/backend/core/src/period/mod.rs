//! Periodic job scheduling: policy storage, per-node caching, the
//! elected enqueuer and the startup sweeper.

pub mod enqueuer;
pub mod policy;
pub mod scheduler;
pub mod sweeper;

pub use enqueuer::{child_job_id, fire_times, Enqueuer, PERIODIC_ENQUEUER_HORIZON};
pub use policy::{PeriodicJobPolicy, PolicyCache, PolicyStore};
pub use scheduler::Scheduler;
pub use sweeper::Sweeper;

use crate::error::{ErrorCode, Result, StevedoreError};

/// Parse a 6-field cron expression (seconds resolution).
pub fn parse_cron_spec(spec: &str) -> Result<cron::Schedule> {
    use std::str::FromStr;

    if spec.split_whitespace().count() != 6 {
        return Err(StevedoreError::new(
            ErrorCode::InvalidCronSpec,
            format!("'{}' is not a 6-field cron expression", spec),
        ));
    }

    cron::Schedule::from_str(spec).map_err(|e| {
        StevedoreError::new(
            ErrorCode::InvalidCronSpec,
            format!("cron spec is not correctly set: {}", e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_cron() {
        assert!(parse_cron_spec("0 * * * * *").is_ok());
        assert!(parse_cron_spec("30 */5 8-18 * * MON-FRI").is_ok());
    }

    #[test]
    fn test_reject_wrong_field_count() {
        // 5-field (minute resolution) and 7-field (with years) forms
        // are both rejected.
        let err = parse_cron_spec("* * * * *").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronSpec);
        assert!(parse_cron_spec("0 0 0 * * * 2026").is_err());
    }

    #[test]
    fn test_reject_garbage() {
        assert!(parse_cron_spec("a b c d e f").is_err());
        assert!(parse_cron_spec("").is_err());
    }
}
