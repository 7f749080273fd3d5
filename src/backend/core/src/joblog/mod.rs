//! Per-job log files.
//!
//! Every executing job gets its own log file under the configured
//! directory, mirrored to the service logger. The store retrieves log
//! text for the API and sweeps files past the retention horizon.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StevedoreError};

/// Interval between sweeper passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Store managing the job log directory.
#[derive(Clone)]
pub struct JobLogStore {
    dir: PathBuf,
    retention: Duration,
}

impl JobLogStore {
    pub fn new(dir: impl Into<PathBuf>, retention_hours: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retention: Duration::from_secs(retention_hours * 3600),
        })
    }

    /// Open the log sink for one job execution.
    pub fn create(&self, job_id: &str) -> Result<JobLogger> {
        let path = self.path_for(job_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(JobLogger {
            job_id: job_id.to_string(),
            file: Mutex::new(file),
        })
    }

    /// Return the log text of one job, if present.
    pub fn retrieve(&self, job_id: &str) -> Result<String> {
        let path = self.path_for(job_id);
        if !path.is_file() {
            return Err(StevedoreError::job_not_found(job_id));
        }
        Ok(fs::read_to_string(path)?)
    }

    /// Run the retention sweeper until shutdown is signalled.
    pub async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once() {
                        error!(error = %e, "job log sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("job log sweeper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Delete log files older than the retention horizon.
    pub fn sweep_once(&self) -> Result<usize> {
        let mut removed = 0;
        let cutoff = std::time::SystemTime::now() - self.retention;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let modified = entry.metadata().and_then(|m| m.modified());
            if let Ok(modified) = modified {
                if modified < cutoff && fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "swept expired job log files");
        }
        Ok(removed)
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", job_id))
    }
}

/// File sink of one job execution, mirrored to the service logger.
pub struct JobLogger {
    job_id: String,
    file: Mutex<File>,
}

impl JobLogger {
    pub fn info(&self, message: &str) {
        self.write_line("INFO", message);
        info!(job_id = %self.job_id, "{}", message);
    }

    pub fn warning(&self, message: &str) {
        self.write_line("WARNING", message);
        warn!(job_id = %self.job_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        self.write_line("ERROR", message);
        error!(job_id = %self.job_id, "{}", message);
    }

    /// Flush buffered output; called by the wrapper when the job exits.
    pub fn close(&self) {
        if let Err(e) = self.file.lock().flush() {
            error!(job_id = %self.job_id, error = %e, "close job logger failed");
        }
    }

    fn write_line(&self, level: &str, message: &str) {
        let line = format!(
            "{} [{}] {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            level,
            message
        );
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            error!(job_id = %self.job_id, error = %e, "write job log failed");
        }
    }
}

/// Reject job ids that could escape the log directory.
pub fn valid_log_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && !job_id.contains("..")
        && !job_id.contains(std::path::MAIN_SEPARATOR)
        && !job_id.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobLogStore::new(dir.path(), 24).unwrap();

        let logger = store.create("job-1").unwrap();
        logger.info("starting");
        logger.error("something went wrong");
        logger.close();

        let text = store.retrieve("job-1").unwrap();
        assert!(text.contains("[INFO] starting"));
        assert!(text.contains("[ERROR] something went wrong"));
    }

    #[test]
    fn test_retrieve_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobLogStore::new(dir.path(), 24).unwrap();
        let err = store.retrieve("nope").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::JobNotFound);
    }

    #[test]
    fn test_sweep_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        // Zero retention: everything is immediately expired.
        let store = JobLogStore::new(dir.path(), 0).unwrap();

        let logger = store.create("job-old").unwrap();
        logger.info("line");
        logger.close();

        let removed = store.sweep_once().unwrap();
        assert_eq!(removed, 1);
        assert!(store.retrieve("job-old").is_err());
    }

    #[test]
    fn test_valid_log_id() {
        assert!(valid_log_id("abc-123"));
        assert!(!valid_log_id("../etc/passwd"));
        assert!(!valid_log_id("a/b"));
        assert!(!valid_log_id(""));
    }
}
