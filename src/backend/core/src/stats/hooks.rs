//! Webhook delivery.
//!
//! Status events are POSTed as JSON to the hook URL registered for a
//! job. Deliveries for the same job are serialized; deliveries across
//! jobs run concurrently. Each event gets up to [`MAX_ATTEMPTS`]
//! attempts with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StevedoreError};
use crate::jobs::{BackoffStrategy, JobKind, JobStatus};

/// Delivery attempts per status event.
const MAX_ATTEMPTS: u32 = 10;

/// Timeout of a single POST.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Job metadata carried in the webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEventMetadata {
    pub kind: JobKind,
    pub unique: bool,
}

/// The JSON body POSTed to a status hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    /// Update time of the stats record when the event fired
    pub revision: i64,
    pub metadata: HookEventMetadata,
}

/// Outbound webhook client.
#[derive(Clone)]
pub struct HookClient {
    http: reqwest::Client,
    backoff: BackoffStrategy,
    // Per-job delivery locks; deliveries across jobs stay concurrent.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Default for HookClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HookClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            backoff: BackoffStrategy::Exponential {
                initial_delay_secs: 1,
                max_delay_secs: 60,
                multiplier: 2.0,
            },
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Deliver one event, retrying until success or exhaustion.
    ///
    /// Any 2xx response counts as delivered.
    pub async fn deliver(&self, url: &str, event: &HookEvent) -> Result<()> {
        let lock = self
            .locks
            .entry(event.job_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        let mut last_err: Option<String> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }

            match self.http.post(url).json(event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(job_id = %event.job_id, url, attempt, "status hook delivered");
                    counter!("stevedore_hook_deliveries_total", "result" => "success").increment(1);
                    return Ok(());
                }
                Ok(resp) => {
                    last_err = Some(format!("hook endpoint returned {}", resp.status()));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                }
            }

            warn!(
                job_id = %event.job_id,
                url,
                attempt,
                error = last_err.as_deref().unwrap_or("unknown"),
                "status hook delivery failed"
            );
        }

        counter!("stevedore_hook_deliveries_total", "result" => "exhausted").increment(1);
        Err(StevedoreError::internal(format!(
            "status hook delivery to '{}' exhausted {} attempts: {}",
            url,
            MAX_ATTEMPTS,
            last_err.unwrap_or_default()
        )))
    }
}

/// Basic sanity check for user-supplied hook URLs.
pub fn is_valid_hook_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.has_host(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_url_validation() {
        assert!(is_valid_hook_url("http://sink/"));
        assert!(is_valid_hook_url("https://core.local:8443/service/notifications"));
        assert!(!is_valid_hook_url("ftp://sink/"));
        assert!(!is_valid_hook_url("not a url"));
        assert!(!is_valid_hook_url(""));
    }

    #[test]
    fn test_hook_event_serialization() {
        let event = HookEvent {
            job_id: "j1".into(),
            status: JobStatus::Success,
            check_in: None,
            revision: 1_700_000_000,
            metadata: HookEventMetadata {
                kind: JobKind::Generic,
                unique: false,
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"job_id\":\"j1\""));
        assert!(json.contains("\"status\":\"Success\""));
        assert!(json.contains("\"revision\":1700000000"));
        // Absent check-in is omitted entirely.
        assert!(!json.contains("check_in"));
    }
}
