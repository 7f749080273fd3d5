//! Typed job registry.
//!
//! Maps registered job names to their implementations. Registration is
//! write-once at startup; after the pool starts the map is only read,
//! so lookups take a plain read lock.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{Result, StevedoreError};
use crate::jobs::job::Job;

#[derive(Default)]
pub struct JobRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

struct RegistryEntry {
    job: Arc<dyn Job>,
    type_id: TypeId,
    type_name: &'static str,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one job implementation under a name.
    ///
    /// Constraints: the name must be unused, and the same concrete type
    /// may not be registered under two names.
    pub fn register<J: Job>(&self, name: &str, job: J) -> Result<()> {
        if name.trim().is_empty() {
            return Err(StevedoreError::validation(
                "job can not be registered with empty name",
            ));
        }

        let type_id = TypeId::of::<J>();
        let type_name = std::any::type_name::<J>();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(name) {
            return Err(StevedoreError::validation(format!(
                "job name '{}' has been already registered with {}",
                name, existing.type_name
            )));
        }

        if let Some((other_name, _)) = entries.iter().find(|(_, e)| e.type_id == type_id) {
            return Err(StevedoreError::validation(format!(
                "job {} has been already registered with name '{}'",
                type_name, other_name
            )));
        }

        entries.insert(
            name.to_string(),
            RegistryEntry {
                job: Arc::new(job),
                type_id,
                type_name,
            },
        );

        info!(job_type = type_name, name, "registered job");
        Ok(())
    }

    /// Look up the implementation for a known job name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.entries.read().get(name).map(|e| e.job.clone())
    }

    /// Whether the name belongs to a registered job.
    pub fn is_known(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Names of all registered jobs.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::context::JobContext;
    use crate::jobs::job::{Parameters, RunResult};
    use async_trait::async_trait;

    struct FirstJob;
    struct SecondJob;

    #[async_trait]
    impl Job for FirstJob {
        fn validate(&self, _params: &Parameters) -> Result<()> {
            Ok(())
        }
        async fn run(&self, _ctx: &JobContext, _params: Parameters) -> RunResult {
            Ok(())
        }
    }

    #[async_trait]
    impl Job for SecondJob {
        fn validate(&self, _params: &Parameters) -> Result<()> {
            Ok(())
        }
        async fn run(&self, _ctx: &JobContext, _params: Parameters) -> RunResult {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = JobRegistry::new();
        registry.register("first", FirstJob).unwrap();

        assert!(registry.is_known("first"));
        assert!(!registry.is_known("second"));
        assert!(registry.get("first").is_some());
        assert_eq!(registry.names(), vec!["first".to_string()]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = JobRegistry::new();
        registry.register("dup", FirstJob).unwrap();
        assert!(registry.register("dup", SecondJob).is_err());
    }

    #[test]
    fn test_same_type_two_names_rejected() {
        let registry = JobRegistry::new();
        registry.register("one", FirstJob).unwrap();
        assert!(registry.register("two", FirstJob).is_err());
        // A different type under the second name is fine.
        registry.register("two", SecondJob).unwrap();
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = JobRegistry::new();
        assert!(registry.register("  ", FirstJob).is_err());
    }
}
