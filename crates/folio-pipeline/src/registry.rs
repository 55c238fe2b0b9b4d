//! Process-scoped pipeline registry.
//!
//! One registry object is constructed at startup and passed by reference
//! to every runner, detector and scheduler; there are no module-level
//! registries or import-time side effects. Each entry wires a job name
//! to its source adapter, breaker tuning and rate limiter. The limiter
//! lives here so every path that talks to a source — page loop and DLQ
//! replay alike — shares the same bucket.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use folio_core::{BreakerConfig, JobKind, SourceAdapter};

use crate::rate_limit::{RateLimitConfig, RateLimiter};

/// Static definition of one ingestion job.
#[derive(Clone)]
pub struct JobSpec {
    pub job_name: String,
    pub kind: JobKind,
    pub adapter: Arc<dyn SourceAdapter>,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    /// Retry budget for dead letters captured by this job.
    pub dlq_max_retries: i32,
}

impl JobSpec {
    pub fn new(
        job_name: impl Into<String>,
        kind: JobKind,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            kind,
            adapter,
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dlq_max_retries: folio_core::defaults::DLQ_MAX_RETRIES,
        }
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_dlq_max_retries(mut self, max_retries: i32) -> Self {
        self.dlq_max_retries = max_retries.max(0);
        self
    }
}

/// A registered job with its live rate limiter.
pub struct JobEntry {
    pub spec: JobSpec,
    pub limiter: RateLimiter,
}

/// Registry of all jobs this process orchestrates.
pub struct PipelineRegistry {
    jobs: HashMap<String, Arc<JobEntry>>,
}

impl PipelineRegistry {
    pub fn builder() -> PipelineRegistryBuilder {
        PipelineRegistryBuilder { specs: Vec::new() }
    }

    /// Look up a job by name.
    pub fn get(&self, job_name: &str) -> Option<Arc<JobEntry>> {
        self.jobs.get(job_name).cloned()
    }

    /// First registered job of a pipeline kind (DLQ replay and the stall
    /// detector resolve batches through this).
    pub fn job_for_kind(&self, kind: JobKind) -> Option<Arc<JobEntry>> {
        let mut names: Vec<&String> = self.jobs.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| &self.jobs[name])
            .find(|entry| entry.spec.kind == kind)
            .cloned()
    }

    /// All registered job names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered entries.
    pub fn entries(&self) -> Vec<Arc<JobEntry>> {
        self.job_names()
            .into_iter()
            .filter_map(|name| self.jobs.get(&name).cloned())
            .collect()
    }
}

/// Builder collecting job specs before the registry is frozen.
pub struct PipelineRegistryBuilder {
    specs: Vec<JobSpec>,
}

impl PipelineRegistryBuilder {
    /// Register a job. A later spec with the same name replaces the
    /// earlier one.
    pub fn register(mut self, spec: JobSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Freeze the registry, constructing one rate limiter per job.
    pub fn build(self) -> Arc<PipelineRegistry> {
        let mut jobs = HashMap::new();
        for spec in self.specs {
            debug!(
                job_name = %spec.job_name,
                kind = spec.kind.as_str(),
                "Registered ingestion job"
            );
            let limiter = RateLimiter::new(spec.rate_limit.clone());
            jobs.insert(spec.job_name.clone(), Arc::new(JobEntry { spec, limiter }));
        }
        Arc::new(PipelineRegistry { jobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticSourceAdapter;

    fn adapter() -> Arc<dyn SourceAdapter> {
        Arc::new(StaticSourceAdapter::new("test-source", 0.9, vec![]))
    }

    #[test]
    fn test_register_and_get() {
        let registry = PipelineRegistry::builder()
            .register(JobSpec::new("pricing_sync_main", JobKind::PricingSync, adapter()))
            .register(JobSpec::new("lore_sync_main", JobKind::LoreSync, adapter()))
            .build();

        assert!(registry.get("pricing_sync_main").is_some());
        assert!(registry.get("lore_sync_main").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(
            registry.job_names(),
            vec!["lore_sync_main".to_string(), "pricing_sync_main".to_string()]
        );
    }

    #[test]
    fn test_job_for_kind() {
        let registry = PipelineRegistry::builder()
            .register(JobSpec::new("biblio_import_main", JobKind::BiblioImport, adapter()))
            .build();

        let entry = registry.job_for_kind(JobKind::BiblioImport).unwrap();
        assert_eq!(entry.spec.job_name, "biblio_import_main");
        assert!(registry.job_for_kind(JobKind::PricingSync).is_none());
    }

    #[test]
    fn test_duplicate_name_replaces() {
        let registry = PipelineRegistry::builder()
            .register(
                JobSpec::new("pricing_sync_main", JobKind::PricingSync, adapter())
                    .with_dlq_max_retries(1),
            )
            .register(
                JobSpec::new("pricing_sync_main", JobKind::PricingSync, adapter())
                    .with_dlq_max_retries(7),
            )
            .build();

        let entry = registry.get("pricing_sync_main").unwrap();
        assert_eq!(entry.spec.dlq_max_retries, 7);
        assert_eq!(registry.entries().len(), 1);
    }
}
