//! Job Store and Page Store contracts shared by the in-memory and PostgreSQL backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlq_core::{CoreError, JobFailure, JobStatus, LeasePolicy, LeasedJob, LinkJob, PageRecord, StatusCounts};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] CoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Narrows a claim to one site and optionally one exact URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    pub site_id: Option<String>,
    pub url: Option<String>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn site(site_id: impl Into<String>) -> Self {
        Self {
            site_id: Some(site_id.into()),
            url: None,
        }
    }

    pub fn exact(site_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            site_id: Some(site_id.into()),
            url: Some(url.into()),
        }
    }

    pub fn matches(&self, job: &LinkJob) -> bool {
        self.site_id.as_deref().map_or(true, |s| s == job.site_id)
            && self.url.as_deref().map_or(true, |u| u == job.url)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    /// Newly inserted jobs.
    pub upserted: u64,
    /// Jobs that already existed and only had `updated_at` bumped.
    pub matched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprocessOutcome {
    pub job_id: Uuid,
    pub inserted: bool,
}

/// Durable queue of link jobs keyed by (site_id, url).
///
/// `claim_next` is the only way a job enters `in_progress` and must be a single
/// atomic read-modify-write. `complete` and `fail` only apply while the job still
/// carries the lease the caller holds and return `false` otherwise.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert-only upsert of pending jobs. `created_at` increases strictly in
    /// slice order starting at `now`.
    async fn seed(&self, site_id: &str, urls: &[String], now: DateTime<Utc>) -> Result<SeedSummary, StoreError>;

    /// Requeue stale leases whose attempts remain below the policy cap.
    async fn reclaim_stale(
        &self,
        policy: &LeasePolicy,
        site_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Atomically claim the oldest pending job matching `filter`.
    async fn claim_next(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> Result<Option<LeasedJob>, StoreError>;

    async fn complete(&self, lease: &LeasedJob, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn fail(&self, lease: &LeasedJob, failure: &JobFailure, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// `error -> pending` for every job of the site with attempts below the cap.
    async fn retry_errors(&self, site_id: &str, policy: &LeasePolicy, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Reset every job of the site to pending with a fresh attempt budget.
    async fn refetch_site(&self, site_id: &str, ingest_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn reprocess(&self, site_id: &str, url: &str, now: DateTime<Utc>) -> Result<ReprocessOutcome, StoreError>;

    async fn retry_jobs(&self, site_id: &str, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete the listed jobs of the site that are in `error`; others are kept.
    async fn purge_errors(&self, site_id: &str, ids: &[Uuid]) -> Result<u64, StoreError>;

    async fn delete_site_jobs(&self, site_id: &str) -> Result<u64, StoreError>;

    async fn get_job(&self, site_id: &str, url: &str) -> Result<Option<LinkJob>, StoreError>;

    /// Jobs of a site in claim order.
    async fn list_jobs(
        &self,
        site_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<LinkJob>, StoreError>;

    async fn status_counts(&self, site_id: &str) -> Result<StatusCounts, StoreError>;
}

/// Materialized page results keyed by (site_id, url).
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Replace the page for `(page.site_id, page.url)`.
    async fn upsert_page(&self, page: &PageRecord) -> Result<(), StoreError>;

    async fn get_page(&self, site_id: &str, url: &str) -> Result<Option<PageRecord>, StoreError>;

    async fn delete_site_pages(&self, site_id: &str) -> Result<u64, StoreError>;
}

/// Offset of the `index`-th seeded URL from the seeding instant.
pub(crate) fn seed_created_at(now: DateTime<Utc>, index: usize) -> DateTime<Utc> {
    now + chrono::Duration::microseconds(index as i64)
}
