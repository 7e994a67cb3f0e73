//! Operator actions on a site's jobs and pages.

use std::sync::Arc;

use chrono::Utc;
use crawlq_core::{LeasePolicy, PageRecord, StatusCounts};
use crawlq_storage::{JobStore, PageStore, ReprocessOutcome, StoreError};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Stale leases and retryable errors.
    All,
    StaleOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub reclaimed: u64,
    pub requeued_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefetchReport {
    pub ingest_id: Uuid,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub jobs_deleted: u64,
    pub pages_deleted: u64,
}

pub struct Maintenance {
    jobs: Arc<dyn JobStore>,
    pages: Arc<dyn PageStore>,
    policy: LeasePolicy,
}

impl Maintenance {
    pub fn new(jobs: Arc<dyn JobStore>, pages: Arc<dyn PageStore>, policy: LeasePolicy) -> Self {
        Self { jobs, pages, policy }
    }

    pub async fn status(&self, site_id: &str) -> Result<StatusCounts, StoreError> {
        self.jobs.status_counts(site_id).await
    }

    pub async fn resume(&self, site_id: &str, mode: ResumeMode) -> Result<ResumeReport, StoreError> {
        let now = Utc::now();
        let reclaimed = self.jobs.reclaim_stale(&self.policy, Some(site_id), now).await?;
        let requeued_errors = match mode {
            ResumeMode::All => self.jobs.retry_errors(site_id, &self.policy, now).await?,
            ResumeMode::StaleOnly => 0,
        };
        info!(site_id, reclaimed, requeued_errors, "site resumed");
        Ok(ResumeReport {
            reclaimed,
            requeued_errors,
        })
    }

    /// Every job of the site back to pending with a fresh attempt budget.
    pub async fn refetch_site(&self, site_id: &str) -> Result<RefetchReport, StoreError> {
        let ingest_id = Uuid::new_v4();
        let modified = self.jobs.refetch_site(site_id, ingest_id, Utc::now()).await?;
        info!(site_id, %ingest_id, modified, "site queued for refetch");
        Ok(RefetchReport { ingest_id, modified })
    }

    pub async fn reprocess(&self, site_id: &str, url: &str) -> Result<ReprocessOutcome, StoreError> {
        self.jobs.reprocess(site_id, url, Utc::now()).await
    }

    pub async fn retry_jobs(&self, site_id: &str, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.jobs.retry_jobs(site_id, ids, Utc::now()).await
    }

    pub async fn purge_errors(&self, site_id: &str, ids: &[Uuid]) -> Result<u64, StoreError> {
        let deleted = self.jobs.purge_errors(site_id, ids).await?;
        info!(site_id, requested = ids.len(), deleted, "purged error jobs");
        Ok(deleted)
    }

    /// Delete every job and page of the site.
    pub async fn reset_site(&self, site_id: &str) -> Result<ResetReport, StoreError> {
        let jobs_deleted = self.jobs.delete_site_jobs(site_id).await?;
        let pages_deleted = self.pages.delete_site_pages(site_id).await?;
        info!(site_id, jobs_deleted, pages_deleted, "site reset");
        Ok(ResetReport {
            jobs_deleted,
            pages_deleted,
        })
    }

    pub async fn page(&self, site_id: &str, url: &str) -> Result<Option<PageRecord>, StoreError> {
        self.pages.get_page(site_id, url).await
    }
}
