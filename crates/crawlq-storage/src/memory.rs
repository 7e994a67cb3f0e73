//! In-memory job and page store with the same claim and fencing semantics as
//! the PostgreSQL backend. Used by tests and single-process dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlq_core::{JobFailure, JobStatus, LeasePolicy, LeasedJob, LinkJob, PageRecord, StatusCounts};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::store::{seed_created_at, ClaimFilter, JobStore, PageStore, ReprocessOutcome, SeedSummary, StoreError};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, LinkJob>,
    by_key: HashMap<(String, String), Uuid>,
    pages: HashMap<(String, String), PageRecord>,
}

impl Tables {
    fn key(site_id: &str, url: &str) -> (String, String) {
        (site_id.to_string(), url.to_string())
    }

    fn site_jobs_mut<'a>(&'a mut self, site_id: &'a str) -> impl Iterator<Item = &'a mut LinkJob> + 'a {
        self.jobs.values_mut().filter(move |job| job.site_id == site_id)
    }

    fn remove_job(&mut self, id: Uuid) -> bool {
        match self.jobs.remove(&id) {
            Some(job) => {
                self.by_key.remove(&Self::key(&job.site_id, &job.url));
                true
            }
            None => false,
        }
    }
}

/// Every operation takes the table lock once, so each call is atomic with
/// respect to every other call.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    fail_page_writes: AtomicBool,
    claim_budget: Mutex<Option<usize>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make page upserts fail while job updates keep working.
    pub fn fail_page_writes(&self, fail: bool) {
        self.fail_page_writes.store(fail, Ordering::SeqCst);
    }

    /// Allow `claims` more successful `claim_next` calls, then fail every claim
    /// while other operations keep working.
    pub fn fail_claims_after(&self, claims: usize) {
        *self.claim_budget.lock() = Some(claims);
    }

    /// Test hook: overwrite a stored job as-is.
    pub fn put_job(&self, job: LinkJob) {
        let mut tables = self.tables.lock();
        tables.by_key.insert(Tables::key(&job.site_id, &job.url), job.id);
        tables.jobs.insert(job.id, job);
    }

    pub fn page_count(&self) -> usize {
        self.tables.lock().pages.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn with_lease<F>(&self, lease: &LeasedJob, apply: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut LinkJob) -> Result<(), crawlq_core::CoreError>,
    {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables.jobs.get_mut(&lease.id()) {
            Some(job) if job.holds_lease(lease) => {
                apply(job)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn claim_order(job: &LinkJob) -> (DateTime<Utc>, Uuid) {
    (job.created_at, job.id)
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn seed(&self, site_id: &str, urls: &[String], now: DateTime<Utc>) -> Result<SeedSummary, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut summary = SeedSummary::default();
        let mut seen = HashSet::new();
        let unique: Vec<&String> = urls.iter().filter(|u| seen.insert(u.as_str())).collect();
        for (index, url) in unique.into_iter().enumerate() {
            let key = Tables::key(site_id, url);
            if let Some(id) = tables.by_key.get(&key).copied() {
                if let Some(job) = tables.jobs.get_mut(&id) {
                    job.updated_at = now;
                }
                summary.matched += 1;
                continue;
            }
            let job = LinkJob::new_pending(site_id, url.clone(), seed_created_at(now, index));
            tables.by_key.insert(key, job.id);
            tables.jobs.insert(job.id, job);
            summary.upserted += 1;
        }
        Ok(summary)
    }

    async fn reclaim_stale(
        &self,
        policy: &LeasePolicy,
        site_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut reclaimed = 0;
        for job in tables.jobs.values_mut() {
            if site_id.map_or(true, |s| s == job.site_id) && job.is_stale(policy, now) {
                job.reclaim(now)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn claim_next(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> Result<Option<LeasedJob>, StoreError> {
        self.check()?;
        if let Some(budget) = self.claim_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(StoreError::Unavailable("claims switched off".to_string()));
            }
            *budget -= 1;
        }
        let mut tables = self.tables.lock();
        let next = tables
            .jobs
            .values_mut()
            .filter(|job| job.status() == JobStatus::Pending && filter.matches(job))
            .min_by_key(|job| claim_order(job));
        match next {
            Some(job) => Ok(Some(job.claim(now)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, lease: &LeasedJob, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_lease(lease, |job| job.complete(now))
    }

    async fn fail(&self, lease: &LeasedJob, failure: &JobFailure, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_lease(lease, |job| job.fail(failure, now))
    }

    async fn retry_errors(&self, site_id: &str, policy: &LeasePolicy, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut requeued = 0;
        for job in tables.site_jobs_mut(site_id) {
            if job.status() == JobStatus::Error && job.retry(policy, now)? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn refetch_site(&self, site_id: &str, ingest_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut modified = 0;
        for job in tables.site_jobs_mut(site_id) {
            job.reset(Some(ingest_id), now);
            modified += 1;
        }
        Ok(modified)
    }

    async fn reprocess(&self, site_id: &str, url: &str, now: DateTime<Utc>) -> Result<ReprocessOutcome, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let key = Tables::key(site_id, url);
        if let Some(id) = tables.by_key.get(&key).copied() {
            if let Some(job) = tables.jobs.get_mut(&id) {
                job.reset(None, now);
                return Ok(ReprocessOutcome {
                    job_id: id,
                    inserted: false,
                });
            }
        }
        let job = LinkJob::new_pending(site_id, url, now);
        let job_id = job.id;
        tables.by_key.insert(key, job_id);
        tables.jobs.insert(job_id, job);
        Ok(ReprocessOutcome { job_id, inserted: true })
    }

    async fn retry_jobs(&self, site_id: &str, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut modified = 0;
        for id in ids {
            if let Some(job) = tables.jobs.get_mut(id).filter(|job| job.site_id == site_id) {
                job.reset(None, now);
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn purge_errors(&self, site_id: &str, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let doomed: Vec<Uuid> = ids
            .iter()
            .filter(|id| {
                tables
                    .jobs
                    .get(id)
                    .is_some_and(|job| job.site_id == site_id && job.status() == JobStatus::Error)
            })
            .copied()
            .collect();
        let mut deleted = 0;
        for id in doomed {
            if tables.remove_job(id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_site_jobs(&self, site_id: &str) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let doomed: Vec<Uuid> = tables
            .jobs
            .values()
            .filter(|job| job.site_id == site_id)
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            tables.remove_job(*id);
        }
        Ok(doomed.len() as u64)
    }

    async fn get_job(&self, site_id: &str, url: &str) -> Result<Option<LinkJob>, StoreError> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables
            .by_key
            .get(&Tables::key(site_id, url))
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn list_jobs(
        &self,
        site_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<LinkJob>, StoreError> {
        self.check()?;
        let tables = self.tables.lock();
        let mut jobs: Vec<LinkJob> = tables
            .jobs
            .values()
            .filter(|job| job.site_id == site_id && status.map_or(true, |s| job.status() == s))
            .cloned()
            .collect();
        jobs.sort_by_key(claim_order);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn status_counts(&self, site_id: &str) -> Result<StatusCounts, StoreError> {
        self.check()?;
        let tables = self.tables.lock();
        let mut counts = StatusCounts::default();
        for job in tables.jobs.values().filter(|job| job.site_id == site_id) {
            counts.add(job.status(), 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl PageStore for InMemoryStore {
    async fn upsert_page(&self, page: &PageRecord) -> Result<(), StoreError> {
        self.check()?;
        if self.fail_page_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("page writes switched off".to_string()));
        }
        self.tables
            .lock()
            .pages
            .insert(Tables::key(&page.site_id, &page.url), page.clone());
        Ok(())
    }

    async fn get_page(&self, site_id: &str, url: &str) -> Result<Option<PageRecord>, StoreError> {
        self.check()?;
        Ok(self.tables.lock().pages.get(&Tables::key(site_id, url)).cloned())
    }

    async fn delete_site_pages(&self, site_id: &str) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let before = tables.pages.len();
        tables.pages.retain(|(site, _), _| site != site_id);
        Ok((before - tables.pages.len()) as u64)
    }
}
