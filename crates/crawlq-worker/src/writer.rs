//! Persists extraction results and moves jobs out of `in_progress`.

use std::sync::Arc;

use chrono::Utc;
use crawlq_core::{FailureKind, JobFailure, LeasedJob};
use crawlq_storage::{ArtifactStore, JobStore, PageStore};
use serde::Serialize;
use tracing::{error, warn};

use crate::extract::Extraction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "kind")]
pub enum JobOutcome {
    Done,
    Failed(FailureKind),
    /// The lease was reclaimed before the result arrived; nothing was written to the job.
    LeaseLost,
    /// The job transition itself failed; stale-lease reclamation picks the job up later.
    Abandoned,
}

pub struct ResultWriter {
    jobs: Arc<dyn JobStore>,
    pages: Arc<dyn PageStore>,
    artifacts: Option<ArtifactStore>,
}

impl ResultWriter {
    pub fn new(jobs: Arc<dyn JobStore>, pages: Arc<dyn PageStore>) -> Self {
        Self {
            jobs,
            pages,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Never fails: store errors become job failures or [`JobOutcome::Abandoned`].
    pub async fn record(&self, lease: &LeasedJob, result: Result<Extraction, JobFailure>) -> JobOutcome {
        match result {
            Ok(extraction) => self.write_success(lease, extraction).await,
            Err(failure) => self.write_failure(lease, &failure).await,
        }
    }

    async fn still_leased(&self, lease: &LeasedJob) -> bool {
        match self.jobs.get_job(lease.site_id(), lease.url()).await {
            Ok(Some(job)) => job.holds_lease(lease),
            Ok(None) => false,
            // Let the fenced transition decide.
            Err(_) => true,
        }
    }

    async fn write_success(&self, lease: &LeasedJob, extraction: Extraction) -> JobOutcome {
        if !self.still_leased(lease).await {
            warn!(url = lease.url(), "lease lost before page write; dropping result");
            return JobOutcome::LeaseLost;
        }

        let mut page = extraction.page;
        if let (Some(png), Some(artifacts)) = (extraction.screenshot, &self.artifacts) {
            match artifacts.store_screenshot(&page.site_id, page.fetched_at, &png).await {
                Ok(stored) => page.screenshot_path = Some(stored.relative_path.display().to_string()),
                Err(err) => warn!(url = lease.url(), error = %err, "could not store screenshot"),
            }
        }

        if let Err(err) = self.pages.upsert_page(&page).await {
            error!(url = lease.url(), error = %err, "page upsert failed");
            let failure = JobFailure::store(format!("page upsert failed: {err}"));
            return self.write_failure(lease, &failure).await;
        }

        match self.jobs.complete(lease, Utc::now()).await {
            Ok(true) => JobOutcome::Done,
            Ok(false) => {
                warn!(url = lease.url(), "lease lost before completion");
                JobOutcome::LeaseLost
            }
            Err(err) => {
                error!(url = lease.url(), error = %err, "could not mark job done");
                JobOutcome::Abandoned
            }
        }
    }

    async fn write_failure(&self, lease: &LeasedJob, failure: &JobFailure) -> JobOutcome {
        match self.jobs.fail(lease, failure, Utc::now()).await {
            Ok(true) => {
                warn!(url = lease.url(), attempt = lease.attempts(), error = %failure, "job failed");
                JobOutcome::Failed(failure.kind)
            }
            Ok(false) => {
                warn!(url = lease.url(), "lease lost before failure was recorded");
                JobOutcome::LeaseLost
            }
            Err(err) => {
                error!(url = lease.url(), error = %err, "could not mark job failed");
                JobOutcome::Abandoned
            }
        }
    }
}
