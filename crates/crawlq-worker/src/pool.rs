//! Bounded-concurrency worker pool: claim a batch, share one browser across
//! it, extract and persist every job.

use std::sync::Arc;
use std::time::Duration;

use crawlq_core::{FailureKind, JobFailure, LeasedJob};
use crawlq_render::{Browser, LaunchOptions, RenderError, Renderer};
use crawlq_storage::{ClaimFilter, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};

use crate::extract::{extract_page, ExtractOptions};
use crate::lease::{ClaimedBatch, LeaseManager};
use crate::writer::{JobOutcome, ResultWriter};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
    #[error("browser launch failed; {claimed} claimed jobs marked as errors: {source}")]
    Launch {
        claimed: usize,
        #[source]
        source: RenderError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    /// Batches until one claims nothing or `max_total` jobs were processed.
    Drain { max_total: Option<usize> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub lease_lost: usize,
    pub abandoned: usize,
}

impl BatchReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Done => self.done += 1,
            JobOutcome::Failed(kind) => {
                self.failed += 1;
                if kind == FailureKind::NavigationTimeout {
                    self.timed_out += 1;
                }
            }
            JobOutcome::LeaseLost => self.lease_lost += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub fn absorb(&mut self, other: &BatchReport) {
        self.claimed += other.claimed;
        self.done += other.done;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.lease_lost += other.lease_lost;
        self.abandoned += other.abandoned;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub batches: usize,
    pub totals: BatchReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub launch: LaunchOptions,
    pub extract: ExtractOptions,
    pub idle_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            launch: LaunchOptions::default(),
            extract: ExtractOptions::default(),
            idle_backoff: Duration::from_secs(3),
        }
    }
}

/// Holds no state between batches; any number of pools may share one store.
pub struct WorkerPool {
    leases: LeaseManager,
    writer: Arc<ResultWriter>,
    renderer: Arc<dyn Renderer>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        leases: LeaseManager,
        writer: ResultWriter,
        renderer: Arc<dyn Renderer>,
        config: PoolConfig,
    ) -> Self {
        Self {
            leases,
            writer: Arc::new(writer),
            renderer,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub async fn run_batch(&self, concurrency: usize, site_id: Option<&str>) -> Result<BatchReport, PoolError> {
        let filter = ClaimFilter {
            site_id: site_id.map(str::to_string),
            url: None,
        };
        let ClaimedBatch { leases, error } = self.leases.claim_batch(&filter, concurrency.max(1)).await;
        if leases.is_empty() {
            return match error {
                Some(err) => Err(err.into()),
                None => Ok(BatchReport::default()),
            };
        }
        let span = info_span!("batch", site_id = site_id.unwrap_or("*"), claimed = leases.len());
        let report = self.process_leases(leases, concurrency).instrument(span).await?;
        match error {
            Some(err) => {
                warn!(done = report.done, failed = report.failed, "claimed jobs finished before store error");
                Err(err.into())
            }
            None => Ok(report),
        }
    }

    pub async fn run(&self, mode: RunMode, concurrency: usize, site_id: Option<&str>) -> Result<RunReport, PoolError> {
        let concurrency = concurrency.max(1);
        let mut report = RunReport::default();
        match mode {
            RunMode::Once => {
                report.totals = self.run_batch(concurrency, site_id).await?;
                report.batches = 1;
            }
            RunMode::Drain { max_total } => loop {
                let size = match max_total {
                    Some(max) => concurrency.min(max.saturating_sub(report.totals.claimed)),
                    None => concurrency,
                };
                if size == 0 {
                    break;
                }
                let batch = self.run_batch(size, site_id).await?;
                if batch.is_idle() {
                    break;
                }
                report.batches += 1;
                report.totals.absorb(&batch);
            },
        }
        info!(
            batches = report.batches,
            claimed = report.totals.claimed,
            done = report.totals.done,
            failed = report.totals.failed,
            "worker run finished"
        );
        Ok(report)
    }

    /// Long-running loop. Sleeps `idle_backoff` whenever a batch claims nothing
    /// and returns once `shutdown` flips to `true`; an in-flight batch is
    /// always allowed to finish.
    pub async fn run_continuous(
        &self,
        concurrency: usize,
        site_id: Option<&str>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunReport {
        let mut report = RunReport::default();
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            let pause = match self.run_batch(concurrency, site_id).await {
                Ok(batch) if batch.is_idle() => true,
                Ok(batch) => {
                    report.batches += 1;
                    report.totals.absorb(&batch);
                    info!(claimed = batch.claimed, done = batch.done, failed = batch.failed, "batch finished");
                    false
                }
                Err(err) => {
                    error!(error = %err, "worker cycle failed");
                    true
                }
            };
            if pause {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        report
    }

    /// Reset `url` to pending, claim exactly that job and process it now.
    /// `Ok(None)` when another worker claimed it first.
    pub async fn process_url(&self, site_id: &str, url: &str) -> Result<Option<JobOutcome>, PoolError> {
        self.leases.jobs().reprocess(site_id, url, chrono::Utc::now()).await?;
        let Some(lease) = self.leases.claim(&ClaimFilter::exact(site_id, url)).await? else {
            return Ok(None);
        };
        let browser = self.launch(std::slice::from_ref(&lease)).await?;
        let result = extract_page(browser.as_ref(), &lease, &self.config.extract).await;
        let outcome = self.writer.record(&lease, result).await;
        browser.close().await;
        Ok(Some(outcome))
    }

    async fn launch(&self, leases: &[LeasedJob]) -> Result<Arc<dyn Browser>, PoolError> {
        match self.renderer.launch(&self.config.launch).await {
            Ok(browser) => Ok(browser),
            Err(source) => {
                error!(error = %source, claimed = leases.len(), "browser launch failed");
                let failure = JobFailure::navigation(format!("browser launch failed: {source}"));
                for lease in leases {
                    self.writer.record(lease, Err(failure.clone())).await;
                }
                Err(PoolError::Launch {
                    claimed: leases.len(),
                    source,
                })
            }
        }
    }

    async fn process_leases(&self, leases: Vec<LeasedJob>, concurrency: usize) -> Result<BatchReport, PoolError> {
        let browser = self.launch(&leases).await?;
        let mut report = BatchReport {
            claimed: leases.len(),
            ..BatchReport::default()
        };

        let limit = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(leases.len());
        for lease in leases {
            let limit = limit.clone();
            let browser = browser.clone();
            let writer = self.writer.clone();
            let options = self.config.extract;
            let task_lease = lease.clone();
            let handle = tokio::spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let result = extract_page(browser.as_ref(), &task_lease, &options).await;
                writer.record(&task_lease, result).await
            });
            handles.push((lease, handle));
        }

        for (lease, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    warn!(url = lease.url(), error = %join_err, "extraction task crashed");
                    let failure = JobFailure::navigation(format!("extraction task crashed: {join_err}"));
                    self.writer.record(&lease, Err(failure)).await
                }
            };
            report.record(outcome);
        }

        browser.close().await;
        Ok(report)
    }
}
