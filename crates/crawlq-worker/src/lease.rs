use std::sync::Arc;

use chrono::Utc;
use crawlq_core::{LeasePolicy, LeasedJob};
use crawlq_storage::{ClaimFilter, JobStore, StoreError};
use tracing::{debug, info, warn};

/// Reclaims stale leases, then claims one pending job per call.
#[derive(Clone)]
pub struct LeaseManager {
    jobs: Arc<dyn JobStore>,
    policy: LeasePolicy,
}

impl LeaseManager {
    pub fn new(jobs: Arc<dyn JobStore>, policy: LeasePolicy) -> Self {
        Self { jobs, policy }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    /// Stale leases are reclaimed across every site, not only the filtered one.
    pub async fn claim(&self, filter: &ClaimFilter) -> Result<Option<LeasedJob>, StoreError> {
        let now = Utc::now();
        let reclaimed = self.jobs.reclaim_stale(&self.policy, None, now).await?;
        if reclaimed > 0 {
            info!(reclaimed, "requeued stale leases");
        }
        let lease = self.jobs.claim_next(filter, now).await?;
        if let Some(lease) = &lease {
            debug!(url = lease.url(), attempt = lease.attempts(), "claimed job");
        }
        Ok(lease)
    }

    /// Up to `max` claims, one after another; stops at the first empty claim.
    /// A store error ends the batch early but keeps the leases already taken,
    /// so the caller can still finish them.
    pub async fn claim_batch(&self, filter: &ClaimFilter, max: usize) -> ClaimedBatch {
        let mut batch = ClaimedBatch {
            leases: Vec::with_capacity(max),
            error: None,
        };
        while batch.leases.len() < max {
            match self.claim(filter).await {
                Ok(Some(lease)) => batch.leases.push(lease),
                Ok(None) => break,
                Err(err) => {
                    warn!(claimed = batch.leases.len(), error = %err, "claiming stopped early");
                    batch.error = Some(err);
                    break;
                }
            }
        }
        batch
    }
}

#[derive(Debug)]
pub struct ClaimedBatch {
    pub leases: Vec<LeasedJob>,
    pub error: Option<StoreError>,
}
