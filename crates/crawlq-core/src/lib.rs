//! Core job/page model and lease state machine for crawlq.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "crawlq-core";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid site url {url}: {reason}")]
    InvalidSiteUrl { url: String, reason: String },
    #[error("cannot {action} a job in status {from}")]
    InvalidTransition { action: &'static str, from: JobStatus },
    #[error("unknown job status {0:?}")]
    UnknownStatus(String),
    #[error("unknown failure kind {0:?}")]
    UnknownFailureKind(String),
    #[error("inconsistent job record {site_id} {url}: {reason}")]
    InconsistentRecord {
        site_id: String,
        url: String,
        reason: &'static str,
    },
}

/// Lowercase hostname used as the site identifier for every job and page.
pub fn normalize_site_id(site_url: &str) -> Result<String, CoreError> {
    let parsed = Url::parse(site_url.trim()).map_err(|e| CoreError::InvalidSiteUrl {
        url: site_url.to_string(),
        reason: e.to_string(),
    })?;
    parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| CoreError::InvalidSiteUrl {
            url: site_url.to_string(),
            reason: "url has no host".to_string(),
        })
}

/// Flat status as persisted in the `links` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Programmatic category paired with the operator-facing failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NavigationTimeout,
    Navigation,
    Store,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigationTimeout => "navigation_timeout",
            Self::Navigation => "navigation",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigation_timeout" => Ok(Self::NavigationTimeout),
            "navigation" => Ok(Self::Navigation),
            "store" => Ok(Self::Store),
            other => Err(CoreError::UnknownFailureKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn navigation_timeout(url: &str, timeout: Duration) -> Self {
        Self::new(
            FailureKind::NavigationTimeout,
            format!("navigation to {url} timed out after {}ms", timeout.as_millis()),
        )
    }

    pub fn navigation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Navigation, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Store, message)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Closed job state set. Only `InProgress` carries a lease timestamp and only
/// `Error` carries a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InProgress { leased_at: DateTime<Utc> },
    Done,
    Error { last_error: String, failure: FailureKind },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::InProgress { .. } => JobStatus::InProgress,
            Self::Done => JobStatus::Done,
            Self::Error { .. } => JobStatus::Error,
        }
    }

    pub fn leased_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::InProgress { leased_at } => Some(*leased_at),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::Error { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Error { failure, .. } => Some(*failure),
            _ => None,
        }
    }
}

/// Claim ordering knobs for the stale-lease pass and the retry paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub lease_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl LeasePolicy {
    /// Leases taken before this instant are stale.
    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        now.checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn allows_another_attempt(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// One queued URL of a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkJob {
    pub id: Uuid,
    pub site_id: String,
    pub url: String,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ingest_id: Option<Uuid>,
}

/// Proof that a job was claimed. Handed to the extraction pipeline and used to
/// fence the final status transition against reclaimed leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeasedJob {
    id: Uuid,
    site_id: String,
    url: String,
    attempts: u32,
    leased_at: DateTime<Utc>,
}

impl LeasedJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn leased_at(&self) -> DateTime<Utc> {
        self.leased_at
    }
}

impl LinkJob {
    pub fn new_pending(site_id: impl Into<String>, url: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id: site_id.into(),
            url: url.into(),
            state: JobState::Pending,
            attempts: 0,
            created_at,
            updated_at: created_at,
            ingest_id: None,
        }
    }

    /// Rebuild a job from flat stored columns, rejecting rows that break the
    /// state invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        site_id: String,
        url: String,
        status: JobStatus,
        leased_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        failure: Option<FailureKind>,
        attempts: u32,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        ingest_id: Option<Uuid>,
    ) -> Result<Self, CoreError> {
        let inconsistent = |reason: &'static str| CoreError::InconsistentRecord {
            site_id: site_id.clone(),
            url: url.clone(),
            reason,
        };
        let state = match status {
            JobStatus::Pending => {
                if leased_at.is_some() {
                    return Err(inconsistent("pending job carries a lease"));
                }
                JobState::Pending
            }
            JobStatus::InProgress => {
                let leased_at = leased_at.ok_or_else(|| inconsistent("in_progress job without lease"))?;
                if attempts == 0 {
                    return Err(inconsistent("in_progress job with zero attempts"));
                }
                JobState::InProgress { leased_at }
            }
            JobStatus::Done => JobState::Done,
            JobStatus::Error => JobState::Error {
                last_error: last_error.ok_or_else(|| inconsistent("error job without last_error"))?,
                failure: failure.unwrap_or(FailureKind::Navigation),
            },
        };
        Ok(Self {
            id,
            site_id,
            url,
            state,
            attempts,
            created_at,
            updated_at,
            ingest_id,
        })
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn leased_at(&self) -> Option<DateTime<Utc>> {
        self.state.leased_at()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.state.last_error()
    }

    fn invalid(&self, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            action,
            from: self.status(),
        }
    }

    /// `pending -> in_progress`, counting one more attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<LeasedJob, CoreError> {
        if self.state != JobState::Pending {
            return Err(self.invalid("claim"));
        }
        self.state = JobState::InProgress { leased_at: now };
        self.attempts += 1;
        self.updated_at = now;
        self.as_leased()
    }

    /// View of an `in_progress` job as the lease its worker holds.
    pub fn as_leased(&self) -> Result<LeasedJob, CoreError> {
        match self.state {
            JobState::InProgress { leased_at } => Ok(LeasedJob {
                id: self.id,
                site_id: self.site_id.clone(),
                url: self.url.clone(),
                attempts: self.attempts,
                leased_at,
            }),
            _ => Err(self.invalid("lease")),
        }
    }

    pub fn holds_lease(&self, lease: &LeasedJob) -> bool {
        self.id == lease.id && self.leased_at() == Some(lease.leased_at)
    }

    pub fn is_stale(&self, policy: &LeasePolicy, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::InProgress { leased_at } => {
                leased_at < policy.stale_cutoff(now) && policy.allows_another_attempt(self.attempts)
            }
            _ => false,
        }
    }

    /// `in_progress -> pending` for an abandoned lease.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status() != JobStatus::InProgress {
            return Err(self.invalid("reclaim"));
        }
        self.state = JobState::Pending;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status() != JobStatus::InProgress {
            return Err(self.invalid("complete"));
        }
        self.state = JobState::Done;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, failure: &JobFailure, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status() != JobStatus::InProgress {
            return Err(self.invalid("fail"));
        }
        self.state = JobState::Error {
            last_error: failure.message.clone(),
            failure: failure.kind,
        };
        self.updated_at = now;
        Ok(())
    }

    /// `error -> pending` while attempts remain. Returns whether the job was requeued.
    pub fn retry(&mut self, policy: &LeasePolicy, now: DateTime<Utc>) -> Result<bool, CoreError> {
        if self.status() != JobStatus::Error {
            return Err(self.invalid("retry"));
        }
        if !policy.allows_another_attempt(self.attempts) {
            return Ok(false);
        }
        self.state = JobState::Pending;
        self.updated_at = now;
        Ok(true)
    }

    /// Explicit operator reset from any state: pending again with a fresh attempt budget.
    pub fn reset(&mut self, ingest_id: Option<Uuid>, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = 0;
        self.updated_at = now;
        if ingest_id.is_some() {
            self.ingest_id = ingest_id;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub error: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.error
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::InProgress => self.in_progress += count,
            JobStatus::Done => self.done += count,
            JobStatus::Error => self.error += count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilitySignals {
    pub images_missing_alt: u32,
    pub anchors_without_text: u32,
    pub h1_count: u32,
}

/// Image count per file-extension bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFormatCounts {
    pub avif: u32,
    pub webp: u32,
    pub jpeg: u32,
    pub jpg: u32,
    pub png: u32,
    pub gif: u32,
    pub svg: u32,
    pub other: u32,
}

impl ImageFormatCounts {
    pub fn record(&mut self, extension: &str) {
        let slot = match extension {
            "avif" => &mut self.avif,
            "webp" => &mut self.webp,
            "jpeg" | "jpe" => &mut self.jpeg,
            "jpg" => &mut self.jpg,
            "png" => &mut self.png,
            "gif" => &mut self.gif,
            "svg" => &mut self.svg,
            _ => &mut self.other,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u32 {
        self.avif + self.webp + self.jpeg + self.jpg + self.png + self.gif + self.svg + self.other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSignals {
    pub total: u32,
    pub counts: ImageFormatCounts,
    pub large_dimensions: u32,
    pub sample_large: Vec<String>,
}

/// Materialized fetch result for one (site, url); replaced on every successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub site_id: String,
    pub url: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub load_time_ms: Option<u64>,
    pub title: Option<String>,
    pub title_length: u32,
    pub meta_description: Option<String>,
    pub canonical_url: Option<String>,
    pub content: String,
    pub content_length: u64,
    pub text_excerpt: String,
    pub text_content: Option<String>,
    pub word_count: u64,
    pub content_hash: String,
    pub a11y: AccessibilitySignals,
    pub images: ImageSignals,
    pub screenshot_path: Option<String>,
}
