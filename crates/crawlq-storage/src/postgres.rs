//! PostgreSQL job and page store.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlq_core::{
    AccessibilitySignals, FailureKind, ImageFormatCounts, ImageSignals, JobFailure, JobStatus, LeasePolicy,
    LeasedJob, LinkJob, PageRecord, StatusCounts,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::store::{seed_created_at, ClaimFilter, JobStore, PageStore, ReprocessOutcome, SeedSummary, StoreError};

const JOB_COLUMNS: &str =
    "id, site_id, url, status, leased_at, last_error, last_error_kind, attempts, created_at, updated_at, ingest_id";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> Result<LinkJob, StoreError> {
    let status: String = row.try_get("status")?;
    let failure: Option<String> = row.try_get("last_error_kind")?;
    let attempts: i32 = row.try_get("attempts")?;
    let job = LinkJob::restore(
        row.try_get("id")?,
        row.try_get("site_id")?,
        row.try_get("url")?,
        status.parse::<JobStatus>()?,
        row.try_get("leased_at")?,
        row.try_get("last_error")?,
        failure.as_deref().map(str::parse::<FailureKind>).transpose()?,
        attempts.max(0) as u32,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
        row.try_get("ingest_id")?,
    )?;
    Ok(job)
}

fn page_from_row(row: &PgRow) -> Result<PageRecord, StoreError> {
    let status_code: Option<i32> = row.try_get("status_code")?;
    let load_time_ms: Option<i64> = row.try_get("load_time_ms")?;
    let Json(counts): Json<ImageFormatCounts> = row.try_get("image_formats")?;
    let Json(sample_large): Json<Vec<String>> = row.try_get("large_image_samples")?;
    let as_u32 = |name: &str| -> Result<u32, StoreError> { Ok(row.try_get::<i32, _>(name)?.max(0) as u32) };
    let as_u64 = |name: &str| -> Result<u64, StoreError> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };

    Ok(PageRecord {
        site_id: row.try_get("site_id")?,
        url: row.try_get("url")?,
        status_code: status_code.and_then(|s| u16::try_from(s).ok()),
        content_type: row.try_get("content_type")?,
        fetched_at: row.try_get("fetched_at")?,
        load_time_ms: load_time_ms.map(|ms| ms.max(0) as u64),
        title: row.try_get("title")?,
        title_length: as_u32("title_length")?,
        meta_description: row.try_get("meta_description")?,
        canonical_url: row.try_get("canonical_url")?,
        content: row.try_get("content")?,
        content_length: as_u64("content_length")?,
        text_excerpt: row.try_get("text_excerpt")?,
        text_content: row.try_get("text_content")?,
        word_count: as_u64("word_count")?,
        content_hash: row.try_get("content_hash")?,
        a11y: AccessibilitySignals {
            images_missing_alt: as_u32("images_missing_alt")?,
            anchors_without_text: as_u32("anchors_without_text")?,
            h1_count: as_u32("h1_count")?,
        },
        images: ImageSignals {
            total: as_u32("image_total")?,
            counts,
            large_dimensions: as_u32("large_image_count")?,
            sample_large,
        },
        screenshot_path: row.try_get("screenshot_path")?,
    })
}

fn unique_urls(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter()
        .filter(|u| seen.insert(u.as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip(self, urls), fields(count = urls.len()))]
    async fn seed(&self, site_id: &str, urls: &[String], now: DateTime<Utc>) -> Result<SeedSummary, StoreError> {
        let urls = unique_urls(urls);
        if urls.is_empty() {
            return Ok(SeedSummary::default());
        }
        let ids: Vec<Uuid> = urls.iter().map(|_| Uuid::new_v4()).collect();
        let created: Vec<DateTime<Utc>> = (0..urls.len()).map(|i| seed_created_at(now, i)).collect();

        let rows = sqlx::query(
            r#"
            INSERT INTO links (id, site_id, url, status, attempts, created_at, updated_at)
            SELECT s.id, $1, s.url, 'pending', 0, s.created_at, s.created_at
              FROM UNNEST($2::uuid[], $3::text[], $4::timestamptz[]) AS s(id, url, created_at)
            ON CONFLICT (site_id, url) DO UPDATE
               SET updated_at = $5
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(site_id)
        .bind(&ids)
        .bind(&urls)
        .bind(&created)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SeedSummary::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                summary.upserted += 1;
            } else {
                summary.matched += 1;
            }
        }
        Ok(summary)
    }

    async fn reclaim_stale(
        &self,
        policy: &LeasePolicy,
        site_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE links
               SET status = 'pending',
                   leased_at = NULL,
                   updated_at = $1
             WHERE status = 'in_progress'
               AND leased_at < $2
               AND attempts < $3
               AND ($4::text IS NULL OR site_id = $4)
            "#,
        )
        .bind(now)
        .bind(policy.stale_cutoff(now))
        .bind(policy.max_attempts as i32)
        .bind(site_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_next(&self, filter: &ClaimFilter, now: DateTime<Utc>) -> Result<Option<LeasedJob>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                  FROM links
                 WHERE status = 'pending'
                   AND ($1::text IS NULL OR site_id = $1)
                   AND ($2::text IS NULL OR url = $2)
                 ORDER BY created_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE links l
               SET status = 'in_progress',
                   leased_at = $3,
                   attempts = l.attempts + 1,
                   updated_at = $3
              FROM next
             WHERE l.id = next.id
            RETURNING l.id, l.site_id, l.url, l.status, l.leased_at, l.last_error, l.last_error_kind,
                      l.attempts, l.created_at, l.updated_at, l.ingest_id
            "#,
        )
        .bind(filter.site_id.as_deref())
        .bind(filter.url.as_deref())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to claim job");
            StoreError::Database(e)
        })?;

        match row {
            Some(row) => Ok(Some(job_from_row(&row)?.as_leased()?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, lease: &LeasedJob, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE links
               SET status = 'done',
                   leased_at = NULL,
                   last_error = NULL,
                   last_error_kind = NULL,
                   updated_at = $3
             WHERE id = $1
               AND status = 'in_progress'
               AND leased_at = $2
            "#,
        )
        .bind(lease.id())
        .bind(lease.leased_at())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, lease: &LeasedJob, failure: &JobFailure, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE links
               SET status = 'error',
                   leased_at = NULL,
                   last_error = $3,
                   last_error_kind = $4,
                   updated_at = $5
             WHERE id = $1
               AND status = 'in_progress'
               AND leased_at = $2
            "#,
        )
        .bind(lease.id())
        .bind(lease.leased_at())
        .bind(&failure.message)
        .bind(failure.kind.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn retry_errors(&self, site_id: &str, policy: &LeasePolicy, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE links
               SET status = 'pending',
                   last_error = NULL,
                   last_error_kind = NULL,
                   updated_at = $3
             WHERE site_id = $1
               AND status = 'error'
               AND attempts < $2
            "#,
        )
        .bind(site_id)
        .bind(policy.max_attempts as i32)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn refetch_site(&self, site_id: &str, ingest_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE links
               SET status = 'pending',
                   attempts = 0,
                   leased_at = NULL,
                   last_error = NULL,
                   last_error_kind = NULL,
                   ingest_id = $2,
                   updated_at = $3
             WHERE site_id = $1
            "#,
        )
        .bind(site_id)
        .bind(ingest_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reprocess(&self, site_id: &str, url: &str, now: DateTime<Utc>) -> Result<ReprocessOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO links (id, site_id, url, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4)
            ON CONFLICT (site_id, url) DO UPDATE
               SET status = 'pending',
                   attempts = 0,
                   leased_at = NULL,
                   last_error = NULL,
                   last_error_kind = NULL,
                   updated_at = EXCLUDED.updated_at
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(site_id)
        .bind(url)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(ReprocessOutcome {
            job_id: row.try_get("id")?,
            inserted: row.try_get("inserted")?,
        })
    }

    async fn retry_jobs(&self, site_id: &str, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE links
               SET status = 'pending',
                   attempts = 0,
                   leased_at = NULL,
                   last_error = NULL,
                   last_error_kind = NULL,
                   updated_at = $3
             WHERE site_id = $1
               AND id = ANY($2)
            "#,
        )
        .bind(site_id)
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_errors(&self, site_id: &str, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM links WHERE site_id = $1 AND id = ANY($2) AND status = 'error'")
            .bind(site_id)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_site_jobs(&self, site_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM links WHERE site_id = $1")
            .bind(site_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_job(&self, site_id: &str, url: &str) -> Result<Option<LinkJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM links WHERE site_id = $1 AND url = $2"))
            .bind(site_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        site_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<LinkJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM links
             WHERE site_id = $1
               AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at, id
             LIMIT $3
            "#
        ))
        .bind(site_id)
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn status_counts(&self, site_id: &str) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM links WHERE site_id = $1 GROUP BY status")
            .bind(site_id)
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.add(status.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl PageStore for PgStore {
    #[instrument(skip(self, page), fields(site_id = %page.site_id, url = %page.url))]
    async fn upsert_page(&self, page: &PageRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pages (
                site_id, url, status_code, content_type, fetched_at, load_time_ms,
                title, title_length, meta_description, canonical_url,
                content, content_length, text_excerpt, text_content, word_count, content_hash,
                images_missing_alt, anchors_without_text, h1_count,
                image_total, image_formats, large_image_count, large_image_samples, screenshot_path
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (site_id, url) DO UPDATE
               SET status_code = EXCLUDED.status_code,
                   content_type = EXCLUDED.content_type,
                   fetched_at = EXCLUDED.fetched_at,
                   load_time_ms = EXCLUDED.load_time_ms,
                   title = EXCLUDED.title,
                   title_length = EXCLUDED.title_length,
                   meta_description = EXCLUDED.meta_description,
                   canonical_url = EXCLUDED.canonical_url,
                   content = EXCLUDED.content,
                   content_length = EXCLUDED.content_length,
                   text_excerpt = EXCLUDED.text_excerpt,
                   text_content = EXCLUDED.text_content,
                   word_count = EXCLUDED.word_count,
                   content_hash = EXCLUDED.content_hash,
                   images_missing_alt = EXCLUDED.images_missing_alt,
                   anchors_without_text = EXCLUDED.anchors_without_text,
                   h1_count = EXCLUDED.h1_count,
                   image_total = EXCLUDED.image_total,
                   image_formats = EXCLUDED.image_formats,
                   large_image_count = EXCLUDED.large_image_count,
                   large_image_samples = EXCLUDED.large_image_samples,
                   screenshot_path = EXCLUDED.screenshot_path
            "#,
        )
        .bind(&page.site_id)
        .bind(&page.url)
        .bind(page.status_code.map(i32::from))
        .bind(&page.content_type)
        .bind(page.fetched_at)
        .bind(page.load_time_ms.map(|ms| ms as i64))
        .bind(&page.title)
        .bind(page.title_length as i32)
        .bind(&page.meta_description)
        .bind(&page.canonical_url)
        .bind(&page.content)
        .bind(page.content_length as i64)
        .bind(&page.text_excerpt)
        .bind(&page.text_content)
        .bind(page.word_count as i64)
        .bind(&page.content_hash)
        .bind(page.a11y.images_missing_alt as i32)
        .bind(page.a11y.anchors_without_text as i32)
        .bind(page.a11y.h1_count as i32)
        .bind(page.images.total as i32)
        .bind(Json(&page.images.counts))
        .bind(page.images.large_dimensions as i32)
        .bind(Json(&page.images.sample_large))
        .bind(&page.screenshot_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_page(&self, site_id: &str, url: &str) -> Result<Option<PageRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM pages WHERE site_id = $1 AND url = $2")
            .bind(site_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(page_from_row).transpose()
    }

    async fn delete_site_pages(&self, site_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM pages WHERE site_id = $1")
            .bind(site_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
