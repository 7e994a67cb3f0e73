//! Sitemap discovery and job seeding for a site.

use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crawlq_core::{normalize_site_id, CoreError};
use crawlq_storage::{HttpFetcher, JobStore, StoreError};
use scraper::{Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

pub const DEFAULT_MAX_DEPTH: usize = 2;

#[derive(Debug, Error)]
pub enum SitemapError {
    #[error(transparent)]
    InvalidSite(#[from] CoreError),
    #[error("invalid site url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("seeding failed: {0}")]
    Store(#[from] StoreError),
}

/// Text of a 2xx response, or `None` for anything else.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_text(&self, site_id: &str, url: &str) -> Option<String>;
}

#[async_trait]
impl DocumentSource for HttpFetcher {
    async fn fetch_text(&self, site_id: &str, url: &str) -> Option<String> {
        match self.fetch_success(site_id, url).await {
            Ok(resp) => Some(resp.text()),
            Err(err) => {
                debug!(url, error = %err, "sitemap candidate skipped");
                None
            }
        }
    }
}

/// `<loc>` entries of one sitemap document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitemapDocument {
    pub urls: Vec<String>,
    pub children: Vec<String>,
}

fn loc_texts(document: &Html, selector: &str) -> Vec<String> {
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|loc| {
            let text = loc.text().collect::<String>();
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        })
        .collect()
}

/// Replaces `<![CDATA[...]]>` sections with their escaped text, since the HTML
/// parser would read them as comments.
fn inline_cdata(xml: &str) -> Cow<'_, str> {
    const OPEN: &str = "<![CDATA[";
    const CLOSE: &str = "]]>";
    if !xml.contains(OPEN) {
        return Cow::Borrowed(xml);
    }
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let body = &rest[start + OPEN.len()..];
        let (text, after) = match body.find(CLOSE) {
            Some(end) => (&body[..end], &body[end + CLOSE.len()..]),
            None => (body, ""),
        };
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                c => out.push(c),
            }
        }
        rest = after;
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Reads `<urlset>` and `<sitemapindex>` documents. Anything else yields no entries.
pub fn parse_sitemap(xml: &str) -> SitemapDocument {
    let document = Html::parse_document(&inline_cdata(xml));
    SitemapDocument {
        urls: loc_texts(&document, "urlset url > loc"),
        children: loc_texts(&document, "sitemapindex sitemap > loc"),
    }
}

/// `Sitemap:` lines of a robots.txt, resolved against `base`.
pub fn robots_sitemaps(robots: &str, base: &Url) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim();
            let (directive, value) = line.split_once(':')?;
            if !directive.trim().eq_ignore_ascii_case("sitemap") {
                return None;
            }
            let value = value.trim();
            if value.is_empty() {
                return None;
            }
            base.join(value).ok().map(|u| u.to_string())
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub site_id: String,
    pub discovered: usize,
    pub upserted: u64,
    pub pending_total: u64,
}

pub struct SitemapCollector {
    source: Arc<dyn DocumentSource>,
    max_depth: usize,
}

impl SitemapCollector {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self {
            source,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn origin(site_url: &str) -> Result<Url, SitemapError> {
        let parsed = Url::parse(site_url.trim()).map_err(|source| SitemapError::InvalidUrl {
            url: site_url.to_string(),
            source,
        })?;
        parsed.join("/").map_err(|source| SitemapError::InvalidUrl {
            url: site_url.to_string(),
            source,
        })
    }

    async fn discover_with_bodies(&self, site_url: &str) -> Result<Vec<(String, String)>, SitemapError> {
        let site_id = normalize_site_id(site_url)?;
        let origin = Self::origin(site_url)?;

        let mut candidates = Vec::new();
        if let Ok(robots_url) = origin.join("/robots.txt") {
            if let Some(robots) = self.source.fetch_text(&site_id, robots_url.as_str()).await {
                candidates.extend(robots_sitemaps(&robots, &origin));
            }
        }
        if let Ok(fallback) = origin.join("/sitemap.xml") {
            candidates.push(fallback.to_string());
        }

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for candidate in candidates {
            if !seen.insert(candidate.clone()) {
                continue;
            }
            if let Some(body) = self.source.fetch_text(&site_id, &candidate).await {
                found.push((candidate, body));
            }
        }
        Ok(found)
    }

    /// Sitemaps from robots.txt plus `/sitemap.xml`, keeping only those that answer 2xx.
    pub async fn discover_sitemaps(&self, site_url: &str) -> Result<Vec<String>, SitemapError> {
        Ok(self
            .discover_with_bodies(site_url)
            .await?
            .into_iter()
            .map(|(url, _)| url)
            .collect())
    }

    /// Breadth-first over discovered sitemaps and nested indexes up to `max_depth`.
    #[instrument(skip(self))]
    pub async fn collect_urls(&self, site_url: &str) -> Result<Vec<String>, SitemapError> {
        let site_id = normalize_site_id(site_url)?;
        let roots = self.discover_with_bodies(site_url).await?;

        let mut visited: HashSet<String> = roots.iter().map(|(url, _)| url.clone()).collect();
        let mut queue: VecDeque<(String, usize, Option<String>)> =
            roots.into_iter().map(|(url, body)| (url, 0, Some(body))).collect();
        let mut seen_urls = HashSet::new();
        let mut urls = Vec::new();

        while let Some((sitemap_url, depth, body)) = queue.pop_front() {
            let body = match body {
                Some(body) => body,
                None => match self.source.fetch_text(&site_id, &sitemap_url).await {
                    Some(body) => body,
                    None => continue,
                },
            };
            let parsed = parse_sitemap(&body);
            debug!(sitemap_url, depth, urls = parsed.urls.len(), children = parsed.children.len(), "parsed sitemap");
            for url in parsed.urls {
                if seen_urls.insert(url.clone()) {
                    urls.push(url);
                }
            }
            if depth < self.max_depth {
                let parent = Url::parse(&sitemap_url).ok();
                for child in parsed.children {
                    let child = match parent.as_ref().map(|p| p.join(&child)) {
                        Some(Ok(resolved)) => resolved.to_string(),
                        _ => child,
                    };
                    if visited.insert(child.clone()) {
                        queue.push_back((child, depth + 1, None));
                    }
                }
            }
        }
        Ok(urls)
    }

    /// Collect the site's URLs and seed them as pending jobs.
    pub async fn ingest(&self, jobs: &dyn JobStore, site_url: &str) -> Result<IngestReport, SitemapError> {
        let site_id = normalize_site_id(site_url)?;
        let urls = self.collect_urls(site_url).await?;
        let seeded = jobs.seed(&site_id, &urls, Utc::now()).await?;
        let counts = jobs.status_counts(&site_id).await?;
        info!(
            site_id = %site_id,
            discovered = urls.len(),
            upserted = seeded.upserted,
            pending = counts.pending,
            "site ingested"
        );
        Ok(IngestReport {
            site_id,
            discovered: urls.len(),
            upserted: seeded.upserted,
            pending_total: counts.pending,
        })
    }
}
