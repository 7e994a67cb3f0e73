//! Per-page extraction: drive one browser session and derive page metrics.

use std::fmt::Display;
use std::time::{Duration, Instant};

use chrono::Utc;
use crawlq_core::{AccessibilitySignals, ImageFormatCounts, ImageSignals, JobFailure, LeasedJob, PageRecord};
use crawlq_render::{AnchorInfo, Browser, BrowserSession, ImageInfo, NavigateOptions, Readiness, RenderError};
use crawlq_storage::sha256_hex;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

pub const EXCERPT_CHARS: usize = 2000;
pub const LARGE_IMAGE_SIDE: u32 = 1600;
pub const LARGE_IMAGE_AREA: u64 = 2_000_000;
pub const MAX_LARGE_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub navigation_timeout: Duration,
    pub readiness: Readiness,
    pub capture_screenshots: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(45),
            readiness: Readiness::NetworkIdle,
            capture_screenshots: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub page: PageRecord,
    pub screenshot: Option<Vec<u8>>,
}

/// Lowercased, whitespace-collapsed, trimmed.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hash of the normalized visible text, so markup-only changes keep the hash.
pub fn content_hash(visible_text: &str) -> String {
    sha256_hex(normalize_text(visible_text).as_bytes())
}

pub fn word_count(visible_text: &str) -> u64 {
    visible_text.split_whitespace().count() as u64
}

pub fn excerpt(content: &str) -> String {
    content.chars().take(EXCERPT_CHARS).collect()
}

/// Lowercase extension of the URL path, `jpe` folded into `jpeg`.
pub fn image_extension(src: &str) -> Option<String> {
    let path = match Url::parse(src) {
        Ok(url) => url.path().to_string(),
        Err(_) => src.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if ext.is_empty() {
        return None;
    }
    Some(if ext == "jpe" { "jpeg".to_string() } else { ext })
}

pub fn is_oversized(width: Option<u32>, height: Option<u32>) -> bool {
    let w = width.unwrap_or(0);
    let h = height.unwrap_or(0);
    w >= LARGE_IMAGE_SIDE || h >= LARGE_IMAGE_SIDE || u64::from(w) * u64::from(h) >= LARGE_IMAGE_AREA
}

pub fn image_signals(images: &[ImageInfo]) -> ImageSignals {
    let mut counts = ImageFormatCounts::default();
    let mut large_dimensions = 0;
    let mut sample_large = Vec::new();
    for image in images {
        counts.record(image_extension(&image.src).as_deref().unwrap_or(""));
        if is_oversized(image.width, image.height) {
            large_dimensions += 1;
            if sample_large.len() < MAX_LARGE_SAMPLES {
                sample_large.push(image.src.clone());
            }
        }
    }
    ImageSignals {
        total: images.len() as u32,
        counts,
        large_dimensions,
        sample_large,
    }
}

pub fn accessibility_signals(images: &[ImageInfo], anchors: &[AnchorInfo], h1_count: usize) -> AccessibilitySignals {
    let blank = |value: Option<&str>| value.map_or(true, |v| v.trim().is_empty());
    AccessibilitySignals {
        images_missing_alt: images.iter().filter(|img| blank(img.alt.as_deref())).count() as u32,
        anchors_without_text: anchors
            .iter()
            .filter(|a| blank(Some(&a.text)) && blank(a.aria_label.as_deref()))
            .count() as u32,
        h1_count: h1_count as u32,
    }
}

fn degrade<T: Default>(url: &str, query: &str, result: Result<T, RenderError>) -> T {
    result.unwrap_or_else(|err| {
        warn!(url, query, error = %err, "page query failed; using default");
        T::default()
    })
}

fn navigation_failure(url: &str, timeout: Duration, err: impl Display, timed_out: bool) -> JobFailure {
    if timed_out {
        JobFailure::navigation_timeout(url, timeout)
    } else {
        JobFailure::navigation(format!("navigation to {url} failed: {err}"))
    }
}

/// Load `lease.url()` in a fresh session and build its page record. Only
/// navigation problems fail the job; query failures fall back to defaults.
pub async fn extract_page(
    browser: &dyn Browser,
    lease: &LeasedJob,
    options: &ExtractOptions,
) -> Result<Extraction, JobFailure> {
    let span = info_span!("extract", site_id = lease.site_id(), url = lease.url(), attempt = lease.attempts());
    async {
        let mut session = browser
            .new_session()
            .await
            .map_err(|err| JobFailure::navigation(format!("could not open browser session: {err}")))?;
        let result = extract_with_session(session.as_mut(), lease, options).await;
        session.close().await;
        result
    }
    .instrument(span)
    .await
}

async fn extract_with_session(
    session: &mut dyn BrowserSession,
    lease: &LeasedJob,
    options: &ExtractOptions,
) -> Result<Extraction, JobFailure> {
    let url = lease.url();
    let timeout = options.navigation_timeout;
    let nav = NavigateOptions {
        timeout,
        readiness: options.readiness,
    };

    let started = Instant::now();
    let response = match tokio::time::timeout(timeout, session.navigate(url, &nav)).await {
        Err(_) => return Err(navigation_failure(url, timeout, "deadline elapsed", true)),
        Ok(Err(err)) => {
            let timed_out = err.is_timeout();
            return Err(navigation_failure(url, timeout, err, timed_out));
        }
        Ok(Ok(response)) => response,
    };
    let load_time_ms = started.elapsed().as_millis() as u64;
    debug!(load_time_ms, status = ?response.as_ref().map(|r| r.status), "navigation finished");

    let title = degrade(url, "title", session.title().await);
    let content = degrade(url, "content", session.content().await);
    let meta_description = degrade(url, "meta_description", session.meta_description().await);
    let canonical_url = degrade(url, "canonical_url", session.canonical_url().await);
    let text = degrade(url, "inner_text", session.inner_text().await);
    let images = degrade(url, "images", session.images().await);
    let anchors = degrade(url, "anchors", session.anchors().await);
    let h1_count = degrade(url, "h1_count", session.count("h1").await);

    let screenshot = if options.capture_screenshots {
        match session.screenshot().await {
            Ok(bytes) => Some(bytes),
            Err(RenderError::Unsupported(_)) => None,
            Err(err) => {
                warn!(url, error = %err, "screenshot failed");
                None
            }
        }
    } else {
        None
    };

    let visible = text.trim();
    let page = PageRecord {
        site_id: lease.site_id().to_string(),
        url: url.to_string(),
        status_code: response.as_ref().map(|r| r.status),
        content_type: response.and_then(|r| r.content_type),
        fetched_at: Utc::now(),
        load_time_ms: Some(load_time_ms),
        title_length: title.chars().count() as u32,
        title: Some(title),
        meta_description,
        canonical_url,
        content_length: content.chars().count() as u64,
        text_excerpt: excerpt(&content),
        text_content: (!visible.is_empty()).then(|| visible.to_string()),
        word_count: word_count(visible),
        content_hash: content_hash(visible),
        a11y: accessibility_signals(&images, &anchors, h1_count),
        images: image_signals(&images),
        screenshot_path: None,
        content,
    };

    Ok(Extraction { page, screenshot })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(src: &str, alt: Option<&str>, w: Option<u32>, h: Option<u32>) -> ImageInfo {
        ImageInfo {
            src: src.to_string(),
            alt: alt.map(str::to_string),
            width: w,
            height: h,
        }
    }

    #[test]
    fn hash_ignores_case_and_whitespace_but_not_words() {
        assert_eq!(content_hash("Hello   World\n"), content_hash("hello world"));
        assert_ne!(content_hash("hello world"), content_hash("hello there"));
        assert_eq!(content_hash(""), sha256_hex(b""));
    }

    #[test]
    fn excerpt_is_char_bounded() {
        let long = "é".repeat(EXCERPT_CHARS + 10);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_CHARS);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn extensions_come_from_the_url_path() {
        assert_eq!(image_extension("https://x.test/a/b.JPE?v=2").as_deref(), Some("jpeg"));
        assert_eq!(image_extension("https://x.test/img.webp#frag").as_deref(), Some("webp"));
        assert_eq!(image_extension("https://x.test/noext"), None);
        assert_eq!(image_extension("https://x.test/dir.v2/"), None);
        assert_eq!(image_extension("data:image/png;base64,AAAA"), None);
    }

    #[test]
    fn oversized_by_side_or_area() {
        assert!(is_oversized(Some(1600), Some(10)));
        assert!(is_oversized(None, Some(1600)));
        assert!(is_oversized(Some(1500), Some(1400)));
        assert!(!is_oversized(Some(1200), Some(1000)));
        assert!(!is_oversized(None, None));
    }

    #[test]
    fn image_signals_bucket_and_sample_at_most_five() {
        let mut images: Vec<ImageInfo> = (0..7)
            .map(|i| img(&format!("https://x.test/big{i}.png"), Some("big"), Some(2000), Some(10)))
            .collect();
        images.push(img("https://x.test/small.svg", None, Some(16), Some(16)));
        images.push(img("https://x.test/unknown", Some(""), None, None));

        let signals = image_signals(&images);
        assert_eq!(signals.total, 9);
        assert_eq!(signals.counts.png, 7);
        assert_eq!(signals.counts.svg, 1);
        assert_eq!(signals.counts.other, 1);
        assert_eq!(signals.large_dimensions, 7);
        assert_eq!(signals.sample_large.len(), MAX_LARGE_SAMPLES);
        assert_eq!(signals.sample_large[0], "https://x.test/big0.png");

        let a11y = accessibility_signals(&images, &[], 2);
        assert_eq!(a11y.images_missing_alt, 2);
        assert_eq!(a11y.h1_count, 2);
    }

    #[test]
    fn anchors_need_text_or_aria_label() {
        let anchors = vec![
            AnchorInfo { text: "Docs".into(), aria_label: None },
            AnchorInfo { text: "  ".into(), aria_label: Some("Close".into()) },
            AnchorInfo { text: "".into(), aria_label: Some(" ".into()) },
            AnchorInfo { text: "".into(), aria_label: None },
        ];
        assert_eq!(accessibility_signals(&[], &anchors, 0).anchors_without_text, 2);
    }
}
