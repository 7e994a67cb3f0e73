//! Renderer contracts used by the extraction pipeline, plus a static HTTP
//! renderer that answers DOM queries from the fetched markup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crawlq_storage::{FetchError, HttpClientConfig, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "crawlq-render";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
        }
    }
}

/// When a navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Load,
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigateOptions {
    pub timeout: Duration,
    pub readiness: Readiness,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            readiness: Readiness::NetworkIdle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub final_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Source resolved against the document URL.
    pub src: String,
    pub alt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorInfo {
    pub text: String,
    pub aria_label: Option<String>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("navigation to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("no document loaded")]
    NoDocument,
    #[error("page query failed: {0}")]
    Evaluation(String),
    #[error("{0} is not supported by this renderer")]
    Unsupported(&'static str),
    #[error("browser launch failed: {0}")]
    Launch(String),
}

impl RenderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Starts browsers. One browser is shared by every job of a batch.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Browser>, RenderError>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Isolated session (own cookies and storage) for a single job.
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>, RenderError>;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// `Ok(None)` when the navigation settled without a main-document response.
    async fn navigate(
        &mut self,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<Option<NavigationResponse>, RenderError>;

    async fn title(&self) -> Result<String, RenderError>;

    /// Full rendered markup.
    async fn content(&self) -> Result<String, RenderError>;

    async fn meta_description(&self) -> Result<Option<String>, RenderError>;

    async fn canonical_url(&self) -> Result<Option<String>, RenderError>;

    async fn inner_text(&self) -> Result<String, RenderError>;

    async fn images(&self) -> Result<Vec<ImageInfo>, RenderError>;

    async fn anchors(&self) -> Result<Vec<AnchorInfo>, RenderError>;

    async fn count(&self, selector: &str) -> Result<usize, RenderError>;

    async fn screenshot(&self) -> Result<Vec<u8>, RenderError> {
        Err(RenderError::Unsupported("screenshot"))
    }

    async fn close(&mut self);
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, RenderError> {
    Selector::parse(selector).map_err(|e| RenderError::Evaluation(format!("{selector}: {e}")))
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, RenderError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>())))
}

fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Result<Option<String>, RenderError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

const INVISIBLE: &[&str] = &["script", "style", "noscript", "template", "head"];

fn visible_text(root: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(|a| a.value().as_element())
            .any(|e| INVISIBLE.contains(&e.name()));
        if !hidden {
            raw.push_str(text);
            raw.push(' ');
        }
    }
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_dimension(value: Option<&str>) -> Option<u32> {
    let value = value?.trim().trim_end_matches("px");
    value.parse::<u32>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u32)
    })
}

/// A loaded document: the markup plus the URL it was served from. DOM queries
/// parse on demand because `scraper::Html` cannot cross await points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlDocument {
    url: String,
    html: String,
}

impl HtmlDocument {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    fn parse(&self) -> Html {
        Html::parse_document(&self.html)
    }

    pub fn title(&self) -> Result<String, RenderError> {
        Ok(select_first_text(&self.parse(), "title")?.unwrap_or_default())
    }

    pub fn meta_description(&self) -> Result<Option<String>, RenderError> {
        let document = self.parse();
        match select_first_attr(&document, r#"meta[name="description"]"#, "content")? {
            Some(description) => Ok(Some(description)),
            None => select_first_attr(&document, r#"meta[property="og:description"]"#, "content"),
        }
    }

    pub fn canonical_url(&self) -> Result<Option<String>, RenderError> {
        select_first_attr(&self.parse(), r#"link[rel="canonical"]"#, "href")
    }

    pub fn inner_text(&self) -> Result<String, RenderError> {
        let document = self.parse();
        let body = parse_selector("body")?;
        let root = document.select(&body).next().unwrap_or_else(|| document.root_element());
        Ok(visible_text(root))
    }

    pub fn images(&self) -> Result<Vec<ImageInfo>, RenderError> {
        let document = self.parse();
        let sel = parse_selector("img")?;
        let base = Url::parse(&self.url).ok();
        Ok(document
            .select(&sel)
            .map(|img| {
                let el = img.value();
                let raw_src = el.attr("src").unwrap_or_default().trim();
                let src = match (&base, raw_src.is_empty()) {
                    (Some(base), false) => base
                        .join(raw_src)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| raw_src.to_string()),
                    _ => raw_src.to_string(),
                };
                ImageInfo {
                    src,
                    alt: el.attr("alt").map(str::to_string),
                    width: parse_dimension(el.attr("width")),
                    height: parse_dimension(el.attr("height")),
                }
            })
            .collect())
    }

    pub fn anchors(&self) -> Result<Vec<AnchorInfo>, RenderError> {
        let document = self.parse();
        let sel = parse_selector("a")?;
        Ok(document
            .select(&sel)
            .map(|a| AnchorInfo {
                text: a.text().collect::<Vec<_>>().join(" ").trim().to_string(),
                aria_label: a.value().attr("aria-label").map(str::to_string),
            })
            .collect())
    }

    pub fn count(&self, selector: &str) -> Result<usize, RenderError> {
        let sel = parse_selector(selector)?;
        Ok(self.parse().select(&sel).count())
    }
}

/// Session state shared by renderers that serve a static document.
#[derive(Debug, Default)]
pub struct DocumentSlot {
    document: Option<HtmlDocument>,
}

impl DocumentSlot {
    pub fn load(&mut self, document: HtmlDocument) {
        self.document = Some(document);
    }

    pub fn clear(&mut self) {
        self.document = None;
    }

    pub fn get(&self) -> Result<&HtmlDocument, RenderError> {
        self.document.as_ref().ok_or(RenderError::NoDocument)
    }
}

/// Renderer that fetches pages over HTTP without executing scripts. Image
/// sizes come from `width`/`height` attributes and screenshots are unsupported.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    fetcher: Arc<HttpFetcher>,
}

impl HttpRenderer {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        Ok(Self::with_fetcher(Arc::new(HttpFetcher::new(config)?)))
    }

    pub fn with_fetcher(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Browser>, RenderError> {
        debug!(headless = options.headless, "launching static browser");
        Ok(Arc::new(StaticBrowser {
            fetcher: self.fetcher.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct StaticBrowser {
    fetcher: Arc<HttpFetcher>,
    closed: AtomicBool,
}

#[async_trait]
impl Browser for StaticBrowser {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RenderError::Launch("browser already closed".to_string()));
        }
        Ok(Box::new(StaticSession {
            fetcher: self.fetcher.clone(),
            slot: DocumentSlot::default(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct StaticSession {
    fetcher: Arc<HttpFetcher>,
    slot: DocumentSlot,
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn navigate(
        &mut self,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<Option<NavigationResponse>, RenderError> {
        self.slot.clear();
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let resp = self
            .fetcher
            .fetch(&host, url, Some(options.timeout))
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    RenderError::Timeout {
                        url: url.to_string(),
                        timeout_ms: options.timeout.as_millis() as u64,
                    }
                } else {
                    RenderError::Navigation {
                        url: url.to_string(),
                        message: err.to_string(),
                    }
                }
            })?;

        self.slot.load(HtmlDocument::new(resp.final_url.clone(), resp.text()));
        Ok(Some(NavigationResponse {
            status: resp.status.as_u16(),
            content_type: resp.content_type,
            final_url: resp.final_url,
        }))
    }

    async fn title(&self) -> Result<String, RenderError> {
        self.slot.get()?.title()
    }

    async fn content(&self) -> Result<String, RenderError> {
        Ok(self.slot.get()?.html().to_string())
    }

    async fn meta_description(&self) -> Result<Option<String>, RenderError> {
        self.slot.get()?.meta_description()
    }

    async fn canonical_url(&self) -> Result<Option<String>, RenderError> {
        self.slot.get()?.canonical_url()
    }

    async fn inner_text(&self) -> Result<String, RenderError> {
        self.slot.get()?.inner_text()
    }

    async fn images(&self) -> Result<Vec<ImageInfo>, RenderError> {
        self.slot.get()?.images()
    }

    async fn anchors(&self) -> Result<Vec<AnchorInfo>, RenderError> {
        self.slot.get()?.anchors()
    }

    async fn count(&self, selector: &str) -> Result<usize, RenderError> {
        self.slot.get()?.count(selector)
    }

    async fn close(&mut self) {
        self.slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlq_storage::BackoffPolicy;

    const PAGE: &str = r#"<!doctype html>
<html>
  <head>
    <title>  Example Domain </title>
    <meta property="og:description" content="Fallback description">
    <link rel="canonical" href="https://example.com/">
    <style>body { color: red }</style>
  </head>
  <body>
    <h1>Example</h1>
    <p>This domain is for use in <b>illustrative</b> examples.</p>
    <script>var hidden = "not text";</script>
    <img src="/hero.webp" alt="Hero" width="1920" height="1080">
    <img src="https://cdn.example.com/icon.PNG" alt="  ">
    <img src="pixel.gif" width="1px">
    <a href="/more">More information...</a>
    <a href="/x" aria-label="Close"></a>
    <a href="/y"> </a>
  </body>
</html>"#;

    fn doc() -> HtmlDocument {
        HtmlDocument::new("https://example.com/docs/index.html", PAGE)
    }

    #[test]
    fn seo_queries_follow_fallbacks() {
        let doc = doc();
        assert_eq!(doc.title().unwrap(), "Example Domain");
        assert_eq!(doc.meta_description().unwrap().as_deref(), Some("Fallback description"));
        assert_eq!(doc.canonical_url().unwrap().as_deref(), Some("https://example.com/"));

        let bare = HtmlDocument::new("https://example.com/", "<p>no head</p>");
        assert_eq!(bare.title().unwrap(), "");
        assert_eq!(bare.meta_description().unwrap(), None);
    }

    #[test]
    fn inner_text_skips_scripts_and_styles() {
        let text = doc().inner_text().unwrap();
        assert!(text.starts_with("Example This domain is for use in illustrative examples."));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn images_resolve_sources_and_read_dimensions() {
        let images = doc().images().unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].src, "https://example.com/hero.webp");
        assert_eq!((images[0].width, images[0].height), (Some(1920), Some(1080)));
        assert_eq!(images[1].alt.as_deref(), Some("  "));
        assert_eq!(images[2].src, "https://example.com/docs/pixel.gif");
        assert_eq!(images[2].alt, None);
        assert_eq!(images[2].width, Some(1));
    }

    #[test]
    fn anchors_and_counts() {
        let doc = doc();
        let anchors = doc.anchors().unwrap();
        assert_eq!(anchors.len(), 3);
        assert_eq!(anchors[0].text, "More information...");
        assert_eq!(anchors[1].aria_label.as_deref(), Some("Close"));
        assert_eq!(anchors[2].text, "");
        assert_eq!(doc.count("h1").unwrap(), 1);
        assert!(matches!(doc.count("h1[").unwrap_err(), RenderError::Evaluation(_)));
    }

    #[tokio::test]
    async fn queries_before_navigation_report_no_document() {
        let renderer = HttpRenderer::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })
        .unwrap();
        let browser = renderer.launch(&LaunchOptions::default()).await.unwrap();
        let mut session = browser.new_session().await.unwrap();
        assert!(matches!(session.title().await.unwrap_err(), RenderError::NoDocument));
        assert!(matches!(
            session.screenshot().await.unwrap_err(),
            RenderError::Unsupported("screenshot")
        ));
        session.close().await;
        browser.close().await;
        assert!(browser.new_session().await.is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_a_navigation_error() {
        let renderer = HttpRenderer::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            timeout: Duration::from_secs(5),
            ..HttpClientConfig::default()
        })
        .unwrap();
        let browser = renderer.launch(&LaunchOptions::default()).await.unwrap();
        let mut session = browser.new_session().await.unwrap();
        let err = session
            .navigate("http://127.0.0.1:9/", &NavigateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Navigation { .. }));
    }
}
