mod support;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crawlq_storage::{InMemoryStore, JobStore};
use crawlq_worker::{DocumentSource, SitemapCollector, SitemapError};
use parking_lot::Mutex;
use support::url;

#[derive(Default)]
struct FakeSource {
    documents: HashMap<String, String>,
    fetched: Mutex<Vec<String>>,
}

impl FakeSource {
    fn with(mut self, path: &str, body: &str) -> Self {
        self.documents.insert(url(path), body.to_string());
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl DocumentSource for FakeSource {
    async fn fetch_text(&self, _site_id: &str, url: &str) -> Option<String> {
        self.fetched.lock().push(url.to_string());
        self.documents.get(url).cloned()
    }
}

fn urlset(paths: &[&str]) -> String {
    let entries: String = paths
        .iter()
        .map(|p| format!("<url><loc>{}</loc></url>", url(p)))
        .collect();
    format!(r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#)
}

fn index(paths: &[&str]) -> String {
    let entries: String = paths
        .iter()
        .map(|p| format!("<sitemap><loc>{}</loc></sitemap>", url(p)))
        .collect();
    format!(r#"<?xml version="1.0"?><sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</sitemapindex>"#)
}

fn nested_site() -> FakeSource {
    FakeSource::default()
        .with("/robots.txt", "User-agent: *\nDisallow:\nSitemap: /index.xml\n")
        .with("/index.xml", &index(&["/s1.xml", "/nested.xml"]))
        .with("/sitemap.xml", &urlset(&["/a", "/b"]))
        .with("/s1.xml", &urlset(&["/b", "/c"]))
        .with("/nested.xml", &index(&["/deep.xml", "/deeper-index.xml"]))
        .with("/deep.xml", &urlset(&["/d"]))
        .with("/deeper-index.xml", &index(&["/too-deep.xml"]))
        .with("/too-deep.xml", &urlset(&["/z"]))
}

#[tokio::test]
async fn robots_and_fallback_sitemaps_are_discovered() {
    let source = Arc::new(nested_site());
    let collector = SitemapCollector::new(source.clone());
    let found = collector.discover_sitemaps("https://Example.com/some/page").await.unwrap();
    assert_eq!(found, [url("/index.xml"), url("/sitemap.xml")]);

    let bare = Arc::new(FakeSource::default().with("/sitemap.xml", &urlset(&["/a"])));
    let found = SitemapCollector::new(bare).discover_sitemaps("https://example.com").await.unwrap();
    assert_eq!(found, [url("/sitemap.xml")]);
}

#[tokio::test]
async fn nested_indexes_stop_at_max_depth() {
    let source = Arc::new(nested_site());
    let collector = SitemapCollector::new(source.clone());

    let urls = collector.collect_urls("https://example.com").await.unwrap();
    assert_eq!(urls, [url("/a"), url("/b"), url("/c"), url("/d")]);
    assert!(!source.fetched().contains(&url("/too-deep.xml")));

    let shallow = SitemapCollector::new(Arc::new(nested_site())).with_max_depth(0);
    let urls = shallow.collect_urls("https://example.com").await.unwrap();
    assert_eq!(urls, [url("/a"), url("/b")]);
}

#[tokio::test]
async fn ingest_seeds_pending_jobs_once() {
    let store = InMemoryStore::new();
    let collector = SitemapCollector::new(Arc::new(nested_site()));

    let first = collector.ingest(&store, "https://example.com/").await.unwrap();
    assert_eq!(first.site_id, "example.com");
    assert_eq!(first.discovered, 4);
    assert_eq!(first.upserted, 4);
    assert_eq!(first.pending_total, 4);

    let again = collector.ingest(&store, "https://example.com/").await.unwrap();
    assert_eq!(again.discovered, 4);
    assert_eq!(again.upserted, 0);
    assert_eq!(again.pending_total, 4);

    let order: Vec<String> = store
        .list_jobs("example.com", None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.url)
        .collect();
    assert_eq!(order, [url("/a"), url("/b"), url("/c"), url("/d")]);
}

#[tokio::test]
async fn site_without_sitemaps_seeds_nothing() {
    let store = InMemoryStore::new();
    let collector = SitemapCollector::new(Arc::new(FakeSource::default()));
    let report = collector.ingest(&store, "https://example.com").await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.pending_total, 0);
}

#[tokio::test]
async fn invalid_site_url_is_rejected() {
    let collector = SitemapCollector::new(Arc::new(FakeSource::default()));
    let err = collector.collect_urls("not a url").await.unwrap_err();
    assert!(matches!(err, SitemapError::InvalidSite(_)));
}

#[tokio::test]
async fn relative_child_sitemaps_resolve_against_their_parent() {
    let source = Arc::new(
        FakeSource::default()
            .with(
                "/sitemap.xml",
                "<sitemapindex><sitemap><loc>/child.xml</loc></sitemap>\
                 <sitemap><loc>maps/nested.xml</loc></sitemap></sitemapindex>",
            )
            .with("/child.xml", &urlset(&["/page"]))
            .with("/maps/nested.xml", &index(&["/leaf.xml"]))
            .with("/leaf.xml", &urlset(&["/leaf"])),
    );
    let urls = SitemapCollector::new(source.clone())
        .collect_urls("https://example.com")
        .await
        .unwrap();

    assert_eq!(urls, [url("/page"), url("/leaf")]);
    let fetched = source.fetched();
    assert!(fetched.contains(&url("/child.xml")));
    assert!(fetched.contains(&url("/maps/nested.xml")));
    assert!(!fetched.iter().any(|u| u == "/child.xml"));
}
