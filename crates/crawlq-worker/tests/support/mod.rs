#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crawlq_core::LeasePolicy;
use crawlq_render::{
    AnchorInfo, Browser, BrowserSession, DocumentSlot, HtmlDocument, ImageInfo, LaunchOptions, NavigateOptions,
    NavigationResponse, RenderError, Renderer,
};
use crawlq_storage::{ArtifactStore, InMemoryStore, JobStore};
use crawlq_worker::{ExtractOptions, LeaseManager, PoolConfig, ResultWriter, WorkerPool};
use parking_lot::Mutex;

pub const SITE: &str = "example.com";

pub fn url(path: &str) -> String {
    format!("https://{SITE}{path}")
}

pub fn example_html(title: &str, body: &str) -> String {
    format!("<html><head><title>{title}</title></head><body>{body}</body></html>")
}

/// What a navigation to one URL does.
#[derive(Debug, Clone)]
pub enum Script {
    Page { status: u16, html: String },
    Timeout,
    Fail(String),
    Hang,
    Panic,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub launches: AtomicUsize,
    pub closes: AtomicUsize,
    pub open_sessions: AtomicIsize,
    pub peak_sessions: AtomicIsize,
    pub navigations: Mutex<Vec<String>>,
}

/// Scripted renderer: each URL answers per its [`Script`]; unknown URLs get a
/// small 200 page.
#[derive(Clone, Default)]
pub struct FakeRenderer {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    pub counters: Arc<Counters>,
    fail_launch: bool,
    screenshot: Option<Vec<u8>>,
    navigation_delay: Duration,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, url: &str, script: Script) -> Self {
        self.scripts.lock().insert(url.to_string(), script);
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn with_screenshot(mut self, png: &[u8]) -> Self {
        self.screenshot = Some(png.to_vec());
        self
    }

    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = delay;
        self
    }

    pub fn set(&self, url: &str, script: Script) {
        self.scripts.lock().insert(url.to_string(), script);
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Arc<dyn Browser>, RenderError> {
        if self.fail_launch {
            return Err(RenderError::Launch("chromium not installed".to_string()));
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeBrowser { renderer: self.clone() }))
    }
}

struct FakeBrowser {
    renderer: FakeRenderer,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        let counters = &self.renderer.counters;
        let open = counters.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            renderer: self.renderer.clone(),
            slot: DocumentSlot::default(),
            closed: false,
        }))
    }

    async fn close(&self) {
        self.renderer.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeSession {
    renderer: FakeRenderer,
    slot: DocumentSlot,
    closed: bool,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if !self.closed {
            self.renderer.counters.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(
        &mut self,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<Option<NavigationResponse>, RenderError> {
        self.renderer.counters.navigations.lock().push(url.to_string());
        let script = self
            .renderer
            .scripts
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Script::Page {
                status: 200,
                html: example_html("Example", "<p>default page</p>"),
            });
        if !self.renderer.navigation_delay.is_zero() {
            tokio::time::sleep(self.renderer.navigation_delay).await;
        }
        match script {
            Script::Page { status, html } => {
                self.slot.load(HtmlDocument::new(url, html));
                Ok(Some(NavigationResponse {
                    status,
                    content_type: Some("text/html; charset=utf-8".to_string()),
                    final_url: url.to_string(),
                }))
            }
            Script::Timeout => Err(RenderError::Timeout {
                url: url.to_string(),
                timeout_ms: options.timeout.as_millis() as u64,
            }),
            Script::Fail(message) => Err(RenderError::Navigation {
                url: url.to_string(),
                message,
            }),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
            Script::Panic => panic!("renderer crashed on {url}"),
        }
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

    async fn screenshot(&self) -> Result<Vec<u8>, RenderError> {
        self.slot.get()?;
        self.renderer
            .screenshot
            .clone()
            .ok_or(RenderError::Unsupported("screenshot"))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.renderer.counters.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn policy(max_attempts: u32) -> LeasePolicy {
    LeasePolicy {
        lease_timeout: Duration::from_secs(60),
        max_attempts,
    }
}

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        extract: ExtractOptions {
            navigation_timeout: Duration::from_millis(200),
            ..ExtractOptions::default()
        },
        idle_backoff: Duration::from_millis(10),
        ..PoolConfig::default()
    }
}

pub fn pool_with(
    store: &Arc<InMemoryStore>,
    renderer: &FakeRenderer,
    policy: LeasePolicy,
    config: PoolConfig,
    artifacts: Option<ArtifactStore>,
) -> WorkerPool {
    let mut writer = ResultWriter::new(store.clone(), store.clone());
    if let Some(artifacts) = artifacts {
        writer = writer.with_artifacts(artifacts);
    }
    WorkerPool::new(
        LeaseManager::new(store.clone(), policy),
        writer,
        Arc::new(renderer.clone()),
        config,
    )
}

pub fn pool(store: &Arc<InMemoryStore>, renderer: &FakeRenderer) -> WorkerPool {
    pool_with(store, renderer, policy(3), fast_pool_config(), None)
}

pub async fn seeded(paths: &[&str]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let urls: Vec<String> = paths.iter().map(|p| url(p)).collect();
    store.seed(SITE, &urls, Utc::now()).await.unwrap();
    store
}
