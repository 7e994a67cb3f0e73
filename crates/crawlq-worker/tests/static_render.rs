use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crawlq_render::HttpRenderer;
use crawlq_storage::{HttpFetcher, InMemoryStore, JobStore, PageStore};
use crawlq_worker::{LeaseManager, ResultWriter, WorkerConfig, WorkerPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers every GET with a small page named after its path, after `delay`.
async fn slow_site(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                tokio::time::sleep(delay).await;
                let body = format!("<html><head><title>{path}</title></head><body><p>slow page</p></body></html>");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn wide_batches_on_one_site_are_not_throttled_into_timeouts() {
    let addr = slow_site(Duration::from_millis(500)).await;
    let site = addr.ip().to_string();
    let urls: Vec<String> = (0..8).map(|i| format!("http://{addr}/p{i}")).collect();

    let store = Arc::new(InMemoryStore::new());
    store.seed(&site, &urls, Utc::now()).await.unwrap();

    let config = WorkerConfig {
        concurrency: 8,
        navigation_timeout: Duration::from_millis(800),
        ..WorkerConfig::default()
    };
    let fetcher = Arc::new(HttpFetcher::new(config.http_client()).expect("http client"));
    let pool = WorkerPool::new(
        LeaseManager::new(store.clone(), config.lease),
        ResultWriter::new(store.clone(), store.clone()),
        Arc::new(HttpRenderer::with_fetcher(fetcher)),
        config.pool_config(),
    );

    let report = pool.run_batch(config.concurrency, Some(&site)).await.unwrap();
    assert_eq!(report.claimed, 8);
    assert_eq!(report.timed_out, 0, "{report:?}");
    assert_eq!(report.done, 8);

    let page = store.get_page(&site, &urls[7]).await.unwrap().expect("page stored");
    assert_eq!(page.status_code, Some(200));
    assert_eq!(page.title.as_deref(), Some("/p7"));
}
