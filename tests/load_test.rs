//! Load testing for the edge proxy and its response cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use edge_proxy::cache::{Cache, MemoryCache};

mod common;

use common::{proxy_config, start_backend, start_proxy, MockResponse};

#[tokio::test]
async fn test_load_with_cache() {
    // 1. Setup mock backend with a few distinct cacheable pages
    let backend = start_backend(|request| {
        MockResponse::ok(format!("page {}", request.target))
            .header("cache-control", "public, max-age=60")
    })
    .await;

    // 2. Start proxy with a small cache so eviction runs under load
    let cache = Arc::new(MemoryCache::new(16 * 1024, 1024));
    let proxy = start_proxy(
        proxy_config(&backend.url),
        Some(cache.clone() as Arc<dyn Cache>),
    )
    .await;

    // 3. Run load test
    let concurrency = 20;
    let requests_per_task = 25;
    let pages = 10;
    let total_requests = concurrency * requests_per_task;

    let client = common::client();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for task_id in 0..concurrency {
        let client = client.clone();
        let base = proxy.url("");
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for i in 0..requests_per_task {
                let page = (task_id + i) % pages;
                let req_start = Instant::now();
                let res = client
                    .get(format!("{base}/page/{page}"))
                    .send()
                    .await
                    .expect("request through proxy failed");
                assert_eq!(res.status(), 200);
                assert_eq!(res.text().await.unwrap(), format!("page /page/{page}"));
                latencies.push(req_start.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies: Vec<Duration> = Vec::new();
    for task in tasks {
        all_latencies.extend(task.await.unwrap());
    }

    let duration = start.elapsed();
    assert_eq!(all_latencies.len(), total_requests);

    // Concurrent misses may each reach the upstream, but most requests must be hits.
    assert!(backend.calls() < total_requests / 2, "calls = {}", backend.calls());
    assert!(cache.size() <= 16 * 1024);
    assert!(!cache.is_empty());

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests:   {}", total_requests);
    println!("Concurrency:      {}", concurrency);
    println!("Total Duration:   {:?}", duration);
    println!("Requests/sec:     {:.2}", total_requests as f64 / duration.as_secs_f64());
    println!("Upstream calls:   {}", backend.calls());
    println!("P50 Latency:      {:?}", p50);
    println!("P99 Latency:      {:?}", p99);
    println!("-------------------------\n");
}
