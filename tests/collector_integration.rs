//! Integration tests for paginated collection against a mocked markets API.

use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use marketcap_core::{
    AbortReason, CheckpointManager, ClientConfig, CollectError, Collector, CollectorConfig,
    MarketsClient, RateLimitConfig, RateLimiter, RawSnapshot, RetryPolicy,
};

const PER_PAGE: u32 = 10;

fn coins(ids: RangeInclusive<u32>) -> Value {
    Value::Array(
        ids.map(|i| {
            json!({
                "id": format!("coin-{i}"),
                "symbol": format!("c{i}"),
                "name": format!("Coin {i}"),
                "market_cap_rank": i,
                "market_cap": 1.0e9 / f64::from(i),
                "current_price": 1.5,
                "total_volume": 2.0e6,
                "price_change_percentage_24h": -0.5
            })
        })
        .collect(),
    )
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, 23).unwrap()
}

fn collector(server: &MockServer, dir: &TempDir) -> Collector {
    let client = MarketsClient::new(ClientConfig {
        base_url: server.uri(),
        api_key: Some("test-key".to_string()),
        per_page: PER_PAGE,
        timeout: Duration::from_secs(5),
    })
    .unwrap();

    let mut config = CollectorConfig::new(dir.path().join("raw"), true);
    config.page_delay = Duration::ZERO;
    config.rate_limit_cooldown = Duration::from_millis(10);

    Collector::new(
        Box::new(client),
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        config,
    )
    .with_retry_policy(
        RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20), 2.0)
            .without_jitter(),
    )
    .with_checkpoints(CheckpointManager::new(dir.path().join("checkpoints")))
}

async fn mount_page(server: &MockServer, page: u32, body: Value) {
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn raw_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| entries.count())
}

#[tokio::test]
async fn test_overlapping_pages_are_deduplicated() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_page(&server, 1, coins(1..=10)).await;
    // Ranks shifted between requests: page 2 repeats five ids from page 1.
    mount_page(&server, 2, coins(6..=15)).await;
    mount_page(&server, 3, json!([])).await;

    let path = collector(&server, &dir).collect(date()).await.unwrap();
    let snapshot = RawSnapshot::load(&path).unwrap();

    assert_eq!(snapshot.coins.len(), 20 - 5);
    assert_eq!(snapshot.metadata.total_coins, 15);
    assert_eq!(snapshot.metadata.duplicates_skipped, 5);
    assert_eq!(snapshot.metadata.pages_fetched, 3);
    assert_eq!(snapshot.metadata.collection_date, "2025-11-23");

    let mut ids: Vec<&str> = snapshot
        .coins
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids[0], "coin-1", "first-seen order is preserved");
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 15);

    // Successful runs leave no checkpoint behind.
    let manager = CheckpointManager::new(dir.path().join("checkpoints"));
    assert!(manager.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_request_carries_expected_query() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("vs_currency", "usd"))
        .and(query_param("order", "market_cap_desc"))
        .and(query_param("per_page", PER_PAGE.to_string()))
        .and(query_param("page", "1"))
        .and(query_param("sparkline", "false"))
        .and(query_param("price_change_percentage", "24h"))
        .and(query_param("x_cg_demo_api_key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coins(1..=3)))
        .expect(1)
        .mount(&server)
        .await;

    let path = collector(&server, &dir).collect(date()).await.unwrap();

    let snapshot = RawSnapshot::load(&path).unwrap();
    assert_eq!(snapshot.coins.len(), 3, "short page ends the run");
    assert_eq!(snapshot.metadata.api_calls, 1);
}

#[tokio::test]
async fn test_tier_limit_is_hard_stop() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_page(&server, 1, coins(1..=10)).await;
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(402))
        .expect(1)
        .mount(&server)
        .await;

    let err = collector(&server, &dir).collect(date()).await.unwrap_err();

    let CollectError::Aborted {
        page,
        reason,
        partial,
    } = err
    else {
        panic!("expected aborted collection");
    };
    assert_eq!(page, 2);
    assert!(matches!(reason, AbortReason::TierLimit { status: 402 }));
    assert_eq!(partial.records.len(), 10);
    assert!(partial.checkpoint.as_ref().is_some_and(|p| p.exists()));
    assert_eq!(raw_files(&dir.path().join("raw")), 0);
}

#[tokio::test]
async fn test_upstream_rate_limit_cools_down_then_succeeds() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_page(&server, 1, coins(1..=4)).await;

    let path = collector(&server, &dir).collect(date()).await.unwrap();

    let snapshot = RawSnapshot::load(&path).unwrap();
    assert_eq!(snapshot.coins.len(), 4);
    assert_eq!(snapshot.metadata.api_calls, 2);
    assert_eq!(snapshot.metadata.failed_requests, 0);
}

#[tokio::test]
async fn test_exhausted_retries_keep_partial_results() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_page(&server, 1, coins(1..=10)).await;
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = collector(&server, &dir).collect(date()).await.unwrap_err();

    assert!(matches!(
        err.reason(),
        Some(AbortReason::RetriesExhausted { attempts: 3, .. })
    ));
    let partial = err.partial().unwrap();
    assert_eq!(partial.records.len(), 10);
    assert_eq!(partial.metrics.failed_requests, 3);
    assert_eq!(partial.metrics.api_calls, 4);
}

#[tokio::test]
async fn test_resume_continues_after_last_checkpointed_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_page(&server, 1, coins(1..=10)).await;
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    assert!(collector(&server, &dir).collect(date()).await.is_err());

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coins(1..=10)))
        .expect(0)
        .mount(&server)
        .await;
    mount_page(&server, 2, coins(11..=14)).await;

    let path = collector(&server, &dir).collect(date()).await.unwrap();

    let snapshot = RawSnapshot::load(&path).unwrap();
    assert_eq!(snapshot.coins.len(), 14);
    assert_eq!(snapshot.coins[0]["id"], "coin-1");
    assert_eq!(snapshot.coins[13]["id"], "coin-14");
}

#[tokio::test]
async fn test_no_resume_starts_from_first_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    CheckpointManager::new(dir.path().join("checkpoints"))
        .save(&marketcap_core::Checkpoint::new("2025-11-23", 4, 0, 4))
        .unwrap();
    Mock::given(method("GET"))
        .and(path("/coins/markets"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coins(1..=2)))
        .expect(1)
        .mount(&server)
        .await;

    let client = MarketsClient::new(ClientConfig {
        base_url: server.uri(),
        per_page: PER_PAGE,
        ..ClientConfig::default()
    })
    .unwrap();
    let mut config = CollectorConfig::new(dir.path().join("raw"), false);
    config.resume = false;
    let path = Collector::new(
        Box::new(client),
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        config,
    )
    .with_checkpoints(CheckpointManager::new(dir.path().join("checkpoints")))
    .collect(date())
    .await
    .unwrap();

    assert_eq!(RawSnapshot::load(&path).unwrap().coins.len(), 2);
}

#[tokio::test]
async fn test_interrupt_stops_before_next_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(coins(1..=10)))
        .expect(0)
        .mount(&server)
        .await;

    let err = collector(&server, &dir)
        .with_interrupt(Arc::new(AtomicBool::new(true)))
        .collect(date())
        .await
        .unwrap_err();

    assert!(matches!(err.reason(), Some(AbortReason::Cancelled)));
}
