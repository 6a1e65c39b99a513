use std::sync::Arc;
use std::time::Duration;

use existence_cache::ExistenceCache;
use existence_cache::config::Config;
use reqwest::Url;

use crate::test::{self, OriginServer};

fn origin_cache(origin: Url) -> Arc<ExistenceCache> {
    let mut config: Config = test::test_config();
    config.origin.url = origin;
    config.retry.backoff = Duration::from_millis(10);
    ExistenceCache::from_config(&config).unwrap()
}

#[tokio::test]
async fn test_found() {
    test::setup();
    let server = OriginServer::new();
    server.respond("ETH", [200]);
    let cache = origin_cache(server.url());

    assert!(cache.check_exists("ETH", None).await);
    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(server.hits("ETH"), 1);
}

#[tokio::test]
async fn test_not_found() {
    test::setup();
    let server = OriginServer::new();
    let cache = origin_cache(server.url());

    assert!(!cache.check_exists("UNKNOWN", None).await);
    assert_eq!(cache.cached("UNKNOWN"), Some(false));
    assert_eq!(server.hits("UNKNOWN"), 1);
}

#[tokio::test]
async fn test_accepted_is_retried() {
    test::setup();
    let server = OriginServer::new();
    server.respond("eip155:1/erc20:0xABC", [202, 202, 200]);
    let cache = origin_cache(server.url());

    assert!(cache.check_exists("eip155:1/erc20:0xABC", None).await);
    assert_eq!(server.hits("eip155:1/erc20:0xABC"), 3);
}

#[tokio::test]
async fn test_unreachable_origin() {
    test::setup();
    let cache = origin_cache(test::unreachable_origin());

    assert!(!cache.check_exists("ETH", None).await);
    assert_eq!(cache.cached("ETH"), None);
    assert_eq!(cache.running_probes(), 0);
}

#[tokio::test]
async fn test_display_url() {
    test::setup();
    let server = OriginServer::new();
    let cache = origin_cache(server.url());

    let expected = format!("{}assets/icon?asset_id=ETH&timestamp=0", server.url());
    assert_eq!(cache.build_display_url("ETH"), expected);

    cache.invalidate_all();
    let expected = format!("{}assets/icon?asset_id=ETH&timestamp=1", server.url());
    assert_eq!(cache.build_display_url("ETH"), expected);
}
