use std::num::NonZeroUsize;
use std::time::Duration;

use existence_cache::probe::ProbeError;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::{MockProbe, mock_cache, mock_cache_with_config, test};

#[tokio::test(start_paused = true)]
async fn test_fresh_answers_skip_the_origin() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [200]);
    let cache = mock_cache(&probe);

    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 1);

    time::advance(Duration::from_secs(4 * 60 + 59)).await;
    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 1);

    // five minutes after the probe, the answer is stale
    time::advance(Duration::from_secs(1)).await;
    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_checks_share_one_probe() {
    test::setup();
    let probe = MockProbe::new().with_delay(Duration::from_millis(100));
    probe.respond("ETH", [200]);
    let cache = mock_cache(&probe);

    let (a, b, c) = futures::join!(
        cache.check_exists("ETH", None),
        cache.check_exists("ETH", None),
        cache.check_exists("ETH", None),
    );

    assert!(a && b && c);
    assert_eq!(probe.calls("ETH"), 1);
    assert_eq!(cache.running_probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_identifiers_are_isolated() {
    test::setup();
    let probe = MockProbe::new().with_delay(Duration::from_millis(100));
    probe.respond("ETH", [200]);
    probe.respond("BTC", [404]);
    let cache = mock_cache(&probe);

    let (eth, btc) = futures::join!(
        cache.check_exists("ETH", None),
        cache.check_exists("BTC", None),
    );

    assert!(eth);
    assert!(!btc);
    assert_eq!(probe.calls("ETH"), 1);
    assert_eq!(probe.calls("BTC"), 1);
    assert_eq!(probe.total_calls(), 2);
    assert_eq!(cache.cached("ETH"), Some(true));
    assert_eq!(cache.cached("BTC"), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_missing_answers_are_cached() {
    test::setup();
    let probe = MockProbe::new();
    let cache = mock_cache(&probe);

    assert!(!cache.check_exists("UNKNOWN", None).await);
    assert!(!cache.check_exists("UNKNOWN", None).await);

    assert_eq!(probe.calls("UNKNOWN"), 1);
    assert_eq!(cache.cached("UNKNOWN"), Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_retrying() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [500]);
    let cache = mock_cache_with_config(&probe, {
        let mut config = test::test_config();
        config.retry.max_attempts = None;
        config
    });

    let cancel = CancellationToken::new();
    let start = Instant::now();
    let (exists, ()) = tokio::join!(cache.check_exists("ETH", Some(&cancel)), async {
        time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
    });

    assert!(!exists);
    assert_eq!(start.elapsed(), Duration::from_millis(2500));
    // attempts at 0s, 1s and 2s
    assert_eq!(probe.calls("ETH"), 3);
    assert_eq!(cache.cached("ETH"), None);
    assert_eq!(cache.running_probes(), 0);

    // the next caller starts afresh
    probe.respond("ETH", [200]);
    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_cancel_does_not_wait_for_backoff() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [500]);
    let cache = mock_cache(&probe);

    let cancel = CancellationToken::new();
    let start = Instant::now();
    let (exists, ()) = tokio::join!(cache.check_exists("ETH", Some(&cancel)), async {
        cancel.cancel();
    });

    assert!(!exists);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(cache.cached("ETH"), None);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_all() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [200]);
    let cache = mock_cache(&probe);

    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(cache.build_display_url("ETH"), "/icons/ETH?timestamp=0");

    cache.invalidate_all();
    assert_eq!(cache.cache_marker(), 1);
    assert_eq!(cache.build_display_url("ETH"), "/icons/ETH?timestamp=1");

    assert!(cache.check_exists("ETH", None).await);
    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 2);

    // checks never move the marker
    assert_eq!(cache.cache_marker(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_all_during_running_check() {
    test::setup();
    let probe = MockProbe::new().with_delay(Duration::from_millis(100));
    probe.respond("ETH", [200]);
    let cache = mock_cache(&probe);

    let (exists, ()) = tokio::join!(cache.check_exists("ETH", None), async {
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.running_probes(), 1);
        cache.invalidate_all();
    });

    assert!(exists);
    // the running check refills the emptied store
    assert_eq!(cache.cached("ETH"), Some(true));
    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 1);
    assert_eq!(cache.running_probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_still_gets_fresh_answer() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [200]);
    let cache = mock_cache(&probe);
    assert!(cache.check_exists("ETH", None).await);

    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(cache.check_exists("ETH", Some(&cancel)).await);
    assert_eq!(probe.calls("ETH"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_are_not_cached() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond_with(
        "ETH",
        [Err(ProbeError::Transport("connection refused".into()))],
    );
    let cache = mock_cache(&probe);

    assert!(!cache.check_exists("ETH", None).await);
    assert_eq!(cache.cached("ETH"), None);

    assert!(!cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [202]);
    let mut config = test::test_config();
    config.retry.max_attempts = NonZeroUsize::new(4);
    let cache = mock_cache_with_config(&probe, config);

    let start = Instant::now();
    assert!(!cache.check_exists("ETH", None).await);

    assert_eq!(probe.calls("ETH"), 4);
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(cache.cached("ETH"), None);
}

#[tokio::test(start_paused = true)]
async fn test_probe_survives_cancelling_starter() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond("ETH", [202, 202, 200]);
    let cache = mock_cache(&probe);

    let cancel = CancellationToken::new();
    let (starter, joiner, ()) = tokio::join!(
        cache.check_exists("ETH", Some(&cancel)),
        async {
            time::sleep(Duration::from_millis(10)).await;
            cache.check_exists("ETH", None).await
        },
        async {
            time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        },
    );

    assert!(!starter);
    assert!(joiner);
    assert_eq!(probe.calls("ETH"), 3);
    assert_eq!(cache.cached("ETH"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_retried() {
    test::setup();
    let probe = MockProbe::new();
    probe.respond_with(
        "ETH",
        [
            Err(ProbeError::Timeout),
            Err(ProbeError::Timeout),
            Ok(reqwest::StatusCode::NO_CONTENT),
        ],
    );
    let cache = mock_cache(&probe);

    assert!(cache.check_exists("ETH", None).await);
    assert_eq!(probe.calls("ETH"), 3);
    assert_eq!(cache.cached("ETH"), Some(true));
}
