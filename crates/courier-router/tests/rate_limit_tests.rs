//! Pool-level rate limiting: leaky-bucket pacing, saturation fast-fail,
//! and runtime limiter rebuilds.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::PoolConfig;
use courier_router::ProcessPool;

use support::{make_message, CallbackLog, StubMediator, Terminal};

fn limited_pool(concurrency: u32, rate: Option<u32>, mediator: Arc<StubMediator>) -> ProcessPool {
    ProcessPool::new(
        PoolConfig {
            code: "P".to_string(),
            concurrency,
            rate_limit_per_minute: rate,
        },
        mediator,
    )
}

#[tokio::test]
async fn mediations_are_paced_by_the_leaky_bucket() {
    // 1200/min = one admission every 50ms.
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = limited_pool(2, Some(1200), mediator.clone());
    let log = CallbackLog::new();

    let start = Instant::now();
    for i in 0..5 {
        let id = format!("m-{i}");
        assert!(pool.submit(
            make_message(&id, "P", &format!("g-{i}"), "b-1"),
            log.callback(&id)
        ).await);
    }

    log.wait_for(5, Duration::from_secs(5)).await;

    // First token immediate, four more spaced 50ms apart.
    assert!(start.elapsed() >= Duration::from_millis(180));
    assert_eq!(mediator.call_count(), 5);
    assert_eq!(pool.stats().totals.rate_limited, 0);
    assert_eq!(pool.stats().totals.succeeded, 5);
}

#[tokio::test]
async fn burst_is_smoothed_not_rejected_within_capacity() {
    // Admission bounds the waiter queue at max_capacity, so a burst that
    // fits the pool queues instead of tripping the rate-limit fast-fail.
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = limited_pool(1, Some(600), mediator.clone());
    let log = CallbackLog::new();

    for i in 0..10 {
        let id = format!("m-{i}");
        assert!(pool.submit(
            make_message(&id, "P", &format!("g-{i}"), "b-1"),
            log.callback(&id)
        ).await);
    }

    log.wait_for(10, Duration::from_secs(10)).await;
    assert_eq!(pool.stats().totals.rate_limited, 0);
    for i in 0..10 {
        assert_eq!(log.terminal_for(&format!("m-{i}")), Some(Terminal::Ack));
    }
}

#[tokio::test]
async fn removing_the_rate_limit_releases_waiting_messages() {
    // 1/min: after the first token nothing else would be admitted for a
    // minute.
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = limited_pool(2, Some(1), mediator.clone());
    let log = CallbackLog::new();

    for i in 0..4 {
        let id = format!("m-{i}");
        assert!(pool.submit(
            make_message(&id, "P", &format!("g-{i}"), "b-1"),
            log.callback(&id)
        ).await);
    }

    // Only the first message gets through on the initial token.
    log.wait_for(1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mediator.call_count(), 1);

    // Dropping the limit tears down the bucket; waiters re-check and
    // proceed unthrottled.
    pool.update_config(&PoolConfig {
        code: "P".to_string(),
        concurrency: 2,
        rate_limit_per_minute: None,
    });

    log.wait_for(4, Duration::from_secs(2)).await;
    assert_eq!(mediator.call_count(), 4);
    assert_eq!(pool.rate_limit_per_minute(), None);
}

#[tokio::test]
async fn tightening_the_rate_limit_rebuilds_the_bucket() {
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = limited_pool(2, None, mediator.clone());
    let log = CallbackLog::new();

    pool.update_config(&PoolConfig {
        code: "P".to_string(),
        concurrency: 2,
        rate_limit_per_minute: Some(1200),
    });
    assert_eq!(pool.rate_limit_per_minute(), Some(1200));

    let start = Instant::now();
    for i in 0..4 {
        let id = format!("m-{i}");
        assert!(pool.submit(
            make_message(&id, "P", &format!("g-{i}"), "b-1"),
            log.callback(&id)
        ).await);
    }

    log.wait_for(4, Duration::from_secs(5)).await;
    // Three paced intervals after the immediate first token.
    assert!(start.elapsed() >= Duration::from_millis(130));
}
