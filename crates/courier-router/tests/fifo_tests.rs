//! Ordering behavior of the process pool:
//! - serial FIFO within a message group
//! - parallelism across groups
//! - high-priority messages ahead of regular ones
//! - idle group workers retire and come back on demand

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::PoolConfig;
use courier_router::ProcessPool;

use support::{make_high_priority_message, make_message, CallbackLog, StubMediator, Terminal};

fn pool_config(code: &str, concurrency: u32) -> PoolConfig {
    PoolConfig {
        code: code.to_string(),
        concurrency,
        rate_limit_per_minute: None,
    }
}

#[tokio::test]
async fn same_group_messages_complete_in_submission_order() {
    let mediator = Arc::new(StubMediator::success(Duration::from_millis(20)));
    let pool = ProcessPool::new(pool_config("P", 5), mediator.clone());
    let log = CallbackLog::new();

    for i in 0..10 {
        let id = format!("m-{i}");
        let message = make_message(&id, "P", "group-a", "batch-1");
        assert!(pool.submit(message, log.callback(&id)).await);
    }

    log.wait_for(10, Duration::from_secs(5)).await;

    let calls = mediator.calls();
    assert_eq!(calls.len(), 10);
    for (i, id) in calls.iter().enumerate() {
        assert_eq!(id, &format!("m-{i}"), "order mismatch at {i}");
    }
    // One group: never more than one mediation in flight.
    assert_eq!(mediator.peak_in_flight(), 1);
}

#[tokio::test]
async fn distinct_groups_interleave_up_to_concurrency() {
    let mediator = Arc::new(StubMediator::success(Duration::from_millis(50)));
    let pool = ProcessPool::new(pool_config("P", 10), mediator.clone());
    let log = CallbackLog::new();

    let start = Instant::now();
    for i in 0..5 {
        let id = format!("m-{i}");
        let message = make_message(&id, "P", &format!("group-{i}"), "batch-1");
        assert!(pool.submit(message, log.callback(&id)).await);
    }

    log.wait_for(5, Duration::from_secs(5)).await;

    // Five 50ms mediations across five groups run in parallel; serial
    // execution would need 250ms.
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(mediator.peak_in_flight() > 1);
}

#[tokio::test]
async fn concurrency_caps_parallel_mediations() {
    let mediator = Arc::new(StubMediator::success(Duration::from_millis(30)));
    let pool = ProcessPool::new(pool_config("P", 2), mediator.clone());
    let log = CallbackLog::new();

    for i in 0..8 {
        let id = format!("m-{i}");
        let message = make_message(&id, "P", &format!("group-{i}"), "batch-1");
        assert!(pool.submit(message, log.callback(&id)).await);
    }

    log.wait_for(8, Duration::from_secs(5)).await;
    assert!(mediator.peak_in_flight() <= 2);
}

#[tokio::test]
async fn high_priority_drains_before_regular() {
    let mediator = Arc::new(StubMediator::success(Duration::from_millis(30)));
    let pool = ProcessPool::new(pool_config("P", 1), mediator.clone());
    let log = CallbackLog::new();

    // Head message occupies the worker while the rest queue up behind it.
    assert!(pool.submit(
        make_message("head", "P", "group-a", "batch-1"),
        log.callback("head")
    ).await);
    for i in 0..3 {
        let id = format!("regular-{i}");
        assert!(pool.submit(
            make_message(&id, "P", "group-a", "batch-1"),
            log.callback(&id)
        ).await);
    }
    for i in 0..2 {
        let id = format!("urgent-{i}");
        assert!(pool.submit(
            make_high_priority_message(&id, "P", "group-a", "batch-1"),
            log.callback(&id)
        ).await);
    }

    log.wait_for(6, Duration::from_secs(5)).await;

    let calls = mediator.calls();
    assert_eq!(calls[0], "head");
    // Both urgents run before any regular, in their own FIFO order.
    assert_eq!(&calls[1..3], &["urgent-0".to_string(), "urgent-1".to_string()]);
    assert_eq!(
        &calls[3..],
        &[
            "regular-0".to_string(),
            "regular-1".to_string(),
            "regular-2".to_string()
        ]
    );
}

#[tokio::test]
async fn scenario_serial_pool_acks_in_sequence() {
    let mediator = Arc::new(StubMediator::success(Duration::from_millis(20)));
    let pool = ProcessPool::new(pool_config("P", 1), mediator.clone());
    let log = CallbackLog::new();

    let start = Instant::now();
    assert!(pool.submit(
        make_message("m1", "P", "A", "batch-1"),
        log.callback("m1")
    ).await);
    assert!(pool.submit(
        make_message("m2", "P", "A", "batch-1"),
        log.callback("m2")
    ).await);

    log.wait_for(2, Duration::from_secs(2)).await;

    assert!(start.elapsed() >= Duration::from_millis(40));
    let events = log.events();
    assert_eq!(
        events,
        vec![
            ("m1".to_string(), Terminal::Ack),
            ("m2".to_string(), Terminal::Ack)
        ]
    );

    let stats = pool.stats();
    assert_eq!(stats.totals.processed, 2);
    assert_eq!(stats.totals.succeeded, 2);
    assert!(stats.mean_duration_ms >= 15.0);
}

#[tokio::test]
async fn idle_group_worker_retires_and_is_recreated() {
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = ProcessPool::new(pool_config("P", 2), mediator.clone())
        .with_idle_timeout(Duration::from_millis(50));
    let log = CallbackLog::new();

    assert!(pool.submit(
        make_message("m1", "P", "group-a", "batch-1"),
        log.callback("m1")
    ).await);
    log.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(pool.stats().message_group_count, 1);

    // Past the idle timeout the worker cleans itself up.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pool.stats().message_group_count, 0);

    // A fresh enqueue on the same group gets a fresh worker.
    assert!(pool.submit(
        make_message("m2", "P", "group-a", "batch-2"),
        log.callback("m2")
    ).await);
    log.wait_for(2, Duration::from_secs(2)).await;
    assert_eq!(mediator.call_count(), 2);
}
