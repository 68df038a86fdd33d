//! Pool admission, batch-group fast-fail, outcome dispositions, and
//! drain/shutdown behavior.

mod support;

use std::sync::Arc;
use std::time::Duration;

use courier_core::{MediationOutcome, PoolConfig};
use courier_router::{OutcomePolicy, ProcessPool};

use support::{make_message, CallbackLog, GatedMediator, StubMediator, Terminal};

fn pool_config(concurrency: u32) -> PoolConfig {
    PoolConfig {
        code: "P".to_string(),
        concurrency,
        rate_limit_per_minute: None,
    }
}

/// Terminal callbacks fire just before the worker's final bookkeeping;
/// settle on the counters instead of racing them.
async fn wait_until_drained(pool: &ProcessPool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !pool.is_drained() {
        assert!(std::time::Instant::now() < deadline, "pool never drained");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn rejection_at_capacity_has_no_side_effects() {
    // Concurrency 1 gives the floor capacity of 50.
    let mediator = Arc::new(GatedMediator::new());
    let pool = ProcessPool::new(pool_config(1), mediator.clone());
    let log = CallbackLog::new();

    assert_eq!(pool.max_capacity(), 50);
    for i in 0..50 {
        let id = format!("m-{i}");
        let message = make_message(&id, "P", &format!("group-{i}"), "batch-1");
        assert!(pool.submit(message, log.callback(&id)).await, "submit {i} rejected early");
    }
    assert_eq!(pool.queued_messages(), 50);
    let groups_before = pool.stats().message_group_count;

    // 51st message: rejected with nothing mutated.
    let overflow = make_message("overflow", "P", "group-overflow", "batch-1");
    assert!(!pool.submit(overflow, log.callback("overflow")).await);
    assert_eq!(pool.queued_messages(), 50);
    assert_eq!(pool.stats().message_group_count, groups_before);
    assert!(log.terminal_for("overflow").is_none());

    mediator.release_all();
    log.wait_for(50, Duration::from_secs(5)).await;
    wait_until_drained(&pool).await;
}

#[tokio::test]
async fn drained_pool_rejects_submissions() {
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = ProcessPool::new(pool_config(2), mediator);
    let log = CallbackLog::new();

    pool.drain();
    assert!(!pool.submit(
        make_message("m1", "P", "group-a", "batch-1"),
        log.callback("m1")
    ).await);
    assert_eq!(pool.queued_messages(), 0);
    assert!(pool.is_drained());
}

#[tokio::test]
async fn transient_failure_fast_fails_the_rest_of_the_batch_group() {
    let mediator = Arc::new(StubMediator::transient(Duration::from_millis(10)));
    let pool = ProcessPool::new(pool_config(2), mediator.clone());
    let log = CallbackLog::new();

    for i in 1..=3 {
        let id = format!("m{i}");
        assert!(pool.submit(
            make_message(&id, "P", "B", "batch-7"),
            log.callback(&id)
        ).await);
    }

    log.wait_for(3, Duration::from_secs(2)).await;

    // Only the first message reached the mediator; the rest were nacked
    // behind the failed batch-group.
    assert_eq!(mediator.call_count(), 1);
    assert_eq!(log.terminal_for("m1"), Some(Terminal::Nack(Some(30))));
    assert_eq!(log.terminal_for("m2"), Some(Terminal::Nack(Some(10))));
    assert_eq!(log.terminal_for("m3"), Some(Terminal::Nack(Some(10))));

    // Fast-failed messages never reach a mediation verdict and are not
    // counted; only the triggering failure is.
    let stats = pool.stats();
    assert_eq!(stats.totals.transient, 1);
    assert_eq!(stats.totals.processed, 1);
}

#[tokio::test]
async fn failed_batch_group_is_purged_once_fully_accounted() {
    let outcomes = Arc::new(parking_lot::Mutex::new(vec![
        MediationOutcome::error_process(Some(500), "HTTP 500".to_string()),
    ]));
    let outcomes_clone = outcomes.clone();
    let mediator = Arc::new(StubMediator::with_outcome(Duration::ZERO, move |_| {
        outcomes_clone
            .lock()
            .pop()
            .unwrap_or_else(|| MediationOutcome::success(200))
    }));
    let pool = ProcessPool::new(pool_config(2), mediator.clone());
    let log = CallbackLog::new();

    // First wave: one failure poisons the pair for the second message.
    assert!(pool.submit(make_message("m1", "P", "B", "batch-7"), log.callback("m1")).await);
    assert!(pool.submit(make_message("m2", "P", "B", "batch-7"), log.callback("m2")).await);
    log.wait_for(2, Duration::from_secs(2)).await;
    wait_until_drained(&pool).await;
    assert_eq!(mediator.call_count(), 1);

    // The count hit zero, so the failure mark is gone: a redelivered
    // message with the same batch and group reaches the mediator.
    assert!(pool.submit(make_message("m3", "P", "B", "batch-7"), log.callback("m3")).await);
    log.wait_for(3, Duration::from_secs(2)).await;
    assert_eq!(mediator.call_count(), 2);
    assert_eq!(log.terminal_for("m3"), Some(Terminal::Ack));
}

#[tokio::test]
async fn outcome_dispositions_map_to_ack_nack_and_counters() {
    let mediator = Arc::new(StubMediator::with_outcome(Duration::ZERO, |message| {
        match message.message_id.as_str() {
            "ok" => MediationOutcome::success(200),
            "bad-request" => MediationOutcome::error_config(400, "nope".to_string()),
            "deferred" => MediationOutcome::deferred(45, None),
            "down" => MediationOutcome::error_process(Some(503), "HTTP 503".to_string()),
            _ => MediationOutcome::error_connection("refused".to_string()),
        }
    }));
    let pool = ProcessPool::new(pool_config(4), mediator);
    let log = CallbackLog::new();

    // Distinct batch-groups so failures do not cascade across cases.
    for (i, id) in ["ok", "bad-request", "deferred", "down", "unreachable"]
        .iter()
        .enumerate()
    {
        assert!(pool.submit(
            make_message(id, "P", &format!("g-{i}"), &format!("b-{i}")),
            log.callback(id)
        ).await);
    }

    log.wait_for(5, Duration::from_secs(2)).await;

    assert_eq!(log.terminal_for("ok"), Some(Terminal::Ack));
    // Permanent protocol errors ack so the message cannot loop.
    assert_eq!(log.terminal_for("bad-request"), Some(Terminal::Ack));
    assert_eq!(log.terminal_for("deferred"), Some(Terminal::Nack(Some(45))));
    assert_eq!(log.terminal_for("down"), Some(Terminal::Nack(Some(30))));
    assert_eq!(log.terminal_for("unreachable"), Some(Terminal::Nack(Some(30))));

    let totals = pool.stats().totals;
    assert_eq!(totals.processed, 5);
    assert_eq!(totals.succeeded, 1);
    assert_eq!(totals.failed, 2); // 4xx and connection error
    assert_eq!(totals.transient, 1);
    assert_eq!(totals.deferred, 1);
}

#[tokio::test]
async fn connection_error_bucketing_follows_policy() {
    let mediator = Arc::new(StubMediator::with_outcome(Duration::ZERO, |_| {
        MediationOutcome::error_connection("refused".to_string())
    }));
    let pool = ProcessPool::new(pool_config(2), mediator.clone()).with_outcome_policy(
        OutcomePolicy {
            connection_errors_are_transient: true,
        },
    );
    let log = CallbackLog::new();

    assert!(pool
        .submit(make_message("m1", "P", "A", "b-1"), log.callback("m1"))
        .await);
    log.wait_for(1, Duration::from_secs(2)).await;

    let totals = pool.stats().totals;
    assert_eq!(totals.transient, 1);
    assert_eq!(totals.failed, 0);
    // Transient outcomes stay out of the success-rate denominator.
    assert_eq!(totals.success_rate(), 1.0);
}

#[tokio::test]
async fn drain_completes_in_flight_work() {
    let mediator = Arc::new(GatedMediator::new());
    let pool = ProcessPool::new(pool_config(2), mediator.clone());
    let log = CallbackLog::new();

    assert!(pool.submit(make_message("m1", "P", "A", "b-1"), log.callback("m1")).await);
    assert!(pool.submit(make_message("m2", "P", "B", "b-1"), log.callback("m2")).await);

    // Wait until both are actually inside the mediator.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while mediator.started_count() < 2 {
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pool.drain();
    assert!(!pool.is_drained());
    assert!(!pool.submit(make_message("m3", "P", "A", "b-1"), log.callback("m3")).await);

    mediator.release_all();
    log.wait_for(2, Duration::from_secs(2)).await;
    wait_until_drained(&pool).await;
    assert_eq!(log.terminal_for("m1"), Some(Terminal::Ack));
    assert_eq!(log.terminal_for("m2"), Some(Terminal::Ack));
}

#[tokio::test]
async fn concurrency_update_applies_in_place() {
    let mediator = Arc::new(GatedMediator::new());
    let pool = ProcessPool::new(pool_config(1), mediator.clone());
    let log = CallbackLog::new();

    for i in 0..3 {
        let id = format!("m-{i}");
        assert!(pool.submit(
            make_message(&id, "P", &format!("g-{i}"), "b-1"),
            log.callback(&id)
        ).await);
    }

    // Only one mediation admitted at concurrency 1.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mediator.started_count(), 1);

    pool.update_config(&PoolConfig {
        code: "P".to_string(),
        concurrency: 3,
        rate_limit_per_minute: None,
    });
    assert_eq!(pool.concurrency(), 3);

    // Raising the ceiling admits the waiters without re-submission.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while mediator.started_count() < 3 {
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    mediator.release_all();
    log.wait_for(3, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_clears_group_state() {
    let mediator = Arc::new(StubMediator::success(Duration::ZERO));
    let pool = ProcessPool::new(pool_config(2), mediator);
    let log = CallbackLog::new();

    assert!(pool.submit(make_message("m1", "P", "A", "b-1"), log.callback("m1")).await);
    log.wait_for(1, Duration::from_secs(2)).await;

    pool.shutdown();
    assert_eq!(pool.stats().message_group_count, 0);
    assert!(!pool.submit(make_message("m2", "P", "A", "b-1"), log.callback("m2")).await);
}
