//! Test doubles shared by the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use courier_broker::MessageCallback;
use courier_core::{MediationOutcome, MessagePointer, QueueMessage};
use courier_router::Mediator;

/// Build a routable message without going through a broker.
pub fn make_message(id: &str, pool_code: &str, group: &str, batch: &str) -> QueueMessage {
    QueueMessage {
        message_id: id.to_string(),
        broker_message_id: format!("broker-{id}"),
        receipt_handle: format!("receipt-{id}"),
        receive_count: 1,
        received_at: Utc::now(),
        batch_id: batch.to_string(),
        queue_id: "test-queue".to_string(),
        pointer: MessagePointer {
            pool_code: pool_code.to_string(),
            message_group_id: group.to_string(),
            callback_url: "http://localhost:9/unused".to_string(),
            auth_token: None,
            payload: serde_json::json!({"n": 1}),
            high_priority: false,
        },
    }
}

pub fn make_high_priority_message(
    id: &str,
    pool_code: &str,
    group: &str,
    batch: &str,
) -> QueueMessage {
    let mut message = make_message(id, pool_code, group, batch);
    message.pointer.high_priority = true;
    message
}

/// Terminal event observed on a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ack,
    Nack(Option<u32>),
}

/// Callback that records its terminal event and when it happened.
pub struct RecordingCallback {
    pub message_id: String,
    events: Arc<Mutex<Vec<(String, Terminal, Instant)>>>,
}

impl RecordingCallback {
    pub fn new(message_id: &str, events: Arc<Mutex<Vec<(String, Terminal, Instant)>>>) -> Self {
        Self {
            message_id: message_id.to_string(),
            events,
        }
    }
}

#[async_trait]
impl MessageCallback for RecordingCallback {
    async fn ack(&self) {
        self.events
            .lock()
            .push((self.message_id.clone(), Terminal::Ack, Instant::now()));
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        self.events.lock().push((
            self.message_id.clone(),
            Terminal::Nack(delay_seconds),
            Instant::now(),
        ));
    }
}

/// Shared event log plus helpers to await outcomes.
#[derive(Clone, Default)]
pub struct CallbackLog {
    events: Arc<Mutex<Vec<(String, Terminal, Instant)>>>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self, message_id: &str) -> Arc<RecordingCallback> {
        Arc::new(RecordingCallback::new(message_id, self.events.clone()))
    }

    pub fn events(&self) -> Vec<(String, Terminal)> {
        self.events
            .lock()
            .iter()
            .map(|(id, t, _)| (id.clone(), t.clone()))
            .collect()
    }

    pub fn terminal_for(&self, message_id: &str) -> Option<Terminal> {
        self.events
            .lock()
            .iter()
            .find(|(id, _, _)| id == message_id)
            .map(|(_, t, _)| t.clone())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Wait until `count` terminal events have been recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.len() < count {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} terminal events, saw {:?}",
                self.events()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Mediator returning a fixed outcome after an optional delay, recording
/// call order and peak concurrency.
pub struct StubMediator {
    outcome: Box<dyn Fn(&QueueMessage) -> MediationOutcome + Send + Sync>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl StubMediator {
    pub fn success(delay: Duration) -> Self {
        Self::with_outcome(delay, |_| MediationOutcome::success(200))
    }

    pub fn transient(delay: Duration) -> Self {
        Self::with_outcome(delay, |_| {
            MediationOutcome::error_process(Some(503), "HTTP 503".to_string())
        })
    }

    pub fn with_outcome<F>(delay: Duration, outcome: F) -> Self
    where
        F: Fn(&QueueMessage) -> MediationOutcome + Send + Sync + 'static,
    {
        Self {
            outcome: Box::new(outcome),
            delay,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for StubMediator {
    async fn process(&self, message: &QueueMessage) -> MediationOutcome {
        self.calls.lock().push(message.message_id.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.outcome)(message)
    }
}

/// Mediator that blocks until released, for capacity and drain tests.
pub struct GatedMediator {
    gate: Arc<tokio::sync::Notify>,
    released: Arc<std::sync::atomic::AtomicBool>,
    started: AtomicUsize,
}

impl GatedMediator {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Notify::new()),
            released: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            started: AtomicUsize::new(0),
        }
    }

    pub fn release_all(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for GatedMediator {
    async fn process(&self, _message: &QueueMessage) -> MediationOutcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        loop {
            if self.released.load(Ordering::SeqCst) {
                break;
            }
            let notified = self.gate.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a release between the
            // check and the await cannot be lost.
            notified.as_mut().enable();
            if self.released.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        MediationOutcome::success(200)
    }
}
