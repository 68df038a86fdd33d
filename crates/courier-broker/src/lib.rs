//! Broker consumers for the Courier message router.
//!
//! Every broker kind exposes the same shape: `start()` spawns the configured
//! number of pollers plus a metrics updater, `stop()` signals them and waits
//! for exit, and parsed batches are delivered to a [`BatchHandler`] together
//! with one [`MessageCallback`] per broker message. The callback is the only
//! way a message leaves the broker: exactly one of ack/nack per accepted
//! message, crash excepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use courier_core::envelope::parse_envelope;
use courier_core::{ConsumerHealth, QueueMessage, QueueMetrics};

pub mod error;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "activemq")]
pub mod activemq;

#[cfg(feature = "nats")]
pub mod nats;

pub use error::BrokerError;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A poll iteration slower than this logs a starvation warning.
pub const SLOW_POLL_WARN: Duration = Duration::from_secs(30);

/// Broker-specific ack/nack closure for one received message.
///
/// Implementations swallow broker errors internally (logging them); callers
/// treat ack/nack as fire-and-forget terminal operations.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// Permanently remove the message from the broker.
    async fn ack(&self);

    /// Return the message for redelivery after `delay_seconds` (broker
    /// default when `None`). The delay is clamped to `[0, 43200]`.
    async fn nack(&self, delay_seconds: Option<u32>);

    /// Keep a long-running message invisible. No-op where the broker has no
    /// such concept.
    async fn extend(&self, _seconds: u32) {}
}

/// Receives parsed batches from a consumer.
///
/// `callbacks` maps `broker_message_id` to the callback for that message.
/// An `Err` return makes the consumer nack the entire batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(
        &self,
        batch: Vec<QueueMessage>,
        callbacks: HashMap<String, Arc<dyn MessageCallback>>,
    ) -> Result<()>;
}

/// Uniform contract over all broker kinds.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn queue_id(&self) -> &str;

    /// Spawn pollers and the metrics updater. Idempotent.
    async fn start(self: Arc<Self>);

    /// Signal stop and wait for pollers to exit.
    async fn stop(&self);

    fn health(&self) -> ConsumerHealth;

    async fn queue_metrics(&self) -> QueueMetrics;
}

// ============================================================================
// Shared poll plumbing
// ============================================================================

/// Terminal counters shared between a consumer and its callbacks.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub polled: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
}

impl QueueCounters {
    pub fn record_polled(&self, n: usize) {
        self.polled.fetch_add(n as u64, Ordering::Relaxed);
    }
    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }
}

/// Millisecond wall-clock timestamp for poll-liveness tracking.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Adaptive pacing between polls: back off hard when the queue is empty,
/// lightly on a partial batch, not at all when the broker is keeping up.
pub fn pacing_delay(received: usize, max_messages: usize) -> Option<Duration> {
    if received == 0 {
        Some(Duration::from_millis(1000))
    } else if received < max_messages {
        Some(Duration::from_millis(50))
    } else {
        None
    }
}

/// One frame as pulled off a broker, before envelope parsing.
#[derive(Debug)]
pub struct RawFrame {
    pub broker_message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub receive_count: u32,
}

/// Why a frame was acked and dropped instead of routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Body was not a valid envelope; acked so it cannot loop.
    Malformed,
    /// Another frame in this batch carried the same application message id.
    DuplicateInBatch,
    /// A previous ack failed with an expired receipt; this observation
    /// performs the deferred delete.
    PendingDelete,
}

/// A frame that must be acked at the broker and discarded.
#[derive(Debug)]
pub struct DroppedFrame {
    pub broker_message_id: String,
    pub receipt_handle: String,
    pub reason: DropReason,
}

/// A batch split into routable messages and frames to ack-and-drop.
#[derive(Debug)]
pub struct PreparedBatch {
    pub messages: Vec<QueueMessage>,
    pub drops: Vec<DroppedFrame>,
}

/// Turn raw frames into routable messages.
///
/// Applies, in order: the pending-delete check, envelope parsing (failures
/// become [`DropReason::Malformed`]), and in-batch deduplication by
/// application message id (first occurrence wins). All messages of one call
/// share a freshly minted batch id.
pub fn prepare_batch(
    queue_id: &str,
    default_pool_code: &str,
    frames: Vec<RawFrame>,
    pending_delete: &DashSet<String>,
) -> PreparedBatch {
    let batch_id = uuid::Uuid::new_v4().to_string();
    let received_at = Utc::now();

    let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut messages = Vec::with_capacity(frames.len());
    let mut drops = Vec::new();

    for frame in frames {
        if pending_delete.remove(&frame.broker_message_id).is_some() {
            drops.push(DroppedFrame {
                broker_message_id: frame.broker_message_id,
                receipt_handle: frame.receipt_handle,
                reason: DropReason::PendingDelete,
            });
            continue;
        }

        let parsed = match parse_envelope(&frame.body, default_pool_code) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    queue_id = %queue_id,
                    broker_message_id = %frame.broker_message_id,
                    error = %e,
                    "Dropping unparseable frame"
                );
                drops.push(DroppedFrame {
                    broker_message_id: frame.broker_message_id,
                    receipt_handle: frame.receipt_handle,
                    reason: DropReason::Malformed,
                });
                continue;
            }
        };

        if !seen_ids.insert(parsed.message_id.clone()) {
            drops.push(DroppedFrame {
                broker_message_id: frame.broker_message_id,
                receipt_handle: frame.receipt_handle,
                reason: DropReason::DuplicateInBatch,
            });
            continue;
        }

        messages.push(QueueMessage {
            message_id: parsed.message_id,
            broker_message_id: frame.broker_message_id,
            receipt_handle: frame.receipt_handle,
            receive_count: frame.receive_count,
            received_at,
            batch_id: batch_id.clone(),
            queue_id: queue_id.to_string(),
            pointer: parsed.pointer,
        });
    }

    PreparedBatch { messages, drops }
}
