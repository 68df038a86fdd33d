use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod logging;

/// Message group used when a message carries no explicit group.
pub const DEFAULT_MESSAGE_GROUP: &str = "__DEFAULT__";

/// Pool assigned to messages from the embedded queue when none is given.
pub const DEFAULT_POOL_EMBEDDED: &str = "POOL-MEDIUM";

/// Pool assigned to messages from external brokers when none is given.
pub const DEFAULT_POOL_EXTERNAL: &str = "DEFAULT";

/// Brokers cap redelivery delays at 12 hours.
pub const MAX_NACK_DELAY_SECONDS: u32 = 43_200;

/// Redelivery delay when the downstream gave no explicit delay.
pub const DEFAULT_NACK_DELAY_SECONDS: u32 = 30;

/// Redelivery delay for messages fast-failed behind a failed batch-group.
pub const FAST_FAIL_NACK_DELAY_SECONDS: u32 = 10;

/// Redelivery delay when a pool rejects a message at capacity.
pub const POOL_REJECT_NACK_DELAY_SECONDS: u32 = 5;

/// Clamp a requested redelivery delay to what brokers accept.
pub fn clamp_nack_delay(seconds: u32) -> u32 {
    seconds.min(MAX_NACK_DELAY_SECONDS)
}

// ============================================================================
// Message types
// ============================================================================

/// Routing metadata extracted from the message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub pool_code: String,
    /// Never empty; `"__DEFAULT__"` when the envelope had no group.
    pub message_group_id: String,
    /// Absolute URL of the downstream endpoint deciding ack/nack.
    pub callback_url: String,
    pub auth_token: Option<String>,
    /// Opaque JSON forwarded verbatim as the mediation request body.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub high_priority: bool,
}

/// One logical unit to route.
///
/// `message_id` is the application-assigned idempotency key and survives
/// redeliveries; `broker_message_id` and `receipt_handle` belong to the
/// broker copy currently in hand and may change on each redelivery.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub broker_message_id: String,
    pub receipt_handle: String,
    pub receive_count: u32,
    pub received_at: DateTime<Utc>,
    /// Shared by every message returned from a single broker poll.
    pub batch_id: String,
    pub queue_id: String,
    pub pointer: MessagePointer,
}

// ============================================================================
// Mediation types
// ============================================================================

/// Classification of one mediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and acknowledged by the downstream.
    Success,
    /// Downstream said "not yet" (`{"ack": false}`); redeliver after a delay.
    Deferred,
    /// Permanent protocol error (4xx); acked so it cannot loop forever.
    ErrorConfig,
    /// Transient infrastructure fault (5xx, timeout, circuit open).
    ErrorProcess,
    /// Could not reach the downstream at all.
    ErrorConnection,
}

/// Outcome of a full mediation (all retries spent), ready for dispatch.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub delay_seconds: Option<u32>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    /// Set when the outcome was produced by an open circuit breaker
    /// without any HTTP I/O.
    pub circuit_open: bool,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            delay_seconds: None,
            status_code: Some(status_code),
            error_message: None,
            circuit_open: false,
        }
    }

    pub fn deferred(delay_seconds: u32, message: Option<String>) -> Self {
        Self {
            result: MediationResult::Deferred,
            delay_seconds: Some(delay_seconds),
            status_code: Some(200),
            error_message: message,
            circuit_open: false,
        }
    }

    pub fn error_config(status_code: u16, message: String) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            delay_seconds: None,
            status_code: Some(status_code),
            error_message: Some(message),
            circuit_open: false,
        }
    }

    pub fn error_process(status_code: Option<u16>, message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds: None,
            status_code,
            error_message: Some(message),
            circuit_open: false,
        }
    }

    pub fn error_connection(message: String) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            delay_seconds: None,
            status_code: None,
            error_message: Some(message),
            circuit_open: false,
        }
    }

    pub fn circuit_open(target: &str) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds: None,
            status_code: None,
            error_message: Some(format!("circuit open for {target}")),
            circuit_open: true,
        }
    }
}

// ============================================================================
// Configuration types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

/// One consumer endpoint from the routing configuration.
///
/// At least one of `queue_uri` / `queue_name` must be present; entries with
/// neither are skipped with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default)]
    pub queue_uri: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub connections: Option<u32>,
}

impl QueueConfig {
    /// Stable identifier for diffing: the name when present, else the URI.
    pub fn identifier(&self) -> Option<String> {
        self.queue_name
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.queue_uri.clone().filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    pub processing_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

// ============================================================================
// Health & statistics
// ============================================================================

/// Liveness snapshot of one broker consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHealth {
    pub queue_id: String,
    pub is_running: bool,
    pub last_poll_time_ms: i64,
    pub time_since_last_poll_ms: i64,
    pub is_healthy: bool,
}

impl ConsumerHealth {
    /// A consumer is healthy while it is running and has polled within the
    /// last minute (or has not started polling yet).
    pub fn evaluate(queue_id: &str, is_running: bool, last_poll_time_ms: i64, now_ms: i64) -> Self {
        let time_since = if last_poll_time_ms == 0 {
            0
        } else {
            (now_ms - last_poll_time_ms).max(0)
        };
        Self {
            queue_id: queue_id.to_string(),
            is_running,
            last_poll_time_ms,
            time_since_last_poll_ms: time_since,
            is_healthy: is_running && (last_poll_time_ms == 0 || time_since < 60_000),
        }
    }
}

/// Broker-reported depth plus consumer-side terminal totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub queue_id: String,
    /// Approximate messages waiting on the broker (0 where unsupported).
    pub pending_messages: u64,
    /// Approximate messages in flight on the broker (0 where unsupported).
    pub in_flight_messages: u64,
    pub total_polled: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
}

/// Counter snapshot over one rolling window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCounts {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub transient: u64,
    pub deferred: u64,
    pub rate_limited: u64,
}

impl WindowCounts {
    /// Success rate over this window. Transient outcomes (including
    /// deferrals) are redeliveries, not verdicts, and are excluded.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.succeeded + self.failed;
        if attempts == 0 {
            1.0
        } else {
            self.succeeded as f64 / attempts as f64
        }
    }
}

/// Point-in-time statistics for one process pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queued_messages: u32,
    pub max_capacity: u32,
    pub message_group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub totals: WindowCounts,
    pub last_5_min: WindowCounts,
    pub last_30_min: WindowCounts,
    /// Running mean over the last 1000 processing durations.
    pub mean_duration_ms: f64,
}

// ============================================================================
// Warnings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    Routing,
    Processing,
    Configuration,
    RateLimiting,
    PoolCapacity,
    PoolHealth,
    ConsumerHealth,
    CircuitBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// An operational warning kept in memory for monitoring collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_delay_is_clamped_to_broker_maximum() {
        assert_eq!(clamp_nack_delay(0), 0);
        assert_eq!(clamp_nack_delay(30), 30);
        assert_eq!(clamp_nack_delay(43_200), 43_200);
        assert_eq!(clamp_nack_delay(100_000), 43_200);
    }

    #[test]
    fn success_rate_excludes_transient_outcomes() {
        let counts = WindowCounts {
            processed: 10,
            succeeded: 4,
            failed: 1,
            transient: 4,
            deferred: 1,
            rate_limited: 0,
        };
        assert!((counts.success_rate() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn success_rate_defaults_to_one_with_no_attempts() {
        assert_eq!(WindowCounts::default().success_rate(), 1.0);
    }

    #[test]
    fn consumer_health_tolerates_never_polled() {
        let health = ConsumerHealth::evaluate("q1", true, 0, 1_000_000);
        assert!(health.is_healthy);
        assert_eq!(health.time_since_last_poll_ms, 0);
    }

    #[test]
    fn consumer_health_flags_stale_polls() {
        let health = ConsumerHealth::evaluate("q1", true, 1_000, 100_000_000);
        assert!(!health.is_healthy);
        let health = ConsumerHealth::evaluate("q1", false, 0, 0);
        assert!(!health.is_healthy);
    }
}
