//! Embedded on-disk queue backed by SQLite.
//!
//! Mimics broker semantics for local and single-instance deployments:
//! visibility timeouts with receipt handles, nack with delay, and publish
//! deduplication by `message_deduplication_id` inside a configurable window
//! that survives consumption of the original message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use sqlx::{Pool, Row, Sqlite};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::envelope::parse_envelope;
use courier_core::{clamp_nack_delay, ConsumerHealth, QueueMetrics, DEFAULT_POOL_EMBEDDED};

use crate::{
    now_ms, pacing_delay, prepare_batch, BatchHandler, BrokerConsumer, BrokerError,
    MessageCallback, QueueCounters, RawFrame, SLOW_POLL_WARN,
};

#[derive(Debug, Clone)]
pub struct EmbeddedQueueConfig {
    pub queue_name: String,
    pub visibility_timeout_seconds: u32,
    /// How long a `message_deduplication_id` suppresses re-insertion.
    pub dedup_window_seconds: u32,
    pub connections: u32,
    pub max_messages: u32,
}

impl Default for EmbeddedQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "courier-local".to_string(),
            visibility_timeout_seconds: 120,
            dedup_window_seconds: 300,
            connections: 1,
            max_messages: 10,
        }
    }
}

/// Durable queue storage. Shared by the consumer and the local publisher.
pub struct SqliteQueueStore {
    pool: Pool<Sqlite>,
    config: EmbeddedQueueConfig,
}

impl SqliteQueueStore {
    pub fn new(pool: Pool<Sqlite>, config: EmbeddedQueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub async fn init_schema(&self) -> crate::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                message_group_id TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_dedup_ids (
                queue_name TEXT NOT NULL,
                dedup_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (queue_name, dedup_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.config.queue_name, "Embedded queue schema initialized");
        Ok(())
    }

    /// Publish one envelope body. Returns the application message id, also
    /// used as the broker message id for this queue.
    ///
    /// Re-publishing an id that is still queued is a no-op, and a
    /// `dedup_id` seen within the dedup window suppresses insertion even
    /// after the original was consumed.
    pub async fn publish(&self, body: &str, dedup_id: Option<&str>) -> crate::Result<String> {
        let parsed = parse_envelope(body, DEFAULT_POOL_EMBEDDED)
            .map_err(|e| BrokerError::Config(format!("unpublishable envelope: {e}")))?;

        let now = Utc::now().timestamp();

        if let Some(dedup) = dedup_id {
            sqlx::query("DELETE FROM queue_dedup_ids WHERE expires_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO queue_dedup_ids (queue_name, dedup_id, expires_at) VALUES (?, ?, ?)",
            )
            .bind(&self.config.queue_name)
            .bind(dedup)
            .bind(now + self.config.dedup_window_seconds as i64)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 0 {
                debug!(
                    queue = %self.config.queue_name,
                    dedup_id = %dedup,
                    "Suppressing publish inside deduplication window"
                );
                return Ok(parsed.message_id);
            }
        }

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages
                (id, queue_name, message_group_id, visible_at, payload, created_at, receive_count)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&parsed.message_id)
        .bind(&self.config.queue_name)
        .bind(&parsed.pointer.message_group_id)
        .bind(now)
        .bind(body)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                queue = %self.config.queue_name,
                message_id = %parsed.message_id,
                "Message already queued, skipping insert"
            );
        }

        Ok(parsed.message_id)
    }

    pub async fn publish_batch(&self, bodies: &[String]) -> crate::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            ids.push(self.publish(body, None).await?);
        }
        Ok(ids)
    }

    /// Claim up to `max_messages` visible messages, stamping each with a
    /// fresh receipt handle and pushing its visibility out.
    pub async fn poll(&self, max_messages: u32) -> crate::Result<Vec<RawFrame>> {
        let now = Utc::now().timestamp();
        let new_visible_at = now + self.config.visibility_timeout_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, payload, receive_count FROM queue_messages
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY created_at, id
            LIMIT ?
            "#,
        )
        .bind(&self.config.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut frames = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            let receive_count: i64 = row.get("receive_count");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            let claimed = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE queue_name = ? AND id = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&self.config.queue_name)
            .bind(&id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                // Another poller won this row.
                continue;
            }

            frames.push(RawFrame {
                broker_message_id: id,
                receipt_handle,
                body: payload,
                receive_count: (receive_count + 1).max(1) as u32,
            });
        }

        Ok(frames)
    }

    pub async fn ack(&self, receipt_handle: &str) -> crate::Result<()> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE queue_name = ? AND receipt_handle = ?",
        )
        .bind(&self.config.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    pub async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> crate::Result<()> {
        let delay = clamp_nack_delay(delay_seconds.unwrap_or(0)) as i64;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE queue_name = ? AND receipt_handle = ?
            "#,
        )
        .bind(Utc::now().timestamp() + delay)
        .bind(&self.config.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    pub async fn extend(&self, receipt_handle: &str, seconds: u32) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE queue_name = ? AND receipt_handle = ?",
        )
        .bind(Utc::now().timestamp() + seconds as i64)
        .bind(&self.config.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    pub async fn depth(&self) -> crate::Result<(u64, u64)> {
        let now = Utc::now().timestamp();

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM queue_messages WHERE queue_name = ? AND visible_at <= ?",
        )
        .bind(&self.config.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        let in_flight: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM queue_messages WHERE queue_name = ? AND visible_at > ? AND receipt_handle IS NOT NULL",
        )
        .bind(&self.config.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        Ok((pending.max(0) as u64, in_flight.max(0) as u64))
    }
}

/// Poller front-end over [`SqliteQueueStore`] with the uniform consumer
/// contract.
pub struct EmbeddedConsumer {
    store: Arc<SqliteQueueStore>,
    handler: Arc<dyn BatchHandler>,
    running: Arc<AtomicBool>,
    last_poll_ms: Arc<AtomicI64>,
    pending_delete: Arc<DashSet<String>>,
    counters: Arc<QueueCounters>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EmbeddedConsumer {
    pub fn new(store: Arc<SqliteQueueStore>, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            store,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            last_poll_ms: Arc::new(AtomicI64::new(0)),
            pending_delete: Arc::new(DashSet::new()),
            counters: Arc::new(QueueCounters::default()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    async fn poll_once(&self) -> crate::Result<usize> {
        let frames = self.store.poll(self.store.config.max_messages).await?;
        let received = frames.len();
        self.counters.record_polled(received);

        let prepared = prepare_batch(
            self.store.queue_name(),
            DEFAULT_POOL_EMBEDDED,
            frames,
            &self.pending_delete,
        );

        for dropped in &prepared.drops {
            if let Err(e) = self.store.ack(&dropped.receipt_handle).await {
                warn!(queue = %self.store.queue_name(), error = %e, "Failed to delete dropped frame");
            }
        }

        if !prepared.messages.is_empty() {
            let mut callbacks: HashMap<String, Arc<dyn MessageCallback>> = HashMap::new();
            for msg in &prepared.messages {
                callbacks.insert(
                    msg.broker_message_id.clone(),
                    Arc::new(EmbeddedCallback {
                        store: self.store.clone(),
                        receipt_handle: msg.receipt_handle.clone(),
                        counters: self.counters.clone(),
                    }),
                );
            }

            let fallback: Vec<Arc<dyn MessageCallback>> = callbacks.values().cloned().collect();
            if let Err(e) = self.handler.handle(prepared.messages, callbacks).await {
                error!(queue = %self.store.queue_name(), error = %e, "Batch handler failed, nacking batch");
                for cb in fallback {
                    cb.nack(None).await;
                }
            }
        }

        Ok(received)
    }

    async fn run_poller(self: Arc<Self>, poller: u32) {
        info!(queue = %self.store.queue_name(), poller = poller, "Embedded poller started");

        while self.running.load(Ordering::SeqCst) {
            self.last_poll_ms.store(now_ms(), Ordering::SeqCst);
            let started = Instant::now();

            match self.poll_once().await {
                Ok(received) => {
                    if started.elapsed() > SLOW_POLL_WARN {
                        warn!(
                            queue = %self.store.queue_name(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Poll iteration exceeded 30s - consumer may be starved"
                        );
                    }
                    if let Some(delay) =
                        pacing_delay(received, self.store.config.max_messages as usize)
                    {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!(queue = %self.store.queue_name(), error = %e, "Embedded poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(queue = %self.store.queue_name(), poller = poller, "Embedded poller exited");
    }
}

#[async_trait]
impl BrokerConsumer for EmbeddedConsumer {
    fn queue_id(&self) -> &str {
        self.store.queue_name()
    }

    async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().await;
        for poller in 0..self.store.config.connections.max(1) {
            let consumer = self.clone();
            tasks.push(tokio::spawn(consumer.run_poller(poller)));
        }

        info!(
            queue = %self.store.queue_name(),
            connections = self.store.config.connections.max(1),
            "Embedded consumer started"
        );
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!(queue = %self.store.queue_name(), "Embedded consumer stopped");
    }

    fn health(&self) -> ConsumerHealth {
        ConsumerHealth::evaluate(
            self.store.queue_name(),
            self.running.load(Ordering::SeqCst),
            self.last_poll_ms.load(Ordering::SeqCst),
            now_ms(),
        )
    }

    async fn queue_metrics(&self) -> QueueMetrics {
        let (pending, in_flight) = self.store.depth().await.unwrap_or((0, 0));
        QueueMetrics {
            queue_id: self.store.queue_name().to_string(),
            pending_messages: pending,
            in_flight_messages: in_flight,
            total_polled: self.counters.polled.load(Ordering::Relaxed),
            total_acked: self.counters.acked.load(Ordering::Relaxed),
            total_nacked: self.counters.nacked.load(Ordering::Relaxed),
        }
    }
}

struct EmbeddedCallback {
    store: Arc<SqliteQueueStore>,
    receipt_handle: String,
    counters: Arc<QueueCounters>,
}

#[async_trait]
impl MessageCallback for EmbeddedCallback {
    async fn ack(&self) {
        if let Err(e) = self.store.ack(&self.receipt_handle).await {
            warn!(queue = %self.store.queue_name(), error = %e, "Embedded ack failed");
        }
        self.counters.record_acked();
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        if let Err(e) = self.store.nack(&self.receipt_handle, delay_seconds).await {
            warn!(queue = %self.store.queue_name(), error = %e, "Embedded nack failed");
        }
        self.counters.record_nacked();
    }

    async fn extend(&self, seconds: u32) {
        if let Err(e) = self.store.extend(&self.receipt_handle, seconds).await {
            debug!(queue = %self.store.queue_name(), error = %e, "Embedded visibility extension failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    fn envelope(message_id: &str, group: Option<&str>) -> String {
        match group {
            Some(g) => format!(
                r#"{{"messageId": "{message_id}", "messageGroupId": "{g}", "callbackUrl": "http://localhost:9/cb"}}"#
            ),
            None => format!(
                r#"{{"messageId": "{message_id}", "callbackUrl": "http://localhost:9/cb"}}"#
            ),
        }
    }

    async fn test_store(visibility: u32, dedup_window: u32) -> SqliteQueueStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteQueueStore::new(
            pool,
            EmbeddedQueueConfig {
                queue_name: "test-queue".to_string(),
                visibility_timeout_seconds: visibility,
                dedup_window_seconds: dedup_window,
                connections: 1,
                max_messages: 10,
            },
        );
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn publish_poll_ack_roundtrip() {
        let store = test_store(30, 300).await;

        let id = store.publish(&envelope("m-1", None), None).await.unwrap();
        assert_eq!(id, "m-1");

        let frames = store.poll(10).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].broker_message_id, "m-1");
        assert_eq!(frames[0].receive_count, 1);

        store.ack(&frames[0].receipt_handle).await.unwrap();
        assert!(store.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn polled_message_is_invisible_until_nacked() {
        let store = test_store(30, 300).await;
        store.publish(&envelope("m-1", None), None).await.unwrap();

        let frames = store.poll(10).await.unwrap();
        assert_eq!(frames.len(), 1);

        // Claimed: a second poll sees nothing.
        assert!(store.poll(10).await.unwrap().is_empty());

        // Nack with zero delay makes it visible again with a bumped count.
        store.nack(&frames[0].receipt_handle, Some(0)).await.unwrap();
        let frames = store.poll(10).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].receive_count, 2);
    }

    #[tokio::test]
    async fn nack_with_delay_defers_redelivery() {
        let store = test_store(30, 300).await;
        store.publish(&envelope("m-1", None), None).await.unwrap();

        let frames = store.poll(10).await.unwrap();
        store.nack(&frames[0].receipt_handle, Some(60)).await.unwrap();

        assert!(store.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_not_reinserted_while_queued() {
        let store = test_store(30, 300).await;
        store.publish(&envelope("m-1", None), None).await.unwrap();
        store.publish(&envelope("m-1", None), None).await.unwrap();

        assert_eq!(store.poll(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dedup_id_suppresses_republish_after_consume() {
        let store = test_store(30, 300).await;

        store
            .publish(&envelope("m-1", None), Some("dedup-key"))
            .await
            .unwrap();
        let frames = store.poll(10).await.unwrap();
        store.ack(&frames[0].receipt_handle).await.unwrap();

        // Same dedup id inside the window: suppressed even though the
        // original row is gone.
        store
            .publish(&envelope("m-2", None), Some("dedup-key"))
            .await
            .unwrap();
        assert!(store.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn depth_reports_pending_and_in_flight() {
        let store = test_store(30, 300).await;
        store.publish(&envelope("m-1", None), None).await.unwrap();
        store.publish(&envelope("m-2", None), None).await.unwrap();

        assert_eq!(store.depth().await.unwrap(), (2, 0));

        store.poll(1).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn extend_pushes_visibility_out() {
        let store = test_store(0, 300).await;
        store.publish(&envelope("m-1", None), None).await.unwrap();

        let frames = store.poll(10).await.unwrap();
        // Zero visibility: without an extension the message is immediately
        // pollable again.
        store.extend(&frames[0].receipt_handle, 120).await.unwrap();
        assert!(store.poll(10).await.unwrap().is_empty());
    }
}
