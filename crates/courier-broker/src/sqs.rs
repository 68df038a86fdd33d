//! AWS SQS consumer.
//!
//! Ack deletes by receipt handle; a delete that fails (typically an expired
//! receipt after a long mediation) records the broker message id in the
//! pending-delete set so the next observation of that id performs the
//! deletion instead of re-routing a message that already completed. Nack
//! changes message visibility to the requested delay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use dashmap::DashSet;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::{clamp_nack_delay, ConsumerHealth, QueueMetrics, DEFAULT_POOL_EXTERNAL};

use crate::{
    now_ms, pacing_delay, prepare_batch, BatchHandler, BrokerConsumer, MessageCallback,
    QueueCounters, RawFrame, SLOW_POLL_WARN,
};

#[derive(Debug, Clone)]
pub struct SqsConsumerConfig {
    pub queue_url: String,
    pub queue_id: String,
    /// Concurrent poller tasks.
    pub connections: u32,
    /// Messages per receive call. SQS caps this at 10.
    pub max_messages: u32,
    /// Long-poll wait. SQS caps this at 20 seconds.
    pub wait_time_seconds: i32,
    pub visibility_timeout_seconds: i32,
}

impl Default for SqsConsumerConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            queue_id: String::new(),
            connections: 1,
            max_messages: 10,
            wait_time_seconds: 5,
            visibility_timeout_seconds: 120,
        }
    }
}

pub struct SqsConsumer {
    client: Client,
    config: SqsConsumerConfig,
    handler: Arc<dyn BatchHandler>,
    running: Arc<AtomicBool>,
    last_poll_ms: Arc<AtomicI64>,
    pending_delete: Arc<DashSet<String>>,
    counters: Arc<QueueCounters>,
    pending_depth: Arc<AtomicU64>,
    in_flight_depth: Arc<AtomicU64>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SqsConsumer {
    pub fn new(client: Client, mut config: SqsConsumerConfig, handler: Arc<dyn BatchHandler>) -> Self {
        config.max_messages = config.max_messages.clamp(1, 10);
        config.wait_time_seconds = config.wait_time_seconds.clamp(0, 20);
        if config.queue_id.is_empty() {
            config.queue_id = config
                .queue_url
                .rsplit('/')
                .next()
                .unwrap_or("sqs")
                .to_string();
        }

        Self {
            client,
            config,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            last_poll_ms: Arc::new(AtomicI64::new(0)),
            pending_delete: Arc::new(DashSet::new()),
            counters: Arc::new(QueueCounters::default()),
            pending_depth: Arc::new(AtomicU64::new(0)),
            in_flight_depth: Arc::new(AtomicU64::new(0)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    async fn poll_once(&self) -> crate::Result<usize> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.config.queue_url)
            .max_number_of_messages(self.config.max_messages as i32)
            .visibility_timeout(self.config.visibility_timeout_seconds)
            .wait_time_seconds(self.config.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| crate::BrokerError::Sqs(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let received = sqs_messages.len();

        let mut frames = Vec::with_capacity(received);
        for msg in sqs_messages {
            let (Some(body), Some(receipt_handle), Some(broker_id)) =
                (msg.body(), msg.receipt_handle(), msg.message_id())
            else {
                warn!(queue_id = %self.config.queue_id, "Dropping SQS frame without body or id");
                continue;
            };

            let receive_count = msg
                .attributes()
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1);

            frames.push(RawFrame {
                broker_message_id: broker_id.to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: body.to_string(),
                receive_count,
            });
        }

        self.counters.record_polled(frames.len());

        let prepared = prepare_batch(
            &self.config.queue_id,
            DEFAULT_POOL_EXTERNAL,
            frames,
            &self.pending_delete,
        );

        for dropped in &prepared.drops {
            debug!(
                queue_id = %self.config.queue_id,
                broker_message_id = %dropped.broker_message_id,
                reason = ?dropped.reason,
                "Deleting dropped SQS frame"
            );
            if let Err(e) = self.delete(&dropped.receipt_handle).await {
                warn!(queue_id = %self.config.queue_id, error = %e, "Failed to delete dropped frame");
            }
        }

        if !prepared.messages.is_empty() {
            let mut callbacks: HashMap<String, Arc<dyn MessageCallback>> = HashMap::new();
            for msg in &prepared.messages {
                callbacks.insert(
                    msg.broker_message_id.clone(),
                    Arc::new(SqsCallback {
                        client: self.client.clone(),
                        queue_url: self.config.queue_url.clone(),
                        queue_id: self.config.queue_id.clone(),
                        receipt_handle: msg.receipt_handle.clone(),
                        broker_message_id: msg.broker_message_id.clone(),
                        pending_delete: self.pending_delete.clone(),
                        counters: self.counters.clone(),
                    }),
                );
            }

            let fallback: Vec<Arc<dyn MessageCallback>> = callbacks.values().cloned().collect();
            if let Err(e) = self.handler.handle(prepared.messages, callbacks).await {
                error!(queue_id = %self.config.queue_id, error = %e, "Batch handler failed, nacking batch");
                for cb in fallback {
                    cb.nack(None).await;
                }
            }
        }

        Ok(received)
    }

    async fn delete(&self, receipt_handle: &str) -> crate::Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| crate::BrokerError::Sqs(e.to_string()))?;
        Ok(())
    }

    async fn run_poller(self: Arc<Self>, poller: u32) {
        info!(queue_id = %self.config.queue_id, poller = poller, "SQS poller started");

        while self.running.load(Ordering::SeqCst) {
            self.last_poll_ms.store(now_ms(), Ordering::SeqCst);

            let started = Instant::now();
            match self.poll_once().await {
                Ok(received) => {
                    if started.elapsed() > SLOW_POLL_WARN {
                        warn!(
                            queue_id = %self.config.queue_id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Poll iteration exceeded 30s - consumer may be starved"
                        );
                    }
                    if let Some(delay) = pacing_delay(received, self.config.max_messages as usize) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!(queue_id = %self.config.queue_id, error = %e, "SQS poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(queue_id = %self.config.queue_id, poller = poller, "SQS poller exited");
    }

    async fn run_metrics_updater(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            let result = self
                .client
                .get_queue_attributes()
                .queue_url(&self.config.queue_url)
                .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
                .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
                .send()
                .await;

            match result {
                Ok(out) => {
                    let attrs = out.attributes();
                    let pending = attrs
                        .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    let in_flight = attrs
                        .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    self.pending_depth.store(pending, Ordering::Relaxed);
                    self.in_flight_depth.store(in_flight, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(queue_id = %self.config.queue_id, error = %e, "Failed to read queue attributes");
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConsumer for SqsConsumer {
    fn queue_id(&self) -> &str {
        &self.config.queue_id
    }

    async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().await;
        for poller in 0..self.config.connections.max(1) {
            let consumer = self.clone();
            tasks.push(tokio::spawn(consumer.run_poller(poller)));
        }
        let consumer = self.clone();
        tasks.push(tokio::spawn(consumer.run_metrics_updater()));

        info!(
            queue_id = %self.config.queue_id,
            connections = self.config.connections.max(1),
            "SQS consumer started"
        );
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!(queue_id = %self.config.queue_id, "SQS consumer stopped");
    }

    fn health(&self) -> ConsumerHealth {
        ConsumerHealth::evaluate(
            &self.config.queue_id,
            self.running.load(Ordering::SeqCst),
            self.last_poll_ms.load(Ordering::SeqCst),
            now_ms(),
        )
    }

    async fn queue_metrics(&self) -> QueueMetrics {
        QueueMetrics {
            queue_id: self.config.queue_id.clone(),
            pending_messages: self.pending_depth.load(Ordering::Relaxed),
            in_flight_messages: self.in_flight_depth.load(Ordering::Relaxed),
            total_polled: self.counters.polled.load(Ordering::Relaxed),
            total_acked: self.counters.acked.load(Ordering::Relaxed),
            total_nacked: self.counters.nacked.load(Ordering::Relaxed),
        }
    }
}

struct SqsCallback {
    client: Client,
    queue_url: String,
    queue_id: String,
    receipt_handle: String,
    broker_message_id: String,
    pending_delete: Arc<DashSet<String>>,
    counters: Arc<QueueCounters>,
}

#[async_trait]
impl MessageCallback for SqsCallback {
    async fn ack(&self) {
        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await;

        if let Err(e) = result {
            // Receipt handles expire; remember the broker id so the next
            // redelivery is deleted instead of re-processed.
            warn!(
                queue_id = %self.queue_id,
                broker_message_id = %self.broker_message_id,
                error = %e,
                "ACK delete failed - scheduling pending delete"
            );
            self.pending_delete.insert(self.broker_message_id.clone());
        }
        self.counters.record_acked();
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        let visibility = clamp_nack_delay(delay_seconds.unwrap_or(0)) as i32;
        let result = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(visibility)
            .send()
            .await;

        if let Err(e) = result {
            warn!(
                queue_id = %self.queue_id,
                broker_message_id = %self.broker_message_id,
                error = %e,
                "NACK visibility change failed - broker timeout will redeliver"
            );
        }
        self.counters.record_nacked();
    }

    async fn extend(&self, seconds: u32) {
        let result = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(clamp_nack_delay(seconds) as i32)
            .send()
            .await;

        if let Err(e) = result {
            debug!(queue_id = %self.queue_id, error = %e, "Visibility extension failed");
        }
    }
}
