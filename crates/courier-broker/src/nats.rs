//! NATS JetStream consumer.
//!
//! Uses a durable pull consumer with explicit acks. Nack maps to a NAK with
//! the requested redelivery delay; `extend` sends an in-progress ack so a
//! long mediation does not trip the ack-wait. `receive_count` comes from the
//! server's delivery counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{AckKind, Context};
use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::{clamp_nack_delay, ConsumerHealth, QueueMetrics, DEFAULT_POOL_EXTERNAL};

use crate::{
    now_ms, pacing_delay, prepare_batch, BatchHandler, BrokerConsumer, BrokerError,
    MessageCallback, QueueCounters, RawFrame, SLOW_POLL_WARN,
};

#[derive(Debug, Clone)]
pub struct NatsConsumerConfig {
    pub stream_name: String,
    pub subject: String,
    pub durable_name: String,
    pub queue_id: String,
    pub connections: u32,
    pub max_messages: usize,
    /// Fetch expiry; plays the role of a long-poll wait.
    pub fetch_timeout: Duration,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl Default for NatsConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: "COURIER".to_string(),
            subject: "courier.messages".to_string(),
            durable_name: "courier-router".to_string(),
            queue_id: "courier-jetstream".to_string(),
            connections: 1,
            max_messages: 10,
            fetch_timeout: Duration::from_secs(5),
            ack_wait: Duration::from_secs(120),
            max_deliver: -1,
        }
    }
}

pub struct NatsConsumer {
    jetstream: Context,
    config: NatsConsumerConfig,
    handler: Arc<dyn BatchHandler>,
    running: Arc<AtomicBool>,
    last_poll_ms: Arc<AtomicI64>,
    pending_delete: Arc<DashSet<String>>,
    counters: Arc<QueueCounters>,
    pending_depth: Arc<AtomicU64>,
    in_flight_depth: Arc<AtomicU64>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NatsConsumer {
    pub fn new(jetstream: Context, config: NatsConsumerConfig, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            jetstream,
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

    /// Create the stream and durable consumer if they do not exist yet.
    pub async fn ensure_stream(&self) -> crate::Result<()> {
        if self.jetstream.get_stream(&self.config.stream_name).await.is_err() {
            info!(
                stream = %self.config.stream_name,
                subject = %self.config.subject,
                "Creating JetStream stream"
            );
            self.jetstream
                .create_stream(StreamConfig {
                    name: self.config.stream_name.clone(),
                    subjects: vec![self.config.subject.clone()],
                    ..Default::default()
                })
                .await
                .map_err(|e| BrokerError::Nats(e.to_string()))?;
        }
        Ok(())
    }

    async fn pull_consumer(
        &self,
    ) -> crate::Result<async_nats::jetstream::consumer::Consumer<PullConfig>> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;

        match stream
            .get_consumer::<PullConfig>(&self.config.durable_name)
            .await
        {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                info!(
                    consumer = %self.config.durable_name,
                    stream = %self.config.stream_name,
                    "Creating JetStream pull consumer"
                );
                stream
                    .create_consumer(PullConfig {
                        durable_name: Some(self.config.durable_name.clone()),
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: self.config.ack_wait,
                        max_deliver: self.config.max_deliver,
                        filter_subject: self.config.subject.clone(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BrokerError::Nats(e.to_string()))
            }
        }
    }

    async fn poll_once(&self) -> crate::Result<usize> {
        let consumer = self.pull_consumer().await?;

        let mut stream = consumer
            .fetch()
            .max_messages(self.config.max_messages)
            .expires(self.config.fetch_timeout)
            .messages()
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;

        let mut frames = Vec::new();
        let mut raw_messages: HashMap<String, async_nats::jetstream::Message> = HashMap::new();

        while let Some(next) = stream.next().await {
            let message = match next {
                Ok(m) => m,
                Err(e) => {
                    warn!(queue_id = %self.config.queue_id, error = %e, "JetStream message error");
                    continue;
                }
            };

            let (sequence, delivered) = match message.info() {
                Ok(info) => (info.stream_sequence, info.delivered as u32),
                Err(e) => {
                    warn!(queue_id = %self.config.queue_id, error = %e, "Missing JetStream metadata");
                    (0, 1)
                }
            };

            let broker_message_id = format!("{}-{}", self.config.stream_name, sequence);
            frames.push(RawFrame {
                broker_message_id: broker_message_id.clone(),
                receipt_handle: broker_message_id.clone(),
                body: String::from_utf8_lossy(&message.payload).to_string(),
                receive_count: delivered.max(1),
            });
            raw_messages.insert(broker_message_id, message);
        }

        let received = frames.len();
        self.counters.record_polled(received);

        let prepared = prepare_batch(
            &self.config.queue_id,
            DEFAULT_POOL_EXTERNAL,
            frames,
            &self.pending_delete,
        );

        for dropped in &prepared.drops {
            if let Some(message) = raw_messages.remove(&dropped.broker_message_id) {
                debug!(
                    queue_id = %self.config.queue_id,
                    broker_message_id = %dropped.broker_message_id,
                    reason = ?dropped.reason,
                    "Acking dropped JetStream frame"
                );
                if let Err(e) = message.ack().await {
                    warn!(queue_id = %self.config.queue_id, error = %e, "Failed to ack dropped frame");
                }
            }
        }

        if !prepared.messages.is_empty() {
            let mut callbacks: HashMap<String, Arc<dyn MessageCallback>> = HashMap::new();
            for msg in &prepared.messages {
                if let Some(message) = raw_messages.remove(&msg.broker_message_id) {
                    callbacks.insert(
                        msg.broker_message_id.clone(),
                        Arc::new(NatsCallback {
                            queue_id: self.config.queue_id.clone(),
                            message,
                            counters: self.counters.clone(),
                        }),
                    );
                }
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

    async fn run_poller(self: Arc<Self>, poller: u32) {
        info!(queue_id = %self.config.queue_id, poller = poller, "JetStream poller started");

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
                    if let Some(delay) = pacing_delay(received, self.config.max_messages) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!(queue_id = %self.config.queue_id, error = %e, "JetStream poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(queue_id = %self.config.queue_id, poller = poller, "JetStream poller exited");
    }

    async fn run_metrics_updater(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            match self.jetstream.get_stream(&self.config.stream_name).await {
                Ok(mut stream) => {
                    if let Ok(info) = stream.info().await {
                        self.pending_depth
                            .store(info.state.messages, Ordering::Relaxed);
                    }
                    if let Ok(consumer) = stream
                        .get_consumer::<PullConfig>(&self.config.durable_name)
                        .await
                    {
                        let ack_pending = consumer.cached_info().num_ack_pending as u64;
                        self.in_flight_depth.store(ack_pending, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    debug!(queue_id = %self.config.queue_id, error = %e, "Failed to read stream info");
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConsumer for NatsConsumer {
    fn queue_id(&self) -> &str {
        &self.config.queue_id
    }

    async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.ensure_stream().await {
            error!(queue_id = %self.config.queue_id, error = %e, "Stream setup failed");
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
            "JetStream consumer started"
        );
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!(queue_id = %self.config.queue_id, "JetStream consumer stopped");
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

struct NatsCallback {
    queue_id: String,
    message: async_nats::jetstream::Message,
    counters: Arc<QueueCounters>,
}

#[async_trait]
impl MessageCallback for NatsCallback {
    async fn ack(&self) {
        if let Err(e) = self.message.ack().await {
            warn!(queue_id = %self.queue_id, error = %e, "JetStream ack failed");
        }
        self.counters.record_acked();
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        let delay = delay_seconds
            .map(|d| Duration::from_secs(clamp_nack_delay(d) as u64));
        if let Err(e) = self.message.ack_with(AckKind::Nak(delay)).await {
            warn!(queue_id = %self.queue_id, error = %e, "JetStream nak failed");
        }
        self.counters.record_nacked();
    }

    async fn extend(&self, _seconds: u32) {
        // JetStream resets the ack-wait clock on an in-progress ack; the
        // requested extension length is not expressible.
        if let Err(e) = self.message.ack_with(AckKind::Progress).await {
            debug!(queue_id = %self.queue_id, error = %e, "JetStream progress ack failed");
        }
    }
}
