//! Pipeline tracker and router: attaches ack/nack semantics to the pools
//! and defends against broker-level duplicates across redeliveries.
//!
//! Dedup happens on two keys. The pipeline key (the broker message id, or
//! the application id for the embedded queue) catches physical redeliveries
//! of a copy that is still being processed; the application message id
//! catches an externally requeued copy of a message that is already
//! completing under a different broker id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, warn};

use courier_broker::{BatchHandler, MessageCallback};
use courier_core::{
    PoolConfig, PoolStats, QueueMessage, WarningCategory, WarningSeverity,
    POOL_REJECT_NACK_DELAY_SECONDS,
};

use crate::mediator::Mediator;
use crate::pool::ProcessPool;
use crate::warning::WarningService;

/// Router-level record of one in-flight logical message.
#[derive(Clone)]
pub struct PipelineEntry {
    pub pipeline_key: String,
    pub message_id: String,
    pub broker_message_id: String,
    pub queue_id: String,
    pub pool_code: String,
    pub added_at: Instant,
    callback: Arc<dyn MessageCallback>,
    completed: Arc<AtomicBool>,
}

impl PipelineEntry {
    pub fn elapsed_seconds(&self) -> u64 {
        self.added_at.elapsed().as_secs()
    }
}

/// Terminal routing totals per source queue.
#[derive(Debug, Default)]
pub struct QueueRouteTotals {
    pub routed: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
}

pub struct MessageRouter {
    in_flight: Arc<DashMap<String, PipelineEntry>>,
    app_index: Arc<DashMap<String, String>>,
    pools: DashMap<String, Arc<ProcessPool>>,
    draining_pools: DashMap<String, Arc<ProcessPool>>,
    route_totals: Arc<DashMap<String, QueueRouteTotals>>,
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningService>,
}

impl MessageRouter {
    pub fn new(mediator: Arc<dyn Mediator>, warnings: Arc<WarningService>) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            app_index: Arc::new(DashMap::new()),
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            route_totals: Arc::new(DashMap::new()),
            mediator,
            warnings,
        }
    }

    // ------------------------------------------------------------------
    // Pool management (driven by the lifecycle coordinator)
    // ------------------------------------------------------------------

    pub fn insert_pool(&self, config: PoolConfig) -> Arc<ProcessPool> {
        let pool = Arc::new(
            ProcessPool::new(config.clone(), self.mediator.clone())
                .with_warning_service(self.warnings.clone()),
        );
        self.pools.insert(config.code.clone(), pool.clone());
        pool
    }

    pub fn pool(&self, code: &str) -> Option<Arc<ProcessPool>> {
        self.pools.get(code).map(|p| p.clone())
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn update_pool(&self, config: &PoolConfig) -> bool {
        match self.pools.get(&config.code) {
            Some(pool) => {
                pool.update_config(config);
                true
            }
            None => false,
        }
    }

    /// Move a pool out of rotation and let it drain; the janitor reaps it
    /// once empty.
    pub fn drain_pool(&self, code: &str) -> bool {
        match self.pools.remove(code) {
            Some((code, pool)) => {
                info!(pool_code = %code, queued = pool.queued_messages(), "Pool removed from config, draining");
                pool.drain();
                self.draining_pools.insert(code, pool);
                true
            }
            None => false,
        }
    }

    pub fn drain_all_pools(&self) {
        for entry in self.pools.iter() {
            entry.value().drain();
        }
    }

    pub fn all_pools_drained(&self) -> bool {
        self.pools.iter().all(|e| e.value().is_drained())
            && self.draining_pools.iter().all(|e| e.value().is_drained())
    }

    /// Reap fully drained pools. Called from the janitor loop.
    pub fn cleanup_draining_pools(&self) -> usize {
        let finished: Vec<String> = self
            .draining_pools
            .iter()
            .filter(|e| e.value().is_drained())
            .map(|e| e.key().clone())
            .collect();

        for code in &finished {
            if let Some((code, pool)) = self.draining_pools.remove(code) {
                info!(pool_code = %code, "Drained pool reaped");
                pool.shutdown();
            }
        }
        finished.len()
    }

    pub fn shutdown_pools(&self) {
        for entry in self.pools.iter() {
            entry.value().shutdown();
        }
        for entry in self.draining_pools.iter() {
            entry.value().shutdown();
        }
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().stats()).collect()
    }

    // ------------------------------------------------------------------
    // In-flight tracking
    // ------------------------------------------------------------------

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Oldest-first view of in-flight messages.
    pub fn in_flight_entries(&self, limit: usize) -> Vec<PipelineEntry> {
        let mut entries: Vec<PipelineEntry> =
            self.in_flight.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.added_at);
        entries.truncate(limit);
        entries
    }

    /// Extend broker visibility for messages processing longer than
    /// `threshold_seconds`. Keeps slow mediations from being redelivered
    /// mid-flight on brokers with ack deadlines.
    pub async fn extend_long_running(&self, threshold_seconds: u64, extension_seconds: u32) {
        let slow: Vec<PipelineEntry> = self
            .in_flight
            .iter()
            .filter(|e| e.value().elapsed_seconds() >= threshold_seconds)
            .map(|e| e.value().clone())
            .collect();

        for entry in slow {
            debug!(
                message_id = %entry.message_id,
                queue_id = %entry.queue_id,
                elapsed_seconds = entry.elapsed_seconds(),
                "Extending visibility for long-running message"
            );
            entry.callback.extend(extension_seconds).await;
        }
    }

    /// Nack everything still tracked. Used at forced shutdown so the broker
    /// redelivers instead of waiting out visibility timeouts.
    pub async fn nack_all_in_flight(&self) {
        let entries: Vec<PipelineEntry> = self
            .in_flight
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.in_flight.clear();
        self.app_index.clear();

        if entries.is_empty() {
            return;
        }
        warn!(count = entries.len(), "Nacking in-flight messages at shutdown");
        for entry in entries {
            if !entry.completed.swap(true, Ordering::SeqCst) {
                entry.callback.nack(None).await;
            }
        }
    }

    pub fn route_totals(&self, queue_id: &str) -> (u64, u64, u64) {
        match self.route_totals.get(queue_id) {
            Some(totals) => (
                totals.routed.load(Ordering::Relaxed),
                totals.acked.load(Ordering::Relaxed),
                totals.nacked.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0),
        }
    }

    fn record_routed(&self, queue_id: &str) {
        self.route_totals
            .entry(queue_id.to_string())
            .or_default()
            .routed
            .fetch_add(1, Ordering::Relaxed);
        counter!("courier_router_routed_total", "queue" => queue_id.to_string()).increment(1);
    }
}

#[async_trait]
impl BatchHandler for MessageRouter {
    async fn handle(
        &self,
        batch: Vec<QueueMessage>,
        callbacks: HashMap<String, Arc<dyn MessageCallback>>,
    ) -> courier_broker::Result<()> {
        for message in batch {
            let Some(callback) = callbacks.get(&message.broker_message_id).cloned() else {
                warn!(
                    message_id = %message.message_id,
                    broker_message_id = %message.broker_message_id,
                    "No callback for message, skipping"
                );
                continue;
            };

            let pipeline_key = message.broker_message_id.clone();

            // Physical redelivery: the same broker copy is still being
            // processed; push the new copy back.
            if self.in_flight.contains_key(&pipeline_key) {
                debug!(
                    message_id = %message.message_id,
                    pipeline_key = %pipeline_key,
                    "Physical redelivery while in flight, nacking new copy"
                );
                counter!("courier_router_duplicates_total", "kind" => "redelivery").increment(1);
                callback.nack(None).await;
                continue;
            }

            // External requeue: same logical message under a different
            // broker id. The original will reach its own verdict; this copy
            // is surplus.
            let requeued = self
                .app_index
                .get(&message.message_id)
                .map(|existing| *existing != pipeline_key)
                .unwrap_or(false);
            if requeued {
                info!(
                    message_id = %message.message_id,
                    broker_message_id = %message.broker_message_id,
                    "Requeued duplicate of an in-flight message, acking new copy"
                );
                counter!("courier_router_duplicates_total", "kind" => "requeue").increment(1);
                callback.ack().await;
                continue;
            }

            let completed = Arc::new(AtomicBool::new(false));
            let entry = PipelineEntry {
                pipeline_key: pipeline_key.clone(),
                message_id: message.message_id.clone(),
                broker_message_id: message.broker_message_id.clone(),
                queue_id: message.queue_id.clone(),
                pool_code: message.pointer.pool_code.clone(),
                added_at: Instant::now(),
                callback: callback.clone(),
                completed: completed.clone(),
            };
            self.in_flight.insert(pipeline_key.clone(), entry);
            self.app_index
                .insert(message.message_id.clone(), pipeline_key.clone());
            self.record_routed(&message.queue_id);

            let tracked: Arc<dyn MessageCallback> = Arc::new(TrackedCallback {
                inner: callback,
                completed,
                pipeline_key: pipeline_key.clone(),
                message_id: message.message_id.clone(),
                queue_id: message.queue_id.clone(),
                in_flight: self.in_flight.clone(),
                app_index: self.app_index.clone(),
                route_totals: self.route_totals.clone(),
            });

            let Some(pool) = self.pool(&message.pointer.pool_code) else {
                warn!(
                    message_id = %message.message_id,
                    pool_code = %message.pointer.pool_code,
                    "No pool for message, nacking"
                );
                self.warnings.add_warning(
                    WarningCategory::Routing,
                    WarningSeverity::Warn,
                    format!(
                        "Unknown pool [{}] for message {}",
                        message.pointer.pool_code, message.message_id
                    ),
                    "MessageRouter",
                );
                tracked.nack(None).await;
                continue;
            };

            let pool_code = message.pointer.pool_code.clone();
            if !pool.submit(message, tracked.clone()).await {
                debug!(pool_code = %pool_code, "Pool rejected submission, nacking short");
                tracked.nack(Some(POOL_REJECT_NACK_DELAY_SECONDS)).await;
            }
        }

        Ok(())
    }
}

/// Wraps the broker callback so a terminal ack/nack also clears pipeline
/// tracking, exactly once.
struct TrackedCallback {
    inner: Arc<dyn MessageCallback>,
    completed: Arc<AtomicBool>,
    pipeline_key: String,
    message_id: String,
    queue_id: String,
    in_flight: Arc<DashMap<String, PipelineEntry>>,
    app_index: Arc<DashMap<String, String>>,
    route_totals: Arc<DashMap<String, QueueRouteTotals>>,
}

impl TrackedCallback {
    /// Clear tracking before touching the broker so a slow or failing
    /// broker call can never make the message look stuck.
    fn untrack(&self) -> bool {
        self.in_flight.remove(&self.pipeline_key);
        self.app_index
            .remove_if(&self.message_id, |_, key| *key == self.pipeline_key);
        !self.completed.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageCallback for TrackedCallback {
    async fn ack(&self) {
        if !self.untrack() {
            return;
        }
        self.route_totals
            .entry(self.queue_id.clone())
            .or_default()
            .acked
            .fetch_add(1, Ordering::Relaxed);
        self.inner.ack().await;
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        if !self.untrack() {
            return;
        }
        self.route_totals
            .entry(self.queue_id.clone())
            .or_default()
            .nacked
            .fetch_add(1, Ordering::Relaxed);
        self.inner.nack(delay_seconds).await;
    }

    async fn extend(&self, seconds: u32) {
        self.inner.extend(seconds).await;
    }
}
