//! Process pool: a concurrency and rate-limit domain selected by pool code.
//!
//! Each active message group gets a dedicated worker task draining a
//! two-tier queue (high priority ahead of regular, FIFO within a tier) with
//! at most one message of the group in flight. Mediator calls across groups
//! are gated by a resizable semaphore and an optional queue-backed rate
//! limiter. A transient failure poisons its `(batch, group)` pair: everything
//! later in that pair is nacked without touching the mediator, preserving
//! FIFO across the redelivery.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_broker::MessageCallback;
use courier_core::{
    clamp_nack_delay, MediationResult, PoolConfig, PoolStats, QueueMessage,
    WarningCategory, WarningSeverity, DEFAULT_NACK_DELAY_SECONDS, FAST_FAIL_NACK_DELAY_SECONDS,
};

use crate::limiter::{DynamicSemaphore, LeakyBucket, RateLimitError};
use crate::mediator::Mediator;
use crate::stats::{Disposition, PoolStatsCollector};
use crate::warning::WarningService;

const CAPACITY_MULTIPLIER: u32 = 20;
const MIN_CAPACITY: u32 = 50;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// The unit of transient-failure fast-fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub batch_id: Arc<str>,
    pub group_id: Arc<str>,
}

impl BatchGroupKey {
    pub fn new(batch_id: &str, group_id: &str) -> Self {
        Self {
            batch_id: Arc::from(batch_id),
            group_id: Arc::from(group_id),
        }
    }
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    Draining,
    Stopped,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Running,
            1 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolState::Running => 0,
            PoolState::Draining => 1,
            PoolState::Stopped => 2,
        }
    }
}

/// How connection errors count against the success rate. They nack for
/// redelivery either way; whether they land in the failed or the transient
/// bucket is deployment policy.
#[derive(Debug, Clone, Default)]
pub struct OutcomePolicy {
    pub connection_errors_are_transient: bool,
}

struct PoolTask {
    message: QueueMessage,
    callback: Arc<dyn MessageCallback>,
    key: BatchGroupKey,
}

/// Senders for one group worker, tagged with the worker generation so stale
/// entries can be removed without racing a replacement.
#[derive(Clone)]
struct GroupSender {
    worker_id: u64,
    high: mpsc::UnboundedSender<PoolTask>,
    regular: mpsc::UnboundedSender<PoolTask>,
}

/// Everything a group worker needs, shared across all workers of the pool.
struct WorkerShared {
    pool_code: Arc<str>,
    queued: AtomicU32,
    semaphore: DynamicSemaphore,
    mediator: Arc<dyn Mediator>,
    groups: DashMap<Arc<str>, GroupSender>,
    live_workers: DashSet<Arc<str>>,
    failed_batch_groups: DashSet<BatchGroupKey>,
    batch_group_counts: DashMap<BatchGroupKey, AtomicU32>,
    limiter: RwLock<Option<Arc<LeakyBucket>>>,
    stats: PoolStatsCollector,
    idle_timeout: Duration,
    policy: OutcomePolicy,
}

impl WorkerShared {
    /// Terminal bookkeeping for one dequeued message: release the queue
    /// slot, decrement the batch-group count, and purge the failure mark
    /// once the pair is fully accounted for.
    fn finish(&self, key: &BatchGroupKey) {
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let purge = match self.batch_group_counts.get(key) {
            Some(counter) => counter.fetch_sub(1, Ordering::SeqCst) <= 1,
            None => false,
        };
        // Guard dropped above; safe to mutate the maps.
        if purge {
            self.batch_group_counts.remove(key);
            self.failed_batch_groups.remove(key);
            debug!(pool_code = %self.pool_code, batch_group = %key, "Batch-group fully accounted, purged");
        }
    }

    fn mark_batch_group_failed(&self, key: &BatchGroupKey) {
        if self.failed_batch_groups.insert(key.clone()) {
            warn!(
                pool_code = %self.pool_code,
                batch_group = %key,
                "Batch-group marked failed - remaining messages will be fast-nacked"
            );
        }
    }
}

pub struct ProcessPool {
    code: String,
    concurrency: AtomicU32,
    max_capacity: u32,
    rate_limit_per_minute: RwLock<Option<u32>>,
    state: AtomicU8,
    worker_seq: AtomicU64,
    shared: Arc<WorkerShared>,
    warnings: Option<Arc<WarningService>>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, mediator: Arc<dyn Mediator>) -> Self {
        let concurrency = config.concurrency.max(1);
        let max_capacity = (concurrency * CAPACITY_MULTIPLIER).max(MIN_CAPACITY);

        let rate = config.rate_limit_per_minute.filter(|r| *r > 0);
        let limiter = rate.map(|r| Arc::new(LeakyBucket::new(r, max_capacity as usize)));

        info!(
            pool_code = %config.code,
            concurrency,
            max_capacity,
            rate_limit = ?rate,
            "Creating process pool"
        );

        Self {
            code: config.code.clone(),
            concurrency: AtomicU32::new(concurrency),
            max_capacity,
            rate_limit_per_minute: RwLock::new(rate),
            state: AtomicU8::new(PoolState::Running.as_u8()),
            worker_seq: AtomicU64::new(0),
            shared: Arc::new(WorkerShared {
                pool_code: Arc::from(config.code.as_str()),
                queued: AtomicU32::new(0),
                semaphore: DynamicSemaphore::new(concurrency),
                mediator,
                groups: DashMap::new(),
                live_workers: DashSet::new(),
                failed_batch_groups: DashSet::new(),
                batch_group_counts: DashMap::new(),
                limiter: RwLock::new(limiter),
                stats: PoolStatsCollector::new(),
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                policy: OutcomePolicy::default(),
            }),
            warnings: None,
        }
    }

    pub fn with_warning_service(mut self, warnings: Arc<WarningService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    /// Shrink the group idle timeout. Intended for tests exercising handler
    /// cleanup.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("idle timeout must be set before the pool is shared");
        shared.idle_timeout = idle_timeout;
        self
    }

    /// Override how connection errors are bucketed.
    pub fn with_outcome_policy(mut self, policy: OutcomePolicy) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("outcome policy must be set before the pool is shared");
        shared.policy = policy;
        self
    }

    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Admit a message. Returns `false`, with no side effects, when the pool
    /// is not running or the queue is at capacity; the caller keeps
    /// ownership of the ack/nack decision in that case.
    pub async fn submit(&self, message: QueueMessage, callback: Arc<dyn MessageCallback>) -> bool {
        if self.state() != PoolState::Running {
            return false;
        }

        let reserved = self
            .shared
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                if queued >= self.max_capacity {
                    None
                } else {
                    Some(queued + 1)
                }
            })
            .is_ok();
        if !reserved {
            debug!(
                pool_code = %self.code,
                capacity = self.max_capacity,
                "Pool at capacity, rejecting"
            );
            return false;
        }

        let group_id: Arc<str> = Arc::from(message.pointer.message_group_id.as_str());
        let key = BatchGroupKey {
            batch_id: Arc::from(message.batch_id.as_str()),
            group_id: group_id.clone(),
        };

        self.shared
            .batch_group_counts
            .entry(key.clone())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let high_priority = message.pointer.high_priority;
        let task = PoolTask {
            message,
            callback,
            key,
        };
        self.dispatch(group_id, high_priority, task).await;
        true
    }

    async fn dispatch(&self, group_id: Arc<str>, high_priority: bool, task: PoolTask) {
        let mut task = task;
        loop {
            let Some(sender) = self.group_sender(&group_id) else {
                // A retiring worker is still draining its last tasks; a
                // replacement may only start once it has fully exited, or
                // two workers could interleave the group.
                tokio::task::yield_now().await;
                continue;
            };

            let result = if high_priority {
                sender.high.send(task)
            } else {
                sender.regular.send(task)
            };
            match result {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The worker closed its queues between lookup and send.
                    // Drop the stale entry (generation-checked) and retry.
                    debug!(
                        pool_code = %self.code,
                        group_id = %group_id,
                        "Group worker retired mid-dispatch, retrying"
                    );
                    self.shared
                        .groups
                        .remove_if(&group_id, |_, s| s.worker_id == sender.worker_id);
                    task = returned;
                }
            }
        }
    }

    /// Resolve the senders for a group, spawning a worker when needed.
    /// Returns `None` while a previous worker for the group is still
    /// retiring.
    fn group_sender(&self, group_id: &Arc<str>) -> Option<GroupSender> {
        use dashmap::mapref::entry::Entry;

        if let Some(entry) = self.shared.groups.get(group_id) {
            if self.shared.live_workers.contains(group_id) {
                return Some(entry.clone());
            }
        }

        // The entry lock serializes creation so a group never gets two
        // concurrent workers.
        match self.shared.groups.entry(group_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.shared.live_workers.contains(group_id) {
                    return Some(occupied.get().clone());
                }
                warn!(
                    pool_code = %self.code,
                    group_id = %group_id,
                    "Group worker found dead - restarting"
                );
                if let Some(ref warnings) = self.warnings {
                    warnings.add_warning(
                        WarningCategory::PoolHealth,
                        WarningSeverity::Warn,
                        format!("Worker for group [{group_id}] in pool [{}] restarted", self.code),
                        format!("ProcessPool:{}", self.code),
                    );
                }
                let sender = self.spawn_worker(group_id);
                occupied.insert(sender.clone());
                Some(sender)
            }
            Entry::Vacant(vacant) => {
                if self.shared.live_workers.contains(group_id) {
                    // Retiring worker: entry already gone, exit pending.
                    return None;
                }
                let sender = self.spawn_worker(group_id);
                vacant.insert(sender.clone());
                Some(sender)
            }
        }
    }

    fn spawn_worker(&self, group_id: &Arc<str>) -> GroupSender {
        let worker_id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (regular_tx, regular_rx) = mpsc::unbounded_channel();
        let sender = GroupSender {
            worker_id,
            high: high_tx,
            regular: regular_tx,
        };

        self.shared.live_workers.insert(group_id.clone());
        let shared = self.shared.clone();
        let group_id = group_id.clone();
        tokio::spawn(async move {
            run_group_worker(shared, group_id, worker_id, high_rx, regular_rx).await;
        });

        sender
    }

    /// Stop accepting new submissions; in-flight and queued work drains.
    pub fn drain(&self) {
        info!(pool_code = %self.code, "Draining pool");
        self.state
            .store(PoolState::Draining.as_u8(), Ordering::SeqCst);
    }

    pub fn is_drained(&self) -> bool {
        self.shared.queued.load(Ordering::SeqCst) == 0
            && self.shared.semaphore.active_count() == 0
    }

    /// Hard stop: clears group workers and tracking state. Anything still
    /// queued is abandoned here and nacked by the router's in-flight sweep.
    pub fn shutdown(&self) {
        info!(pool_code = %self.code, "Shutting down pool");
        self.state.store(PoolState::Stopped.as_u8(), Ordering::SeqCst);
        if let Some(limiter) = self.shared.limiter.write().take() {
            limiter.close();
        }
        self.shared.groups.clear();
        self.shared.failed_batch_groups.clear();
        self.shared.batch_group_counts.clear();
    }

    /// Apply a runtime configuration change in place. Concurrency resizes
    /// the semaphore ceiling; a rate change rebuilds (or removes) the
    /// leaky bucket. `max_capacity` is fixed at construction.
    pub fn update_config(&self, config: &PoolConfig) {
        let new_concurrency = config.concurrency;
        let old_concurrency = self.concurrency.load(Ordering::SeqCst);
        if new_concurrency != old_concurrency {
            if new_concurrency == 0 {
                warn!(pool_code = %self.code, "Ignoring invalid concurrency of 0");
            } else {
                self.shared.semaphore.set_limit(new_concurrency);
                self.concurrency.store(new_concurrency, Ordering::SeqCst);
                info!(
                    pool_code = %self.code,
                    old = old_concurrency,
                    new = new_concurrency,
                    "Pool concurrency updated in place"
                );
            }
        }

        let new_rate = config.rate_limit_per_minute.filter(|r| *r > 0);
        let mut current_rate = self.rate_limit_per_minute.write();
        if *current_rate != new_rate {
            let new_limiter =
                new_rate.map(|r| Arc::new(LeakyBucket::new(r, self.max_capacity as usize)));
            let old_limiter = {
                let mut limiter = self.shared.limiter.write();
                std::mem::replace(&mut *limiter, new_limiter)
            };
            if let Some(old) = old_limiter {
                // Fail current waiters over to the replacement.
                old.close();
            }
            info!(
                pool_code = %self.code,
                old = ?*current_rate,
                new = ?new_rate,
                "Pool rate limit rebuilt"
            );
            *current_rate = new_rate;
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::SeqCst)
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        *self.rate_limit_per_minute.read()
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    pub fn queued_messages(&self) -> u32 {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.shared.semaphore.active_count() as u32
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.code.clone(),
            concurrency: self.concurrency(),
            active_workers: self.active_workers(),
            queued_messages: self.queued_messages(),
            max_capacity: self.max_capacity,
            message_group_count: self.shared.groups.len() as u32,
            rate_limit_per_minute: self.rate_limit_per_minute(),
            totals: self.shared.stats.totals(),
            last_5_min: self.shared.stats.last_5_min(),
            last_30_min: self.shared.stats.last_30_min(),
            mean_duration_ms: self.shared.stats.mean_duration_ms(),
        }
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }
}

/// Removes a worker's registrations when it exits, normally or by panic.
/// A replacement worker is only spawned after the live flag is gone, which
/// keeps per-group processing strictly serial across the handover.
struct WorkerGuard {
    shared: Arc<WorkerShared>,
    group_id: Arc<str>,
    worker_id: u64,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.shared
            .groups
            .remove_if(&self.group_id, |_, s| s.worker_id == self.worker_id);
        self.shared.live_workers.remove(&self.group_id);
        debug!(
            pool_code = %self.shared.pool_code,
            group_id = %self.group_id,
            "Group worker exited"
        );
    }
}

/// Serial drain loop for one message group. High-priority tasks are always
/// taken ahead of regular ones; the worker retires itself after the idle
/// timeout with both queues empty.
async fn run_group_worker(
    shared: Arc<WorkerShared>,
    group_id: Arc<str>,
    worker_id: u64,
    mut high_rx: mpsc::UnboundedReceiver<PoolTask>,
    mut regular_rx: mpsc::UnboundedReceiver<PoolTask>,
) {
    debug!(pool_code = %shared.pool_code, group_id = %group_id, "Group worker started");
    let _guard = WorkerGuard {
        shared: shared.clone(),
        group_id: group_id.clone(),
        worker_id,
    };

    loop {
        let next = tokio::time::timeout(shared.idle_timeout, async {
            tokio::select! {
                biased;
                task = high_rx.recv() => task,
                task = regular_rx.recv() => task,
            }
        })
        .await;

        match next {
            Ok(Some(task)) => process_task(&shared, task).await,
            Ok(None) => {
                // Senders dropped (pool shutdown). Drain what is already
                // buffered, then exit.
                drain_remaining(&shared, &mut high_rx, &mut regular_rx).await;
                break;
            }
            Err(_) => {
                if !high_rx.is_empty() || !regular_rx.is_empty() {
                    continue;
                }
                debug!(
                    pool_code = %shared.pool_code,
                    group_id = %group_id,
                    "Group worker idle, retiring"
                );
                // Refuse new sends first, then sweep up anything that raced
                // in before the close. Dispatchers whose send fails wait for
                // this worker's guard before starting a replacement.
                high_rx.close();
                regular_rx.close();
                drain_remaining(&shared, &mut high_rx, &mut regular_rx).await;
                break;
            }
        }
    }
}

async fn drain_remaining(
    shared: &Arc<WorkerShared>,
    high_rx: &mut mpsc::UnboundedReceiver<PoolTask>,
    regular_rx: &mut mpsc::UnboundedReceiver<PoolTask>,
) {
    while let Ok(task) = high_rx.try_recv() {
        process_task(shared, task).await;
    }
    while let Ok(task) = regular_rx.try_recv() {
        process_task(shared, task).await;
    }
}

async fn process_task(shared: &Arc<WorkerShared>, task: PoolTask) {
    let PoolTask {
        message,
        callback,
        key,
    } = task;

    // The failure mark is observed after dequeue so messages queued before
    // the first failure are still fast-nacked.
    if shared.failed_batch_groups.contains(&key) {
        debug!(
            pool_code = %shared.pool_code,
            message_id = %message.message_id,
            batch_group = %key,
            "Fast-nacking message behind a failed batch-group"
        );
        callback.nack(Some(FAST_FAIL_NACK_DELAY_SECONDS)).await;
        shared.finish(&key);
        return;
    }

    // Rate limit. A torn-down bucket means the config changed mid-wait;
    // re-read and try the replacement.
    loop {
        let limiter = shared.limiter.read().clone();
        let Some(bucket) = limiter else { break };
        match bucket.acquire().await {
            Ok(()) => break,
            Err(RateLimitError::QueueFull) => {
                debug!(
                    pool_code = %shared.pool_code,
                    message_id = %message.message_id,
                    "Rate limiter saturated, fast-nacking"
                );
                shared.stats.record(Disposition::RateLimited, None);
                callback.nack(Some(FAST_FAIL_NACK_DELAY_SECONDS)).await;
                shared.finish(&key);
                return;
            }
            Err(RateLimitError::Closed) => continue,
        }
    }

    let permit = shared.semaphore.acquire().await;

    let started = Instant::now();
    let outcome = shared.mediator.process(&message).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let delay = clamp_nack_delay(outcome.delay_seconds.unwrap_or(DEFAULT_NACK_DELAY_SECONDS));

    match outcome.result {
        MediationResult::Success => {
            debug!(
                pool_code = %shared.pool_code,
                message_id = %message.message_id,
                duration_ms,
                "Message processed"
            );
            shared.stats.record(Disposition::Succeeded, Some(duration_ms));
            callback.ack().await;
        }
        MediationResult::ErrorConfig => {
            warn!(
                pool_code = %shared.pool_code,
                message_id = %message.message_id,
                status_code = ?outcome.status_code,
                "Permanent error, acking to stop the poison loop"
            );
            shared.stats.record(Disposition::Failed, Some(duration_ms));
            callback.ack().await;
        }
        MediationResult::Deferred => {
            debug!(
                pool_code = %shared.pool_code,
                message_id = %message.message_id,
                delay_seconds = delay,
                "Downstream deferred, nacking"
            );
            shared.stats.record(Disposition::Deferred, Some(duration_ms));
            shared.mark_batch_group_failed(&key);
            callback.nack(Some(delay)).await;
        }
        MediationResult::ErrorProcess => {
            warn!(
                pool_code = %shared.pool_code,
                message_id = %message.message_id,
                error = ?outcome.error_message,
                circuit_open = outcome.circuit_open,
                "Transient error, nacking for redelivery"
            );
            shared.stats.record(Disposition::Transient, Some(duration_ms));
            shared.mark_batch_group_failed(&key);
            callback.nack(Some(delay)).await;
        }
        MediationResult::ErrorConnection => {
            warn!(
                pool_code = %shared.pool_code,
                message_id = %message.message_id,
                error = ?outcome.error_message,
                "Connection error, nacking for redelivery"
            );
            let disposition = if shared.policy.connection_errors_are_transient {
                Disposition::Transient
            } else {
                Disposition::Failed
            };
            shared.stats.record(disposition, Some(duration_ms));
            shared.mark_batch_group_failed(&key);
            callback.nack(Some(delay)).await;
        }
    }

    shared.finish(&key);
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_group_key_display_joins_parts() {
        let key = BatchGroupKey::new("batch-1", "group-a");
        assert_eq!(key.to_string(), "batch-1:group-a");
    }

    #[test]
    fn capacity_has_a_floor_of_fifty() {
        assert_eq!((1u32 * CAPACITY_MULTIPLIER).max(MIN_CAPACITY), 50);
        assert_eq!((10u32 * CAPACITY_MULTIPLIER).max(MIN_CAPACITY), 200);
    }
}
