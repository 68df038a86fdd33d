//! Concurrency and rate limiting primitives for process pools.
//!
//! [`DynamicSemaphore`] is a counting semaphore whose permit ceiling can be
//! changed at runtime: raising it wakes waiters, lowering it is absorbed as
//! holders release, and permits already held always stay valid.
//!
//! [`LeakyBucket`] is a queue-backed rate limiter: a dispenser task releases
//! one waiter per interval so bursts are smoothed into evenly spaced calls,
//! and a bounded waiter queue turns overload into an immediate rejection
//! instead of unbounded waiting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

// ============================================================================
// DynamicSemaphore
// ============================================================================

struct SemaphoreState {
    limit: usize,
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct SemaphoreInner {
    state: Mutex<SemaphoreState>,
}

impl SemaphoreInner {
    fn release_one(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        Self::wake_waiters(&mut state);
    }

    /// Hand permits to waiters while below the ceiling. Skips waiters whose
    /// acquire future has been dropped.
    fn wake_waiters(state: &mut SemaphoreState) {
        while state.active < state.limit {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    if waiter.send(()).is_ok() {
                        state.active += 1;
                    }
                }
                None => break,
            }
        }
    }
}

/// A permit held against a [`DynamicSemaphore`]. Releases on drop.
pub struct SemaphorePermit {
    inner: Arc<SemaphoreInner>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.inner.release_one();
    }
}

pub struct DynamicSemaphore {
    inner: Arc<SemaphoreInner>,
}

impl DynamicSemaphore {
    pub fn new(limit: u32) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                state: Mutex::new(SemaphoreState {
                    limit: limit as usize,
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.active < state.limit {
                state.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = receiver {
            // A closed sender means the semaphore was dropped mid-wait;
            // treat it as a grant so shutdown never deadlocks a worker.
            let _ = rx.await;
        }

        SemaphorePermit {
            inner: self.inner.clone(),
        }
    }

    /// Change the permit ceiling in place. Raising it wakes up to
    /// `new_limit - active` waiters; lowering it lets the excess drain as
    /// current holders release.
    pub fn set_limit(&self, new_limit: u32) {
        let mut state = self.inner.state.lock();
        let old_limit = state.limit;
        state.limit = new_limit as usize;
        if state.limit > old_limit {
            SemaphoreInner::wake_waiters(&mut state);
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.state.lock().limit
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

// ============================================================================
// LeakyBucket
// ============================================================================

/// Why a leaky-bucket acquire did not yield a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// The waiter queue is full; the caller should fast-fail.
    QueueFull,
    /// The limiter was torn down (typically a config change); the caller
    /// should re-check the current limiter.
    Closed,
}

pub struct LeakyBucket {
    waiters: mpsc::Sender<oneshot::Sender<()>>,
    dispenser: JoinHandle<()>,
    rate_per_minute: u32,
}

impl LeakyBucket {
    /// `max_waiters` bounds the admission queue; one token is released
    /// every `60 / rate_per_minute` seconds.
    pub fn new(rate_per_minute: u32, max_waiters: usize) -> Self {
        let interval = Duration::from_secs_f64(60.0 / rate_per_minute.max(1) as f64);
        let (tx, mut rx) = mpsc::channel::<oneshot::Sender<()>>(max_waiters.max(1));

        let dispenser = tokio::spawn(async move {
            while let Some(waiter) = rx.recv().await {
                let _ = waiter.send(());
                tokio::time::sleep(interval).await;
            }
        });

        Self {
            waiters: tx,
            dispenser,
            rate_per_minute,
        }
    }

    pub fn rate_per_minute(&self) -> u32 {
        self.rate_per_minute
    }

    /// Wait for a token. Returns immediately with [`RateLimitError::QueueFull`]
    /// when the waiter queue is at capacity.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.try_send(tx).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RateLimitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RateLimitError::Closed,
        })?;

        rx.await.map_err(|_| RateLimitError::Closed)
    }

    /// Tear the limiter down, failing current waiters with
    /// [`RateLimitError::Closed`] so they re-check the replacement. Must be
    /// called on config changes: waiters hold clones of this bucket, so
    /// relying on `Drop` alone would leave them parked.
    pub fn close(&self) {
        self.dispenser.abort();
    }
}

impl Drop for LeakyBucket {
    fn drop(&mut self) {
        debug!(rate = self.rate_per_minute, "Tearing down leaky bucket");
        self.dispenser.abort();
    }
}
