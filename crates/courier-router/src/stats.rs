//! Rolling statistics for process pools.
//!
//! Keeps cumulative totals plus 5-minute and 30-minute windows for every
//! processing disposition, and a bounded ring of recent durations for a
//! running mean. Success rate excludes transient outcomes: a redelivery is
//! not a verdict.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use courier_core::WindowCounts;

/// How a message left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Failed,
    Transient,
    Deferred,
    RateLimited,
}

const SHORT_WINDOW: Duration = Duration::from_secs(300);
const LONG_WINDOW: Duration = Duration::from_secs(1800);
const DURATION_RING_SIZE: usize = 1000;

struct Sample {
    at: Instant,
    disposition: Disposition,
}

struct DurationRing {
    durations: VecDeque<u64>,
    sum: u64,
}

impl DurationRing {
    fn push(&mut self, duration_ms: u64) {
        if self.durations.len() == DURATION_RING_SIZE {
            if let Some(evicted) = self.durations.pop_front() {
                self.sum -= evicted;
            }
        }
        self.durations.push_back(duration_ms);
        self.sum += duration_ms;
    }

    fn mean(&self) -> f64 {
        if self.durations.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.durations.len() as f64
        }
    }
}

pub struct PoolStatsCollector {
    total_processed: AtomicU64,
    total_succeeded: AtomicU64,
    total_failed: AtomicU64,
    total_transient: AtomicU64,
    total_deferred: AtomicU64,
    total_rate_limited: AtomicU64,

    samples: Mutex<VecDeque<Sample>>,
    durations: Mutex<DurationRing>,
}

impl PoolStatsCollector {
    pub fn new() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            total_succeeded: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_transient: AtomicU64::new(0),
            total_deferred: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
            durations: Mutex::new(DurationRing {
                durations: VecDeque::with_capacity(DURATION_RING_SIZE),
                sum: 0,
            }),
        }
    }

    /// Record a terminal disposition for one message. `duration_ms` is the
    /// mediation time; rate-limited rejections carry none.
    pub fn record(&self, disposition: Disposition, duration_ms: Option<u64>) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        let counter = match disposition {
            Disposition::Succeeded => &self.total_succeeded,
            Disposition::Failed => &self.total_failed,
            Disposition::Transient => &self.total_transient,
            Disposition::Deferred => &self.total_deferred,
            Disposition::RateLimited => &self.total_rate_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        {
            let mut samples = self.samples.lock();
            let cutoff = now - LONG_WINDOW;
            while samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
                samples.pop_front();
            }
            samples.push_back(Sample {
                at: now,
                disposition,
            });
        }

        if let Some(duration) = duration_ms {
            self.durations.lock().push(duration);
        }
    }

    pub fn totals(&self) -> WindowCounts {
        WindowCounts {
            processed: self.total_processed.load(Ordering::Relaxed),
            succeeded: self.total_succeeded.load(Ordering::Relaxed),
            failed: self.total_failed.load(Ordering::Relaxed),
            transient: self.total_transient.load(Ordering::Relaxed),
            deferred: self.total_deferred.load(Ordering::Relaxed),
            rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn window(&self, window: Duration) -> WindowCounts {
        let cutoff = Instant::now() - window;
        let samples = self.samples.lock();

        let mut counts = WindowCounts::default();
        for sample in samples.iter().filter(|s| s.at >= cutoff) {
            counts.processed += 1;
            match sample.disposition {
                Disposition::Succeeded => counts.succeeded += 1,
                Disposition::Failed => counts.failed += 1,
                Disposition::Transient => counts.transient += 1,
                Disposition::Deferred => counts.deferred += 1,
                Disposition::RateLimited => counts.rate_limited += 1,
            }
        }
        counts
    }

    pub fn last_5_min(&self) -> WindowCounts {
        self.window(SHORT_WINDOW)
    }

    pub fn last_30_min(&self) -> WindowCounts {
        self.window(LONG_WINDOW)
    }

    pub fn mean_duration_ms(&self) -> f64 {
        self.durations.lock().mean()
    }

    pub fn reset(&self) {
        self.total_processed.store(0, Ordering::Relaxed);
        self.total_succeeded.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_transient.store(0, Ordering::Relaxed);
        self.total_deferred.store(0, Ordering::Relaxed);
        self.total_rate_limited.store(0, Ordering::Relaxed);
        self.samples.lock().clear();
        let mut durations = self.durations.lock();
        durations.durations.clear();
        durations.sum = 0;
    }
}

impl Default for PoolStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_track_each_disposition() {
        let stats = PoolStatsCollector::new();
        stats.record(Disposition::Succeeded, Some(10));
        stats.record(Disposition::Succeeded, Some(20));
        stats.record(Disposition::Failed, Some(30));
        stats.record(Disposition::Transient, Some(40));
        stats.record(Disposition::Deferred, Some(50));
        stats.record(Disposition::RateLimited, None);

        let totals = stats.totals();
        assert_eq!(totals.processed, 6);
        assert_eq!(totals.succeeded, 2);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.transient, 1);
        assert_eq!(totals.deferred, 1);
        assert_eq!(totals.rate_limited, 1);
    }

    #[test]
    fn success_rate_ignores_transient_and_deferred() {
        let stats = PoolStatsCollector::new();
        stats.record(Disposition::Succeeded, Some(10));
        stats.record(Disposition::Transient, Some(10));
        stats.record(Disposition::Transient, Some(10));
        stats.record(Disposition::Deferred, Some(10));

        assert_eq!(stats.totals().success_rate(), 1.0);

        stats.record(Disposition::Failed, Some(10));
        assert!((stats.totals().success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn recent_window_sees_fresh_samples() {
        let stats = PoolStatsCollector::new();
        stats.record(Disposition::Succeeded, Some(15));

        let recent = stats.last_5_min();
        assert_eq!(recent.processed, 1);
        assert_eq!(recent.succeeded, 1);
        assert_eq!(stats.last_30_min().processed, 1);
    }

    #[test]
    fn duration_ring_is_bounded_with_running_mean() {
        let stats = PoolStatsCollector::new();
        // Overfill the ring: the first 500 samples of 1000ms are evicted.
        for _ in 0..500 {
            stats.record(Disposition::Succeeded, Some(1000));
        }
        for _ in 0..1000 {
            stats.record(Disposition::Succeeded, Some(100));
        }

        assert!((stats.mean_duration_ms() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_clears_everything() {
        let stats = PoolStatsCollector::new();
        stats.record(Disposition::Failed, Some(10));
        stats.reset();

        assert_eq!(stats.totals().processed, 0);
        assert_eq!(stats.mean_duration_ms(), 0.0);
    }
}
