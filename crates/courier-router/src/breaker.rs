//! Per-target circuit breakers gating mediator calls.
//!
//! One breaker per downstream target (keyed by callback URL). CLOSED counts
//! consecutive failures and trips at the threshold; OPEN rejects until the
//! open interval elapses; HALF_OPEN admits a bounded number of probes and
//! either closes on enough consecutive successes or re-opens on the first
//! failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// Probes admitted in HALF_OPEN; the same count of consecutive
    /// successes closes the breaker.
    pub half_open_probe_count: u32,
    /// How long OPEN rejects before allowing probes.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            half_open_probe_count: 3,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Snapshot of one breaker for monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub target: String,
    pub state: BreakerState,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
}

struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_admitted: u32,
    half_open_successes: u32,
    open_until: Option<Instant>,
}

struct TargetBreaker {
    target: String,
    core: Mutex<BreakerCore>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    config: BreakerConfig,
}

impl TargetBreaker {
    fn new(target: String, config: BreakerConfig) -> Self {
        Self {
            target,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_admitted: 0,
                half_open_successes: 0,
                open_until: None,
            }),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            config,
        }
    }

    fn transition(&self, core: &mut BreakerCore, next: BreakerState) {
        if core.state == next {
            return;
        }
        debug!(target = %self.target, from = ?core.state, to = ?next, "Circuit breaker transition");
        counter!(
            "courier_breaker_transitions_total",
            "target" => self.target.clone(),
            "state" => format!("{next:?}")
        )
        .increment(1);
        core.state = next;
    }

    fn allow_request(&self) -> bool {
        let mut core = self.core.lock();

        match core.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = core
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if expired {
                    self.transition(&mut core, BreakerState::HalfOpen);
                    core.half_open_admitted = 1;
                    core.half_open_successes = 0;
                    true
                } else {
                    self.reject(&mut core)
                }
            }
            BreakerState::HalfOpen => {
                if core.half_open_admitted < self.config.half_open_probe_count {
                    core.half_open_admitted += 1;
                    true
                } else {
                    self.reject(&mut core)
                }
            }
        }
    }

    fn reject(&self, _core: &mut BreakerCore) -> bool {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        counter!("courier_breaker_rejected_total", "target" => self.target.clone()).increment(1);
        false
    }

    fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut core = self.core.lock();

        match core.state {
            BreakerState::Closed => {
                core.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                core.half_open_successes += 1;
                if core.half_open_successes >= self.config.half_open_probe_count {
                    info!(target = %self.target, "Circuit breaker closed after successful probes");
                    self.transition(&mut core, BreakerState::Closed);
                    core.consecutive_failures = 0;
                    core.half_open_admitted = 0;
                    core.half_open_successes = 0;
                    core.open_until = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut core = self.core.lock();

        match core.state {
            BreakerState::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        target = %self.target,
                        failures = core.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    self.transition(&mut core, BreakerState::Open);
                    core.open_until = Some(Instant::now() + self.config.open_duration);
                }
            }
            BreakerState::HalfOpen => {
                warn!(target = %self.target, "Circuit breaker re-opened by failed probe");
                self.transition(&mut core, BreakerState::Open);
                core.open_until = Some(Instant::now() + self.config.open_duration);
                core.half_open_admitted = 0;
                core.half_open_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn reset(&self) {
        let mut core = self.core.lock();
        info!(target = %self.target, "Circuit breaker manually reset");
        self.transition(&mut core, BreakerState::Closed);
        core.consecutive_failures = 0;
        core.half_open_admitted = 0;
        core.half_open_successes = 0;
        core.open_until = None;
    }

    fn stats(&self) -> BreakerStats {
        let core = self.core.lock();
        BreakerStats {
            target: self.target.clone(),
            state: core.state,
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            consecutive_failures: core.consecutive_failures,
        }
    }
}

/// Registry of breakers keyed by downstream target.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<TargetBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    fn breaker_for(&self, target: &str) -> Arc<TargetBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(TargetBreaker::new(target.to_string(), self.config.clone()))
            })
            .clone()
    }

    /// Check whether a call to `target` may proceed. A rejection is counted
    /// against the target.
    pub fn allow_request(&self, target: &str) -> bool {
        self.breaker_for(target).allow_request()
    }

    pub fn record_success(&self, target: &str) {
        self.breaker_for(target).record_success();
    }

    pub fn record_failure(&self, target: &str) {
        self.breaker_for(target).record_failure();
    }

    pub fn state(&self, target: &str) -> Option<BreakerState> {
        self.breakers.get(target).map(|b| b.core.lock().state)
    }

    pub fn stats(&self, target: &str) -> Option<BreakerStats> {
        self.breakers.get(target).map(|b| b.stats())
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|entry| entry.stats()).collect()
    }

    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get(target) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.core.lock().state == BreakerState::Open)
            .count()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
