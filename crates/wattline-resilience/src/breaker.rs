//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-device circuit breaking for the acquisition loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use wattline_common::config::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum BreakerState {
    /// Reads proceed normally.
    Closed,
    /// Reads are suppressed until the cool-down elapses.
    Open,
    /// Cool-down elapsed; exactly one probe read is allowed.
    HalfOpen,
}

/// Decision returned by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPermit {
    /// The cycle may contact the device.
    Allowed,
    /// The cycle must be skipped without contacting the device.
    Skipped {
        /// Remaining cool-down at decision time; zero while a half-open
        /// probe is in flight.
        retry_in: Duration,
    },
}

#[derive(Debug)]
enum InnerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    state: InnerState,
}

/// Three-state circuit breaker for one device.
///
/// All transitions take the current [`Instant`] as a parameter so state
/// machine behavior is testable without sleeping.
#[derive(Debug)]
pub struct CircuitBreaker {
    device_id: i32,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Breaker starting Closed with a zero counter.
    pub fn new(device_id: i32, config: BreakerConfig) -> Self {
        Self {
            device_id,
            config,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                state: InnerState::Closed,
            }),
        }
    }

    /// Ask permission for one read cycle.
    ///
    /// An Open breaker whose cool-down has elapsed transitions to HalfOpen
    /// here and grants the single probe; a second caller during that probe
    /// is skipped.
    pub fn try_acquire(&self, now: Instant) -> ReadPermit {
        let mut inner = self.inner.lock();
        match inner.state {
            InnerState::Closed => ReadPermit::Allowed,
            InnerState::Open { since } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= self.config.cool_down() {
                    inner.state = InnerState::HalfOpen;
                    info!(device_id = self.device_id, "circuit breaker half-open; probing device");
                    ReadPermit::Allowed
                } else {
                    ReadPermit::Skipped {
                        retry_in: self.config.cool_down() - elapsed,
                    }
                }
            }
            InnerState::HalfOpen => ReadPermit::Skipped {
                retry_in: Duration::ZERO,
            },
        }
    }

    /// Record a successful cycle: counter to zero, breaker Closed.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, InnerState::Closed) {
            info!(device_id = self.device_id, "circuit breaker closed after successful read");
        }
        inner.consecutive_failures = 0;
        inner.state = InnerState::Closed;
    }

    /// Record a failed cycle and return the resulting state.
    pub fn record_failure(&self, now: Instant) -> BreakerState {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            InnerState::HalfOpen => {
                warn!(
                    device_id = self.device_id,
                    failures = inner.consecutive_failures,
                    "half-open probe failed; circuit breaker reopened"
                );
                inner.state = InnerState::Open { since: now };
            }
            InnerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    device_id = self.device_id,
                    failures = inner.consecutive_failures,
                    cool_down_ms = self.config.cool_down_ms,
                    "failure threshold reached; circuit breaker opened"
                );
                inner.state = InnerState::Open { since: now };
            }
            _ => {}
        }
        Self::observable(&inner.state)
    }

    /// Force the breaker Closed and zero the counter, from any state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.state = InnerState::Closed;
        info!(device_id = self.device_id, "circuit breaker manually reset");
    }

    /// Current observable state. An Open breaker past its cool-down reports
    /// HalfOpen so observers see what the next cycle will do.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        match inner.state {
            InnerState::Open { since }
                if Instant::now().saturating_duration_since(since) >= self.config.cool_down() =>
            {
                BreakerState::HalfOpen
            }
            ref state => Self::observable(state),
        }
    }

    /// Consecutive-failure counter.
    pub fn error_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn observable(state: &InnerState) -> BreakerState {
        match state {
            InnerState::Closed => BreakerState::Closed,
            InnerState::Open { .. } => BreakerState::Open,
            InnerState::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

/// Per-device breaker map with per-entry locking.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<i32, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Empty registry; breakers are created on first use per device.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for a device, created Closed on first access.
    pub fn handle(&self, device_id: i32) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(&device_id) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(device_id)
            .or_insert_with(|| {
                debug!(device_id, "registering circuit breaker");
                Arc::new(CircuitBreaker::new(device_id, self.config.clone()))
            })
            .clone()
    }

    /// Manual reset of one device's breaker, if it exists.
    pub fn reset(&self, device_id: i32) {
        if let Some(breaker) = self.breakers.read().get(&device_id) {
            breaker.reset();
        }
    }

    /// Observable state and counter per known device.
    pub fn states(&self) -> Vec<(i32, BreakerState, u32)> {
        let breakers = self.breakers.read();
        let mut states: Vec<(i32, BreakerState, u32)> = breakers
            .iter()
            .map(|(device_id, breaker)| (*device_id, breaker.state(), breaker.error_count()))
            .collect();
        states.sort_by_key(|(device_id, _, _)| *device_id);
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cool_down_ms: 10_000,
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(1, config());
        let now = Instant::now();

        assert_eq!(breaker.record_failure(now), BreakerState::Closed);
        assert_eq!(breaker.record_failure(now), BreakerState::Closed);
        assert_eq!(breaker.record_failure(now), BreakerState::Open);
        assert_eq!(breaker.error_count(), 3);
    }

    #[test]
    fn success_resets_the_counter_while_closed() {
        let breaker = CircuitBreaker::new(1, config());
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        assert_eq!(breaker.error_count(), 0);

        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.record_failure(now), BreakerState::Open);
    }

    #[test]
    fn open_skips_reads_until_the_cool_down_elapses() {
        let breaker = CircuitBreaker::new(1, config());
        let opened_at = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(opened_at);
        }

        let during = opened_at + Duration::from_secs(5);
        match breaker.try_acquire(during) {
            ReadPermit::Skipped { retry_in } => assert_eq!(retry_in, Duration::from_secs(5)),
            permit => panic!("expected skip, got {permit:?}"),
        }

        // Cool-down elapsed: exactly one probe is allowed, concurrent
        // callers are still skipped.
        let after = opened_at + Duration::from_secs(10);
        assert_eq!(breaker.try_acquire(after), ReadPermit::Allowed);
        assert_eq!(
            breaker.try_acquire(after),
            ReadPermit::Skipped {
                retry_in: Duration::ZERO
            }
        );
    }

    #[test]
    fn half_open_success_closes_and_zeroes_the_counter() {
        let breaker = CircuitBreaker::new(1, config());
        let opened_at = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(opened_at);
        }
        let after = opened_at + Duration::from_secs(10);
        assert_eq!(breaker.try_acquire(after), ReadPermit::Allowed);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.error_count(), 0);
        assert_eq!(breaker.try_acquire(after), ReadPermit::Allowed);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_the_cool_down() {
        let breaker = CircuitBreaker::new(1, config());
        let opened_at = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(opened_at);
        }
        let probe_at = opened_at + Duration::from_secs(10);
        assert_eq!(breaker.try_acquire(probe_at), ReadPermit::Allowed);
        assert_eq!(breaker.record_failure(probe_at), BreakerState::Open);

        // The window restarts from the failed probe, not the first opening.
        let partway = probe_at + Duration::from_secs(9);
        assert!(matches!(
            breaker.try_acquire(partway),
            ReadPermit::Skipped { .. }
        ));
        let elapsed = probe_at + Duration::from_secs(10);
        assert_eq!(breaker.try_acquire(elapsed), ReadPermit::Allowed);
    }

    #[test]
    fn manual_reset_forces_closed_from_any_state() {
        let breaker = CircuitBreaker::new(1, config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.error_count(), 0);
        assert_eq!(breaker.try_acquire(now), ReadPermit::Allowed);
    }

    #[test]
    fn registry_hands_out_one_breaker_per_device() {
        let registry = BreakerRegistry::new(config());
        let a = registry.handle(1);
        let b = registry.handle(1);
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure(Instant::now());
        let states = registry.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0], (1, BreakerState::Closed, 1));
    }
}
