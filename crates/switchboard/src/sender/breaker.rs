//! Per-connection circuit breaker.
//!
//! closed -> open after `trip_after` consecutive transient send failures;
//! open -> half-open once the cool-down elapses; the first send in
//! half-open decides the next state. Atomic fields allow lock-free reads
//! from liveness checks while the sender's worker pool remains the only
//! writer.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    trip_after: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(trip_after: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            trip_after,
            cooldown,
        }
    }

    /// Current state without side effects. An elapsed cool-down reads as
    /// half-open but the transition itself is deferred to [`Self::acquire`]
    /// so only the worker pool mutates state.
    pub fn current_state(&self) -> CircuitState {
        let state = CircuitState::from_u8(self.state.load(Ordering::Relaxed));
        if state == CircuitState::Open && self.cooldown_elapsed() {
            CircuitState::HalfOpen
        } else {
            state
        }
    }

    /// Whether a send may proceed. Transitions open -> half-open when the
    /// cool-down has elapsed. Worker-pool only.
    pub fn acquire(&self) -> bool {
        match CircuitState::from_u8(self.state.load(Ordering::Relaxed)) {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.cooldown_elapsed() {
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Successful send: reset to closed.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
        *self.opened_at.lock().unwrap() = None;
    }

    /// Transient failure after retries. Returns true when this failure
    /// tripped the breaker open.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let state = CircuitState::from_u8(self.state.load(Ordering::Relaxed));

        // A half-open probe that fails re-opens immediately.
        let should_open = state == CircuitState::HalfOpen || failures >= self.trip_after;
        if should_open && state != CircuitState::Open {
            self.state.store(CircuitState::Open as u8, Ordering::Relaxed);
            *self.opened_at.lock().unwrap() = Some(Instant::now());
            return true;
        }
        false
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn cooldown_elapsed(&self) -> bool {
        self.opened_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed() >= self.cooldown)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(3, cooldown)
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let breaker = breaker(Duration::from_secs(30));
        assert!(breaker.acquire());

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());

        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(!breaker.acquire());
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = breaker(Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn cooldown_moves_to_half_open() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.acquire());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        assert!(breaker.acquire());

        // Successful probe closes the breaker.
        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn failed_half_open_probe_reopens() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.acquire());

        assert!(breaker.record_failure());
        assert!(!breaker.acquire());
    }
}
