//! Circuit breaker for connection-level executor failures.
//!
//! Counts consecutive batches that failed because the storage servers could
//! not be reached. Any batch that reached the server, whether it succeeded or
//! failed for an application reason, resets the count. Once the threshold is
//! hit the breaker stays open for the rest of the run and the dispatcher stops
//! handing out batches. There is no half-open state: retrying is left to the
//! next run.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Shared, lock-free trip counter.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: AtomicU32,
    open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Whether new batches may still be dispatched.
    pub fn can_dispatch(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// A batch reached the server.
    pub fn record_reachable(&self) {
        if !self.is_open() {
            self.consecutive.store(0, Ordering::Release);
        }
    }

    /// A batch failed to reach the server. Returns `true` if this call tripped
    /// the breaker.
    pub fn record_connection_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        count >= self.threshold && !self.open.swap(true, Ordering::AcqRel)
    }

    /// Consecutive connection failures seen so far.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_at_threshold() {
        let breaker = CircuitBreaker::new(3);
        assert!(!breaker.record_connection_failure());
        assert!(!breaker.record_connection_failure());
        assert!(breaker.can_dispatch());
        assert!(breaker.record_connection_failure());
        assert!(!breaker.can_dispatch());
    }

    #[test]
    fn test_reachable_resets_count() {
        let breaker = CircuitBreaker::new(2);
        breaker.record_connection_failure();
        breaker.record_reachable();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.record_connection_failure());
        assert!(breaker.can_dispatch());
    }

    #[test]
    fn test_trips_only_once() {
        let breaker = CircuitBreaker::new(1);
        assert!(breaker.record_connection_failure());
        assert!(!breaker.record_connection_failure());
        breaker.record_reachable();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let breaker = CircuitBreaker::new(0);
        assert_eq!(breaker.threshold(), 1);
    }
}
