//! Wall-clock stop time for dispatch.
//!
//! The deadline is checked before each cohort starts and before each batch is
//! accepted by a worker. It never interrupts a batch that is already running.
//! Once expiry has been observed it stays expired for the rest of the run,
//! even if the clock is stepped backwards.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deadline governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineState {
    Active,
    Expired,
}

/// Optional absolute stop time, shared by every component of a run.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    expired: Arc<AtomicBool>,
}

impl Deadline {
    /// Deadline measured against the system clock.
    pub fn new(at: Option<DateTime<Utc>>) -> Self {
        Self::with_clock(at, Arc::new(SystemClock))
    }

    /// Deadline measured against a custom clock.
    pub fn with_clock(at: Option<DateTime<Utc>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            at,
            clock,
            expired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A deadline that never expires.
    pub fn none() -> Self {
        Self::new(None)
    }

    /// The configured stop time, if any.
    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    /// Current state; latches to `Expired` the first time the stop time is reached.
    pub fn state(&self) -> DeadlineState {
        if self.expired.load(Ordering::Acquire) {
            return DeadlineState::Expired;
        }
        match self.at {
            Some(at) if self.clock.now() >= at => {
                self.expired.store(true, Ordering::Release);
                DeadlineState::Expired
            }
            _ => DeadlineState::Active,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.state() == DeadlineState::Expired
    }

    /// Time left before the stop time, if one is set and not yet reached.
    pub fn remaining(&self) -> Option<chrono::Duration> {
        let at = self.at?;
        let left = at - self.clock.now();
        (left > chrono::Duration::zero()).then_some(left)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at {
            Some(at) => write!(f, "{}", at.to_rfc3339()),
            None => write!(f, "none"),
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
