//! Injectable time source shared by the cache, expiry policy, and
//! concurrency driver.
//!
//! Production code reads the wall clock; tests substitute a [`ManualClock`]
//! so expiry and lease behaviour can be asserted deterministically without
//! sleeping.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the current time from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock whose value is set explicitly and only moves when told to.
///
/// Useful for asserting TTL/expiry/lease behaviour in tests without relying
/// on real sleeps.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a manual clock starting at `start`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advances the clock by `duration`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned by a prior panic.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += duration;
    }

    /// Sets the clock to an explicit instant.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned by a prior panic.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
