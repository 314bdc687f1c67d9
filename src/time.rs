//! Monotonic millisecond clock and periodic-tick helper.
//!
//! Grounded in the teacher's `flux-timing::Repeater` (interval + last-acted
//! instant, `fired()`/`force_fire()`/`reset()`), simplified to `std::time`
//! since this crate only needs millisecond resolution, not the teacher's
//! cycle-counter clock.

use std::time::{Duration, Instant};

/// Milliseconds since this process's monotonic clock epoch (process start).
///
/// Matches the data model's "last-state-change timestamp (monotonic
/// milliseconds)" and "next-wakeup time" fields.
pub type Millis = u64;

/// A fixed reference instant used to derive [`Millis`] values that are
/// comparable across the lifetime of a [`crate::node::Node`].
#[derive(Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    #[inline]
    pub fn now_ms(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires once every `interval`, tracked by comparing elapsed wall time
/// against the instant it last fired.
#[derive(Clone, Copy)]
pub struct Repeater {
    interval: Duration,
    last_fired: Instant,
}

impl Repeater {
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_fired: Instant::now() }
    }

    /// Returns true at most once per `interval`, resetting the window each
    /// time it fires.
    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.last_fired.elapsed() >= self.interval {
            self.last_fired = Instant::now();
            true
        } else {
            false
        }
    }

    /// Forces the next call to `fired()` to return true.
    pub fn force_fire(&mut self) {
        self.last_fired -= self.interval.max(Duration::from_nanos(1));
    }

    pub fn reset(&mut self) {
        self.last_fired = Instant::now();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
