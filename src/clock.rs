//! Clock sources for span timing
//!
//! All values are microseconds. The system clock is anchored at the UNIX epoch
//! and is used for span/transaction timestamps; the monotonic clock has an
//! arbitrary origin and is used for durations and self-time accounting.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of the current time, in microseconds
pub trait Clock {
    /// Wall-clock time in microseconds since UNIX epoch
    fn system_clock_current_time(&self) -> f64;

    /// Monotonic time in microseconds since an unspecified starting point
    fn monotonic_clock_current_time(&self) -> f64;
}

/// Real clock backed by `SystemTime` and `Instant`
///
/// Neither source is allowed to go backwards: when the OS reports an earlier
/// time than the last one observed, the last value is returned instead.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    last_system_time: Cell<Option<f64>>,
    last_monotonic_time: Cell<Option<f64>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_system_time: Cell::new(None),
            last_monotonic_time: Cell::new(None),
        }
    }

    fn check_against_last(source: &'static str, current: f64, last: &Cell<Option<f64>>) -> f64 {
        if let Some(last_value) = last.get() {
            if current < last_value {
                tracing::debug!(
                    source,
                    last = last_value,
                    current,
                    "Clock jumped backwards, returning the later time instead"
                );
                return last_value;
            }
        }
        last.set(Some(current));
        current
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn system_clock_current_time(&self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as f64;
        Self::check_against_last("system", now, &self.last_system_time)
    }

    fn monotonic_clock_current_time(&self) -> f64 {
        let now = self.origin.elapsed().as_micros() as f64;
        Self::check_against_last("monotonic", now, &self.last_monotonic_time)
    }
}

/// Manually driven clock for tests and scenario replay
///
/// Clones share the same underlying time, so a test can keep one handle and
/// advance it while the tracer owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    system_time: Rc<Cell<f64>>,
    monotonic_time: Rc<Cell<f64>>,
}

impl ManualClock {
    /// Create a clock whose system time starts at `system_time_us` and whose
    /// monotonic time starts at 0
    pub fn starting_at(system_time_us: f64) -> Self {
        let clock = Self::default();
        clock.system_time.set(system_time_us);
        clock
    }

    /// Move both clocks forward by `delta_us`
    pub fn advance(&self, delta_us: f64) {
        self.system_time.set(self.system_time.get() + delta_us);
        self.monotonic_time.set(self.monotonic_time.get() + delta_us);
    }

    /// Set the monotonic clock to `monotonic_us`, moving the system clock by
    /// the same amount
    pub fn set_monotonic(&self, monotonic_us: f64) {
        let delta = monotonic_us - self.monotonic_time.get();
        self.advance(delta);
    }
}

impl Clock for ManualClock {
    fn system_clock_current_time(&self) -> f64 {
        self.system_time.get()
    }

    fn monotonic_clock_current_time(&self) -> f64 {
        self.monotonic_time.get()
    }
}

/// Duration of a segment, preferring whichever clock measured the longer span
///
/// Negative results (clock skew) are clamped to zero.
pub fn calc_duration_in_microseconds(
    system_begin: f64,
    monotonic_begin: f64,
    system_end: f64,
    monotonic_end: f64,
) -> f64 {
    let system_duration = clamp_non_negative(system_end - system_begin);
    let monotonic_duration = clamp_non_negative(monotonic_end - monotonic_begin);
    if monotonic_duration >= system_duration {
        monotonic_duration
    } else {
        tracing::trace!(
            system_duration,
            monotonic_duration,
            "Using system clock duration because it is larger"
        );
        system_duration
    }
}

/// Clamp a computed duration to `>= 0`, mapping NaN to 0 as well
pub fn clamp_non_negative(duration: f64) -> f64 {
    if duration > 0.0 {
        duration
    } else {
        0.0
    }
}

pub fn microseconds_to_milliseconds(value: f64) -> f64 {
    value / 1000.0
}
