//! Self-time tracking for breakdown metrics
//!
//! Every open execution segment (transaction or span) owns one
//! [`SelfTimeTracker`]. The tracker accumulates the wall-clock time during
//! which the segment had no running children: time spent inside a child is
//! attributed to the child's own tracker instead.
//!
//! ```text
//!   TIMING ──on_child_begin (0→1)──▶ SUSPENDED
//!     ▲                                 │
//!     └──────on_child_end (1→0)─────────┘
//! ```
//!
//! All timestamps are monotonic-clock microseconds.

use crate::clock::clamp_non_negative;

/// Whether the self-time clock is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No child is running, elapsed time counts as self time
    Timing,
    /// At least one child is running, elapsed time belongs to the children
    Suspended,
}

/// Timer state machine computing exclusive (self) time of one segment
#[derive(Debug, Clone)]
pub struct SelfTimeTracker {
    segment_start: f64,
    running_children_count: u32,
    accumulated_self_time_us: f64,
    has_ended: bool,
}

impl SelfTimeTracker {
    /// Start tracking; the first self-time segment begins at `now`
    pub fn new(now: f64) -> Self {
        Self {
            segment_start: now,
            running_children_count: 0,
            accumulated_self_time_us: 0.0,
            has_ended: false,
        }
    }

    pub fn state(&self) -> TimerState {
        if self.running_children_count == 0 {
            TimerState::Timing
        } else {
            TimerState::Suspended
        }
    }

    pub fn running_children_count(&self) -> u32 {
        self.running_children_count
    }

    pub fn has_ended(&self) -> bool {
        self.has_ended
    }

    /// A child segment started at `now`
    ///
    /// Only the first concurrently running child stops the timer; further
    /// overlapping children just bump the count.
    pub fn on_child_begin(&mut self, now: f64) {
        debug_assert!(!self.has_ended, "on_child_begin called after end");
        if self.has_ended {
            tracing::warn!(now, "SelfTimeTracker::on_child_begin called after end - ignored");
            return;
        }

        if self.running_children_count == 0 {
            self.stop_timer(now);
        }
        self.running_children_count += 1;
    }

    /// A child segment ended at `now`
    ///
    /// When the last running child ends a new self-time segment starts at `now`.
    pub fn on_child_end(&mut self, now: f64) {
        debug_assert!(!self.has_ended, "on_child_end called after end");
        if self.has_ended {
            tracing::warn!(now, "SelfTimeTracker::on_child_end called after end - ignored");
            return;
        }

        debug_assert!(
            self.running_children_count > 0,
            "on_child_end called without a running child"
        );
        if self.running_children_count == 0 {
            tracing::warn!(
                now,
                "SelfTimeTracker::on_child_end called without a running child - ignored"
            );
            return;
        }

        self.running_children_count -= 1;
        if self.running_children_count == 0 {
            self.segment_start = now;
        }
    }

    /// The owning segment ended at `now`
    ///
    /// If children are still running their time is already excluded, so only
    /// a timing tracker adds its final segment.
    pub fn end(&mut self, now: f64) {
        debug_assert!(!self.has_ended, "end called more than once");
        if self.has_ended {
            tracing::warn!(now, "SelfTimeTracker::end called more than once - ignored");
            return;
        }

        debug_assert!(
            self.running_children_count == 0,
            "end called while {} children are still running",
            self.running_children_count
        );
        if self.running_children_count == 0 {
            self.stop_timer(now);
        } else {
            tracing::warn!(
                now,
                running_children_count = self.running_children_count,
                "SelfTimeTracker::end called while children are still running"
            );
        }
        self.has_ended = true;
    }

    /// Total self time in microseconds; final once [`end`](Self::end) was called
    pub fn accumulated_self_time_in_microseconds(&self) -> f64 {
        self.accumulated_self_time_us
    }

    fn stop_timer(&mut self, now: f64) {
        self.accumulated_self_time_us += clamp_non_negative(now - self.segment_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_children() {
        let mut tracker = SelfTimeTracker::new(100.0);
        tracker.end(175.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 75.0);
        assert!(tracker.has_ended());
    }

    #[test]
    fn test_single_child() {
        let mut tracker = SelfTimeTracker::new(0.0);
        tracker.on_child_begin(10.0);
        assert_eq!(tracker.state(), TimerState::Suspended);
        tracker.on_child_end(30.0);
        assert_eq!(tracker.state(), TimerState::Timing);
        tracker.end(40.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 20.0);
    }

    #[test]
    fn test_overlapping_children() {
        let mut tracker = SelfTimeTracker::new(0.0);
        tracker.on_child_begin(5.0);
        tracker.on_child_begin(8.0);
        assert_eq!(tracker.running_children_count(), 2);
        tracker.on_child_end(15.0);
        assert_eq!(tracker.state(), TimerState::Suspended);
        tracker.on_child_end(20.0);
        tracker.end(25.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 10.0);
    }

    #[test]
    fn test_sequential_children() {
        let mut tracker = SelfTimeTracker::new(0.0);
        tracker.on_child_begin(10.0);
        tracker.on_child_end(20.0);
        tracker.on_child_begin(25.0);
        tracker.on_child_end(50.0);
        tracker.end(60.0);
        // 10 + 5 + 10
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 25.0);
    }

    #[test]
    fn test_clock_skew_is_clamped() {
        let mut tracker = SelfTimeTracker::new(100.0);
        tracker.on_child_begin(90.0);
        tracker.on_child_end(95.0);
        tracker.end(80.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 0.0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "children are still running"))]
    fn test_end_with_running_children_keeps_accounted_time() {
        let mut tracker = SelfTimeTracker::new(0.0);
        tracker.on_child_begin(10.0);
        tracker.end(40.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 10.0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "without a running child"))]
    fn test_unmatched_child_end_is_ignored() {
        let mut tracker = SelfTimeTracker::new(0.0);
        tracker.on_child_end(10.0);
        assert_eq!(tracker.running_children_count(), 0);
        tracker.end(20.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 20.0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "more than once"))]
    fn test_double_end_is_ignored() {
        let mut tracker = SelfTimeTracker::new(0.0);
        tracker.end(10.0);
        tracker.end(30.0);
        assert_eq!(tracker.accumulated_self_time_in_microseconds(), 10.0);
    }
}
